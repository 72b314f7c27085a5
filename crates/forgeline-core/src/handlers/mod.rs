//! Built-in capability handlers.
//!
//! Expected failures are returned as [`CapabilityOutcome::Failure`] with
//! conventional markers (`ENOENT`, `EACCES`, `command not found`,
//! `parent directory does not exist`) so the recovery classifier can act on
//! them. Handlers only return `Err` for faults such as a panicked blocking
//! task.
//!
//! [`CapabilityOutcome::Failure`]: crate::registry::CapabilityOutcome::Failure

pub mod fs;
pub mod search;
pub mod shell;
pub mod web;

pub use fs::{EditFileHandler, ReadFileHandler, WriteFileHandler};
pub use search::{glob_matcher, GlobHandler, GlobMatcher, GrepHandler};
pub use shell::RunShellHandler;
pub use web::WebFetchHandler;

use serde_json::json;

use crate::capability::CapabilityId;
use crate::error::Result;
use crate::registry::{CapabilityRegistry, CapabilitySpec};

pub(crate) use search::is_skipped;

/// Registry with every built-in handler. `code_search` is left to callers.
pub fn builtin_registry() -> Result<CapabilityRegistry> {
    let mut registry = CapabilityRegistry::new();
    registry.register(
        CapabilitySpec::new(CapabilityId::ReadFile, "Read a text file.").with_required(["path"]),
        ReadFileHandler,
    )?;
    registry.register(
        CapabilitySpec::new(
            CapabilityId::WriteFile,
            "Write a text file. The parent directory must exist.",
        )
        .with_required(["path", "content"]),
        WriteFileHandler,
    )?;
    registry.register(
        CapabilitySpec::new(
            CapabilityId::EditFile,
            "Replace an exact fragment of a file; it must match once unless replace_all is set.",
        )
        .with_required(["path", "old_string", "new_string"])
        .with_schema(json!({
            "type": "object",
            "properties": {
                "path": {"type": "string"},
                "old_string": {"type": "string"},
                "new_string": {"type": "string"},
                "replace_all": {"type": "boolean"}
            },
            "required": ["path", "old_string", "new_string"]
        })),
        EditFileHandler,
    )?;
    registry.register(
        CapabilitySpec::new(CapabilityId::RunShell, "Run a command with sh -c in the working directory.")
            .with_required(["command"]),
        RunShellHandler,
    )?;
    registry.register(
        CapabilitySpec::new(CapabilityId::Glob, "List files matching a glob pattern.")
            .with_required(["pattern"])
            .with_schema(json!({
                "type": "object",
                "properties": {
                    "pattern": {"type": "string"},
                    "path": {"type": "string"}
                },
                "required": ["pattern"]
            })),
        GlobHandler,
    )?;
    registry.register(
        CapabilitySpec::new(CapabilityId::Grep, "Search file contents with a regular expression.")
            .with_required(["pattern"])
            .with_schema(json!({
                "type": "object",
                "properties": {
                    "pattern": {"type": "string"},
                    "path": {"type": "string"},
                    "glob": {"type": "string"}
                },
                "required": ["pattern"]
            })),
        GrepHandler,
    )?;
    let fetch = WebFetchHandler::new()
        .map_err(|e| crate::error::PipelineError::InvalidConfig(format!("http client: {e}")))?;
    registry.register(
        CapabilitySpec::new(CapabilityId::WebFetch, "Fetch a URL over HTTP(S).").with_required(["url"]),
        fetch,
    )?;
    Ok(registry)
}
