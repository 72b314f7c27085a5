//! Side-effecting / argument-rewriting recovery actions.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::capability::CapabilityId;
use crate::handlers::is_skipped;
use crate::registry::ExecutionContext;

use super::classify::ErrorCategory;
use super::playbook::{RecoveryAction, RecoveryPlaybook};

/// Errors raised by a recovery action itself.
#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    #[error("{action} needs a string '{field}' argument")]
    MissingArgument {
        action: RecoveryAction,
        field: &'static str,
    },

    #[error("no candidate found for '{path}'")]
    NoCandidate { path: String },

    #[error("'{path}' is ambiguous: {count} candidates")]
    AmbiguousCandidate { path: String, count: usize },

    #[error("no substitute registered for program '{program}'")]
    NoSubstitution { program: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// An alternate invocation swapped in by a recovery action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Substitution {
    pub from: String,
    pub to: String,
}

/// Record of one applied recovery, kept on the invocation for observability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedRecovery {
    /// Attempt whose failure triggered the action (1-based).
    pub attempt: u32,
    pub category: ErrorCategory,
    pub action: RecoveryAction,
    pub detail: String,
    pub substitution: Option<Substitution>,
}

/// Apply `action` for a failure of `capability`.
///
/// May rewrite `arguments` in place; the caller re-invokes the same
/// capability with the rewritten arguments.
pub async fn apply_action(
    action: RecoveryAction,
    category: ErrorCategory,
    attempt: u32,
    capability: &CapabilityId,
    arguments: &mut Value,
    ctx: &ExecutionContext,
    playbook: &RecoveryPlaybook,
) -> Result<AppliedRecovery, RecoveryError> {
    tracing::debug!(capability = %capability, %category, %action, attempt, "applying recovery action");
    let (detail, substitution) = match action {
        RecoveryAction::CreateParentDirectory => {
            let path = string_arg(arguments, "path", action)?;
            let target = ctx.resolve(&path);
            let parent = target
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| ctx.working_dir.clone());
            tokio::fs::create_dir_all(&parent).await?;
            (format!("created directory {}", parent.display()), None)
        }
        RecoveryAction::ResolvePath => {
            let path = string_arg(arguments, "path", action)?;
            let resolved = resolve_unique_candidate(ctx, &path).await?;
            arguments["path"] = Value::String(resolved.clone());
            (format!("resolved '{path}' to '{resolved}'"), None)
        }
        RecoveryAction::SubstituteCommand => {
            let command = string_arg(arguments, "command", action)?;
            let trimmed = command.trim_start();
            let program = trimmed.split_whitespace().next().unwrap_or_default();
            let sub = playbook
                .substitute_for(program)
                .ok_or_else(|| RecoveryError::NoSubstitution {
                    program: program.to_string(),
                })?;
            let rewritten = format!("{}{}", sub.to, &trimmed[program.len()..]);
            arguments["command"] = Value::String(rewritten.clone());
            (
                format!("rewrote command to '{rewritten}'"),
                Some(Substitution {
                    from: sub.from.clone(),
                    to: sub.to.clone(),
                }),
            )
        }
        RecoveryAction::RetryUnchanged => ("retrying with unchanged arguments".to_string(), None),
    };

    Ok(AppliedRecovery {
        attempt,
        category,
        action,
        detail,
        substitution,
    })
}

fn string_arg(
    arguments: &Value,
    field: &'static str,
    action: RecoveryAction,
) -> Result<String, RecoveryError> {
    arguments
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or(RecoveryError::MissingArgument { action, field })
}

/// Find the single file named like `path` under the working directory.
///
/// Returns the candidate relative to the working directory.
async fn resolve_unique_candidate(
    ctx: &ExecutionContext,
    path: &str,
) -> Result<String, RecoveryError> {
    let original = ctx.resolve(path);
    let Some(file_name) = original.file_name().map(|n| n.to_os_string()) else {
        return Err(RecoveryError::NoCandidate {
            path: path.to_string(),
        });
    };
    let root = ctx.working_dir.clone();

    let candidates: Vec<PathBuf> = tokio::task::spawn_blocking(move || {
        walkdir::WalkDir::new(&root)
            .into_iter()
            .filter_entry(|e| !is_skipped(e))
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file() && e.file_name() == file_name.as_os_str())
            .map(|e| e.into_path())
            .collect()
    })
    .await?;

    match candidates.as_slice() {
        [] => Err(RecoveryError::NoCandidate {
            path: path.to_string(),
        }),
        [only] if *only == original => Err(RecoveryError::NoCandidate {
            path: path.to_string(),
        }),
        [only] => Ok(only
            .strip_prefix(&ctx.working_dir)
            .unwrap_or(only)
            .to_string_lossy()
            .into_owned()),
        many => Err(RecoveryError::AmbiguousCandidate {
            path: path.to_string(),
            count: many.len(),
        }),
    }
}
