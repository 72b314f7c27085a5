//! File read, write and edit.

use async_trait::async_trait;
use serde_json::Value;

use crate::registry::{CapabilityHandler, CapabilityOutcome, ExecutionContext};

/// Conventional error text for an I/O failure, so the recovery classifier
/// recognises it.
pub(crate) fn io_failure(op: &str, path: &str, e: &std::io::Error) -> String {
    match e.kind() {
        std::io::ErrorKind::NotFound => format!("ENOENT: no such file or directory, {op} '{path}'"),
        std::io::ErrorKind::PermissionDenied => format!("EACCES: permission denied, {op} '{path}'"),
        _ => format!("{op} '{path}' failed: {e}"),
    }
}

fn str_arg<'a>(arguments: &'a Value, field: &str) -> Result<&'a str, CapabilityOutcome> {
    arguments
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| CapabilityOutcome::failure(format!("argument '{field}' must be a string")))
}

/// `read_file { path }`
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadFileHandler;

#[async_trait]
impl CapabilityHandler for ReadFileHandler {
    async fn execute(
        &self,
        arguments: &Value,
        ctx: &ExecutionContext,
    ) -> anyhow::Result<CapabilityOutcome> {
        let path = match str_arg(arguments, "path") {
            Ok(p) => p,
            Err(outcome) => return Ok(outcome),
        };
        Ok(match tokio::fs::read_to_string(ctx.resolve(path)).await {
            Ok(text) => CapabilityOutcome::success(text),
            Err(e) => CapabilityOutcome::failure(io_failure("open", path, &e)),
        })
    }
}

/// `write_file { path, content }`. Does not create missing parent
/// directories.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteFileHandler;

#[async_trait]
impl CapabilityHandler for WriteFileHandler {
    async fn execute(
        &self,
        arguments: &Value,
        ctx: &ExecutionContext,
    ) -> anyhow::Result<CapabilityOutcome> {
        let (path, content) = match (str_arg(arguments, "path"), str_arg(arguments, "content")) {
            (Ok(p), Ok(c)) => (p, c),
            (Err(outcome), _) | (_, Err(outcome)) => return Ok(outcome),
        };
        let target = ctx.resolve(path);
        if let Some(parent) = target.parent() {
            if !parent.as_os_str().is_empty() && !tokio::fs::try_exists(parent).await.unwrap_or(false) {
                return Ok(CapabilityOutcome::failure(format!(
                    "parent directory does not exist: {}",
                    parent.display()
                )));
            }
        }
        Ok(match tokio::fs::write(&target, content).await {
            Ok(()) => CapabilityOutcome::success(format!(
                "wrote {} bytes to {path}",
                content.len()
            )),
            Err(e) => CapabilityOutcome::failure(io_failure("write", path, &e)),
        })
    }
}

/// `edit_file { path, old_string, new_string, replace_all? }`. Without
/// `replace_all` the old fragment must match exactly once.
#[derive(Debug, Clone, Copy, Default)]
pub struct EditFileHandler;

#[async_trait]
impl CapabilityHandler for EditFileHandler {
    async fn execute(
        &self,
        arguments: &Value,
        ctx: &ExecutionContext,
    ) -> anyhow::Result<CapabilityOutcome> {
        let (path, old, new) = match (
            str_arg(arguments, "path"),
            str_arg(arguments, "old_string"),
            str_arg(arguments, "new_string"),
        ) {
            (Ok(p), Ok(o), Ok(n)) => (p, o, n),
            (Err(outcome), _, _) | (_, Err(outcome), _) | (_, _, Err(outcome)) => {
                return Ok(outcome)
            }
        };
        if old.is_empty() {
            return Ok(CapabilityOutcome::failure("old_string must not be empty"));
        }
        let replace_all = arguments
            .get("replace_all")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let target = ctx.resolve(path);
        let text = match tokio::fs::read_to_string(&target).await {
            Ok(text) => text,
            Err(e) => return Ok(CapabilityOutcome::failure(io_failure("open", path, &e))),
        };
        let matches = text.matches(old).count();
        let updated = match (matches, replace_all) {
            (0, _) => {
                return Ok(CapabilityOutcome::failure(format!(
                    "old_string has no match in {path}"
                )))
            }
            (1, _) | (_, true) => text.replace(old, new),
            (n, false) => {
                return Ok(CapabilityOutcome::failure(format!(
                    "old_string matches {n} times in {path}; add context or set replace_all"
                )))
            }
        };
        Ok(match tokio::fs::write(&target, updated).await {
            Ok(()) => CapabilityOutcome::success(format!("replaced {matches} occurrence(s) in {path}")),
            Err(e) => CapabilityOutcome::failure(io_failure("write", path, &e)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recovery::{classify_error, ErrorCategory};
    use serde_json::json;
    use uuid::Uuid;

    fn ctx(dir: &std::path::Path) -> ExecutionContext {
        ExecutionContext::new(dir, Uuid::nil(), "test")
    }

    fn error_of(outcome: CapabilityOutcome) -> String {
        match outcome {
            CapabilityOutcome::Failure { error } => error,
            CapabilityOutcome::Success { text } => panic!("expected failure, got {text}"),
        }
    }

    #[tokio::test]
    async fn test_read_missing_is_enoent() {
        let dir = tempfile::tempdir().unwrap();
        let out = ReadFileHandler
            .execute(&json!({"path": "nope.txt"}), &ctx(dir.path()))
            .await
            .unwrap();
        let error = error_of(out);
        assert_eq!(classify_error(&error), Some(ErrorCategory::MissingResource));
    }

    #[tokio::test]
    async fn test_write_refuses_missing_parent() {
        let dir = tempfile::tempdir().unwrap();
        let out = WriteFileHandler
            .execute(&json!({"path": "a/b/c.txt", "content": "x"}), &ctx(dir.path()))
            .await
            .unwrap();
        assert_eq!(
            classify_error(&error_of(out)),
            Some(ErrorCategory::MissingParentDirectory)
        );
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let c = ctx(dir.path());
        let out = WriteFileHandler
            .execute(&json!({"path": "a.txt", "content": "hello\n"}), &c)
            .await
            .unwrap();
        assert!(out.is_success());
        let out = ReadFileHandler
            .execute(&json!({"path": "a.txt"}), &c)
            .await
            .unwrap();
        assert_eq!(out, CapabilityOutcome::success("hello\n"));
    }

    #[tokio::test]
    async fn test_edit_requires_unique_match() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("c.py"), "x - y\nx - y\n").unwrap();
        let c = ctx(dir.path());
        let args = json!({"path": "c.py", "old_string": "x - y", "new_string": "x / y"});
        let out = EditFileHandler.execute(&args, &c).await.unwrap();
        assert!(error_of(out).contains("matches 2 times"));

        let mut all = args.clone();
        all["replace_all"] = json!(true);
        let out = EditFileHandler.execute(&all, &c).await.unwrap();
        assert!(out.is_success());
        assert_eq!(
            std::fs::read_to_string(dir.path().join("c.py")).unwrap(),
            "x / y\nx / y\n"
        );
    }

    #[tokio::test]
    async fn test_edit_without_match_is_unclassified() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("c.py"), "a\n").unwrap();
        let out = EditFileHandler
            .execute(
                &json!({"path": "c.py", "old_string": "zzz", "new_string": "y"}),
                &ctx(dir.path()),
            )
            .await
            .unwrap();
        assert_eq!(classify_error(&error_of(out)), None);
    }

    #[tokio::test]
    async fn test_non_string_argument() {
        let dir = tempfile::tempdir().unwrap();
        let out = ReadFileHandler
            .execute(&json!({"path": 3}), &ctx(dir.path()))
            .await
            .unwrap();
        assert_eq!(error_of(out), "argument 'path' must be a string");
    }
}
