//! Shell command execution.

use std::process::Stdio;

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;

use crate::registry::{CapabilityHandler, CapabilityOutcome, ExecutionContext};

/// Exit status `sh` uses when the program cannot be found.
const EXIT_NOT_FOUND: i32 = 127;

/// `run_shell { command }`, run with `sh -c` in the working directory.
///
/// The child is killed if the call is dropped (timeout or cancellation).
#[derive(Debug, Clone, Copy, Default)]
pub struct RunShellHandler;

#[async_trait]
impl CapabilityHandler for RunShellHandler {
    async fn execute(
        &self,
        arguments: &Value,
        ctx: &ExecutionContext,
    ) -> anyhow::Result<CapabilityOutcome> {
        let Some(command) = arguments.get("command").and_then(Value::as_str) else {
            return Ok(CapabilityOutcome::failure("argument 'command' must be a string"));
        };

        let output = match Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&ctx.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
        {
            Ok(output) => output,
            Err(e) => {
                return Ok(CapabilityOutcome::failure(format!(
                    "failed to spawn shell: {e}"
                )))
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let code = output.status.code().unwrap_or(-1);
        tracing::debug!(command = %command, exit_code = code, "shell command finished");

        if output.status.success() {
            let mut text = stdout.into_owned();
            if !stderr.trim().is_empty() {
                text.push_str(&stderr);
            }
            return Ok(CapabilityOutcome::success(text));
        }

        let mut error = if code == EXIT_NOT_FOUND {
            let program = command.split_whitespace().next().unwrap_or_default();
            format!("command not found: {program} (exit code {code})")
        } else {
            format!("command failed with exit code {code}")
        };
        for stream in [stderr.trim(), stdout.trim()] {
            if !stream.is_empty() {
                error.push('\n');
                error.push_str(stream);
            }
        }
        Ok(CapabilityOutcome::failure(error))
    }
}
