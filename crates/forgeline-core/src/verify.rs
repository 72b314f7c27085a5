//! Postcondition verification for mutating capabilities.
//!
//! After a write, edit or command succeeds, the verifier independently
//! re-reads the affected resource and checks a cheap structural proxy of the
//! claimed effect. Findings are returned as issues; the verifier never fails
//! an invocation on its own.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::capability::{CapabilityId, SideEffect};
use crate::registry::ExecutionContext;

/// Tunables for the structural checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifierConfig {
    /// Absolute line-count slack allowed after a write.
    pub line_tolerance: usize,
    /// Relative slack (fraction of the intended line count).
    pub line_tolerance_ratio: f64,
    /// Substrings that mark unfinished content in written files.
    pub placeholder_markers: Vec<String>,
    /// Lowercase substrings that mark a failed command in its output.
    pub failure_markers: Vec<String>,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            line_tolerance: 2,
            line_tolerance_ratio: 0.1,
            placeholder_markers: [
                "TODO: implement",
                "... existing code ...",
                "// rest of the code",
                "# rest of the code",
                "<placeholder>",
                "unimplemented!()",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            failure_markers: [
                "command not found",
                "traceback (most recent call last)",
                "panicked at",
                "segmentation fault",
                "fatal error",
                "npm err!",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

/// Result of one verification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub success: bool,
    pub issues: Vec<String>,
}

impl VerificationReport {
    fn from_issues(issues: Vec<String>) -> Self {
        Self {
            success: issues.is_empty(),
            issues,
        }
    }
}

/// Re-checks the effect of mutating capability calls.
#[derive(Debug, Clone, Default)]
pub struct PostconditionVerifier {
    config: VerifierConfig,
}

impl PostconditionVerifier {
    pub fn new(config: VerifierConfig) -> Self {
        Self { config }
    }

    pub fn applies_to(capability: &CapabilityId) -> bool {
        capability.side_effect() != SideEffect::None
    }

    /// Verify the effect of `capability`; `None` when the capability has no
    /// observable side effect.
    pub async fn verify(
        &self,
        capability: &CapabilityId,
        arguments: &Value,
        result_text: &str,
        ctx: &ExecutionContext,
    ) -> Option<VerificationReport> {
        let issues = match capability.side_effect() {
            SideEffect::None => return None,
            SideEffect::FileWrite => self.verify_write(arguments, ctx).await,
            SideEffect::FileEdit => verify_edit(arguments, ctx).await,
            SideEffect::Command => self.verify_command(result_text),
        };
        Some(VerificationReport::from_issues(issues))
    }

    async fn verify_write(&self, arguments: &Value, ctx: &ExecutionContext) -> Vec<String> {
        let Some(path) = arguments.get("path").and_then(Value::as_str) else {
            return vec!["write has no 'path' argument to verify".to_string()];
        };
        let actual = match read_back(ctx, path).await {
            Ok(text) => text,
            Err(issue) => return vec![issue.replace("{op}", "write")],
        };

        let mut issues = Vec::new();
        if let Some(intended) = arguments.get("content").and_then(Value::as_str) {
            let expected = intended.lines().count();
            let found = actual.lines().count();
            let slack = self
                .config
                .line_tolerance
                .max((expected as f64 * self.config.line_tolerance_ratio).ceil() as usize);
            if expected.abs_diff(found) > slack {
                issues.push(format!(
                    "line count mismatch after write: expected about {expected} lines, found {found}"
                ));
            }
            if found == 0 && expected > 0 {
                issues.push("file is empty after write".to_string());
            }
        }
        for marker in &self.config.placeholder_markers {
            if actual.contains(marker.as_str()) {
                issues.push(format!("placeholder marker '{marker}' found in {path}"));
            }
        }
        issues
    }

    fn verify_command(&self, output: &str) -> Vec<String> {
        let lower = output.to_lowercase();
        self.config
            .failure_markers
            .iter()
            .filter(|m| lower.contains(&m.to_lowercase()))
            .map(|m| format!("failure marker '{m}' found in command output"))
            .collect()
    }
}

async fn verify_edit(arguments: &Value, ctx: &ExecutionContext) -> Vec<String> {
    let Some(path) = arguments.get("path").and_then(Value::as_str) else {
        return vec!["edit has no 'path' argument to verify".to_string()];
    };
    let actual = match read_back(ctx, path).await {
        Ok(text) => text,
        Err(issue) => return vec![issue.replace("{op}", "edit")],
    };

    let old = arguments
        .get("old_string")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let new = arguments
        .get("new_string")
        .and_then(Value::as_str)
        .unwrap_or_default();

    let mut issues = Vec::new();
    if !new.is_empty() && !actual.contains(new) {
        issues.push("new fragment not present after edit".to_string());
    }
    if !old.is_empty() && !new.contains(old) && actual.contains(old) {
        issues.push("old fragment still present after edit".to_string());
    }
    issues
}

/// Re-read `path`; the error string carries an `{op}` slot for the caller.
async fn read_back(ctx: &ExecutionContext, path: &str) -> Result<String, String> {
    match tokio::fs::read_to_string(ctx.resolve(path)).await {
        Ok(text) => Ok(text),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err("file not found after {op}".to_string())
        }
        Err(e) => Err(format!("could not re-read {path} after {{op}}: {e}")),
    }
}
