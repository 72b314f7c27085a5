//! Orchestrator configuration.
//!
//! Passed explicitly into [`crate::Orchestrator::new`]. Loadable from TOML:
//!
//! ```toml
//! max_attempts = 3
//! tool_timeout_ms = 120000
//! recovery_max_attempts = 3
//! verify_postconditions = true
//!
//! [verifier]
//! line_tolerance = 2
//!
//! [recovery.actions]
//! missing_resource = "resolve_path"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::recovery::RecoveryPlaybook;
use crate::verify::VerifierConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Attempts per stage before escalation.
    pub max_attempts: u32,
    /// Per-invocation handler timeout.
    pub tool_timeout_ms: u64,
    /// Calls per capability invocation, recovery retries included.
    pub recovery_max_attempts: u32,
    pub verify_postconditions: bool,
    pub verifier: VerifierConfig,
    pub recovery: RecoveryPlaybook,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            tool_timeout_ms: 120_000,
            recovery_max_attempts: 3,
            verify_postconditions: true,
            verifier: VerifierConfig::default(),
            recovery: RecoveryPlaybook::standard(),
        }
    }
}

impl OrchestratorConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(PipelineError::InvalidConfig(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if self.recovery_max_attempts == 0 {
            return Err(PipelineError::InvalidConfig(
                "recovery_max_attempts must be at least 1".to_string(),
            ));
        }
        if self.tool_timeout_ms == 0 {
            return Err(PipelineError::InvalidConfig(
                "tool_timeout_ms must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.verifier.line_tolerance_ratio) {
            return Err(PipelineError::InvalidConfig(format!(
                "verifier.line_tolerance_ratio must be within 0..=1, got {}",
                self.verifier.line_tolerance_ratio
            )));
        }
        Ok(())
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_millis(self.tool_timeout_ms)
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_tool_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_recovery(mut self, playbook: RecoveryPlaybook, max_attempts: u32) -> Self {
        self.recovery = playbook;
        self.recovery_max_attempts = max_attempts;
        self
    }

    pub fn without_verification(mut self) -> Self {
        self.verify_postconditions = false;
        self
    }
}
