//! Escalation: handing an exhausted stage to an operator.
//!
//! The orchestrator builds an [`EscalationRequest`] and blocks on the
//! injected [`Escalator`] until it returns an [`EscalationResolution`].
//!
//! | Stage                                 | Options offered                        |
//! |---------------------------------------|----------------------------------------|
//! | required, accepts substitute output   | continue, abort, substitute output     |
//! | required                              | continue, abort                        |
//! | non-required                          | continue, abort (abort = skip stage)   |

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::stage::{StageDefinition, StageOutput, ValidationResult};

/// A choice offered to the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationOption {
    /// Commit the last attempt's raw output, tagged unvalidated.
    Continue,
    /// Abort the run (required stage) or skip the stage (non-required).
    Abort,
    /// Commit operator-supplied data instead.
    SubstituteOutput,
}

impl std::fmt::Display for EscalationOption {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EscalationOption::Continue => "continue",
            EscalationOption::Abort => "abort",
            EscalationOption::SubstituteOutput => "substitute_output",
        };
        write!(f, "{s}")
    }
}

/// The operator's answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "resolution", rename_all = "snake_case")]
pub enum EscalationResolution {
    Continue,
    Abort,
    SubstituteOutput { data: Value },
}

impl EscalationResolution {
    pub fn option(&self) -> EscalationOption {
        match self {
            EscalationResolution::Continue => EscalationOption::Continue,
            EscalationResolution::Abort => EscalationOption::Abort,
            EscalationResolution::SubstituteOutput { .. } => EscalationOption::SubstituteOutput,
        }
    }
}

/// Everything an operator needs to decide.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationRequest {
    pub run_id: Uuid,
    pub stage: String,
    pub required: bool,
    pub attempts_used: u32,
    /// Validation verdict of the last attempt, when the worker returned.
    pub last_validation: Option<ValidationResult>,
    /// Worker error of the last attempt, when it failed outright.
    pub last_error: Option<String>,
    /// Raw output of the last attempt, if any.
    pub last_output: Option<StageOutput>,
    pub options: Vec<EscalationOption>,
}

impl EscalationRequest {
    pub fn new(
        run_id: Uuid,
        definition: &StageDefinition,
        attempts_used: u32,
        last_validation: Option<ValidationResult>,
        last_error: Option<String>,
        last_output: Option<StageOutput>,
    ) -> Self {
        let mut options = vec![EscalationOption::Continue, EscalationOption::Abort];
        if definition.required && definition.accepts_substitute {
            options.push(EscalationOption::SubstituteOutput);
        }
        Self {
            run_id,
            stage: definition.name.clone(),
            required: definition.required,
            attempts_used,
            last_validation,
            last_error,
            last_output,
            options,
        }
    }

    /// Why the stage failed, in one line.
    pub fn message(&self) -> &str {
        match (&self.last_validation, &self.last_error) {
            (Some(v), _) => &v.message,
            (None, Some(e)) => e,
            (None, None) => "stage failed",
        }
    }

    pub fn offers(&self, option: EscalationOption) -> bool {
        self.options.contains(&option)
    }
}

/// Presents an escalation and waits for the operator.
#[async_trait]
pub trait Escalator: Send + Sync {
    async fn present_escalation(&self, request: &EscalationRequest) -> EscalationResolution;
}

/// Non-interactive resolution strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationPolicy {
    #[default]
    AlwaysAbort,
    AlwaysContinue,
}

/// Resolves every escalation with a fixed policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct PolicyEscalator {
    policy: EscalationPolicy,
}

impl PolicyEscalator {
    pub fn new(policy: EscalationPolicy) -> Self {
        Self { policy }
    }

    pub fn always_abort() -> Self {
        Self::new(EscalationPolicy::AlwaysAbort)
    }

    pub fn always_continue() -> Self {
        Self::new(EscalationPolicy::AlwaysContinue)
    }
}

#[async_trait]
impl Escalator for PolicyEscalator {
    async fn present_escalation(&self, request: &EscalationRequest) -> EscalationResolution {
        tracing::debug!(stage = %request.stage, policy = ?self.policy, "policy escalation");
        match self.policy {
            EscalationPolicy::AlwaysAbort => EscalationResolution::Abort,
            EscalationPolicy::AlwaysContinue => EscalationResolution::Continue,
        }
    }
}
