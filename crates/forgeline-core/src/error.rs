//! Error taxonomy for forgeline.

use serde::{Deserialize, Serialize};

/// Errors produced while building or persisting a pipeline.
///
/// Stage-level failures are not errors: they are reported through
/// [`crate::report::PipelineRunResult`]. This type covers misconfiguration,
/// I/O and artifact integrity.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("invalid pipeline configuration: {0}")]
    InvalidConfig(String),

    #[error("duplicate stage name: {0}")]
    DuplicateStage(String),

    #[error("duplicate capability registration: {0}")]
    DuplicateCapability(String),

    #[error("stage output for '{0}' is already committed")]
    AlreadyCommitted(String),

    #[error("invalid run id '{0}': expected a UUID")]
    InvalidRunId(String),

    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for forgeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Why a stage (or the run) did not produce validated output.
///
/// Attached to stage reports so a failed run is explainable from the result
/// object alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// A capability outside the stage's allow-list was attempted.
    BoundaryViolation,
    /// A capability handler reported an error that recovery could not fix.
    CapabilityError,
    /// A postcondition check found a mismatch the validator judged disqualifying.
    VerificationIssue,
    /// The stage output did not meet its contract.
    ValidationFailure,
    /// An operator declined to continue after escalation.
    EscalationAbort,
    /// A required stage exhausted retries and the run was aborted.
    RunAbort,
    /// The run was cancelled externally.
    Cancelled,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureKind::BoundaryViolation => "boundary_violation",
            FailureKind::CapabilityError => "capability_error",
            FailureKind::VerificationIssue => "verification_issue",
            FailureKind::ValidationFailure => "validation_failure",
            FailureKind::EscalationAbort => "escalation_abort",
            FailureKind::RunAbort => "run_abort",
            FailureKind::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}
