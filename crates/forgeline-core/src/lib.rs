//! Forgeline Core Library
//!
//! Pipeline orchestration for agentic coding tasks: a fixed sequence of
//! stages, each gated by validation, each confined to a capability
//! allow-list, with bounded retry, operator escalation and classified
//! recovery of capability failures.

pub mod agent;
pub mod artifact;
pub mod cancel;
pub mod capability;
pub mod config;
pub mod context;
pub mod error;
pub mod escalation;
pub mod extract;
pub mod fakes;
pub mod handlers;
pub mod invoker;
pub mod metrics;
pub mod obs;
pub mod orchestrator;
pub mod recovery;
pub mod registry;
pub mod report;
pub mod scripted;
pub mod stage;
pub mod telemetry;
pub mod validation;
pub mod verify;

pub use agent::{AgentStage, ChatBackend, ChatMessage, ChatReply};
pub use artifact::{read_run_report, write_run_report};
pub use cancel::{cancel_pair, CancelHandle, CancelSignal};
pub use capability::{CapabilityId, CapabilitySet, SideEffect};
pub use config::OrchestratorConfig;
pub use context::{CommittedOutput, InvocationLog, PipelineContext, Provenance};
pub use error::{FailureKind, PipelineError, Result};
pub use escalation::{
    EscalationOption, EscalationPolicy, EscalationRequest, EscalationResolution, Escalator,
    PolicyEscalator,
};
pub use handlers::builtin_registry;
pub use invoker::{InvocationRecord, InvocationResult, StageTools, ToolInvoker};
pub use metrics::{MetricsSnapshot, RunMetrics};
pub use orchestrator::{AttemptFailure, Orchestrator, RetryAttempt, StageState};
pub use recovery::{
    classify_error, ErrorCategory, RecoveryAction, RecoveryLayer, RecoveryPlaybook, RecoveryReport,
    StopReason,
};
pub use registry::{
    CapabilityHandler, CapabilityOutcome, CapabilityRegistry, CapabilitySpec, ExecutionContext,
};
pub use report::{EscalationDecision, PipelineRunResult, StageOutcome, StageReport};
pub use scripted::{PipelineDefinition, ScriptedStage, ScriptedStageSpec};
pub use stage::{Stage, StageDefinition, StageInput, StageOutput, ValidationResult};
pub use validation::{ValidationRule, ValidationRuleSet};
pub use verify::{PostconditionVerifier, VerificationReport, VerifierConfig};

/// Forgeline version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
