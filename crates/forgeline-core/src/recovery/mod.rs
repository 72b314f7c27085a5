//! Recovery layer: bounded-retry capability execution.
//!
//! Wraps a single capability call. On failure the error text is classified
//! ([`classify`]), the playbook picks at most one automated action per
//! category ([`playbook`]), the action runs ([`actions`]) and the original
//! capability is re-invoked. Unclassified errors, categories without an
//! action, failing actions and categories that recur after their action
//! already ran all stop the loop immediately.
//!
//! # Modules
//!
//! - [`classify`]: `ErrorCategory`, `classify_error()`
//! - [`playbook`]: `RecoveryAction`, `RecoveryPlaybook`
//! - [`actions`]: `apply_action()`, `AppliedRecovery`, `RecoveryError`

pub mod actions;
pub mod classify;
pub mod playbook;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::cancel::CancelSignal;
use crate::capability::CapabilityId;
use crate::registry::{CapabilityOutcome, CapabilityRegistry, ExecutionContext};

pub use actions::{apply_action, AppliedRecovery, RecoveryError, Substitution};
pub use classify::{classify_error, ErrorCategory};
pub use playbook::{CommandSubstitution, RecoveryAction, RecoveryPlaybook};

/// Why the recovery loop stopped without success.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum StopReason {
    /// No capability with this id is registered.
    UnknownCapability,
    /// The handler raised an unexpected fault.
    HandlerFault,
    /// The error matched no known category.
    Unclassified,
    /// The category has no automated action.
    NoAction { category: ErrorCategory },
    /// The category's action already ran for this invocation.
    RepeatedCategory { category: ErrorCategory },
    /// The recovery action itself failed.
    ActionFailed {
        category: ErrorCategory,
        error: String,
    },
    /// `max_attempts` calls were made.
    Exhausted,
    /// The run was cancelled while the capability was in flight.
    Cancelled,
}

/// Outcome of [`RecoveryLayer::execute_with_recovery`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryReport {
    pub success: bool,
    /// Success payload.
    pub output: Option<String>,
    /// Last error on failure.
    pub error: Option<String>,
    pub attempts_used: u32,
    pub recovery_applied: Vec<AppliedRecovery>,
    /// Arguments of the final call (may differ after a rewrite).
    pub final_arguments: Value,
    /// Category of the last classified error, if any.
    pub category: Option<ErrorCategory>,
    pub stop_reason: Option<StopReason>,
}

impl RecoveryReport {
    fn failed(
        error: String,
        attempts_used: u32,
        recovery_applied: Vec<AppliedRecovery>,
        final_arguments: Value,
        category: Option<ErrorCategory>,
        reason: StopReason,
    ) -> Self {
        Self {
            success: false,
            output: None,
            error: Some(error),
            attempts_used,
            recovery_applied,
            final_arguments,
            category,
            stop_reason: Some(reason),
        }
    }
}

enum CallResult {
    Outcome(CapabilityOutcome),
    Fault(String),
    TimedOut,
    Cancelled,
}

/// Executes capabilities with classification-driven recovery.
#[derive(Debug, Clone)]
pub struct RecoveryLayer {
    registry: Arc<CapabilityRegistry>,
    playbook: RecoveryPlaybook,
    call_timeout: Duration,
}

impl RecoveryLayer {
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        playbook: RecoveryPlaybook,
        call_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            playbook,
            call_timeout,
        }
    }

    pub fn playbook(&self) -> &RecoveryPlaybook {
        &self.playbook
    }

    /// Call `capability` up to `max_attempts` times, applying at most one
    /// recovery action per error category in between.
    pub async fn execute_with_recovery(
        &self,
        capability: &CapabilityId,
        arguments: &Value,
        max_attempts: u32,
        ctx: &ExecutionContext,
        cancel: &CancelSignal,
    ) -> RecoveryReport {
        let max_attempts = max_attempts.max(1);
        let mut args = arguments.clone();
        let mut applied: Vec<AppliedRecovery> = Vec::new();
        let mut used: HashSet<ErrorCategory> = HashSet::new();

        let Some(entry) = self.registry.get(capability) else {
            return RecoveryReport::failed(
                format!("unknown capability '{capability}'"),
                0,
                applied,
                args,
                None,
                StopReason::UnknownCapability,
            );
        };

        let mut last_error = String::new();
        let mut last_category = None;

        for attempt in 1..=max_attempts {
            let call = async {
                match tokio::time::timeout(self.call_timeout, entry.handler.execute(&args, ctx))
                    .await
                {
                    Ok(Ok(outcome)) => CallResult::Outcome(outcome),
                    Ok(Err(fault)) => CallResult::Fault(format!("{fault:#}")),
                    Err(_) => CallResult::TimedOut,
                }
            };
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => CallResult::Cancelled,
                r = call => r,
            };

            last_error = match result {
                CallResult::Outcome(CapabilityOutcome::Success { text }) => {
                    return RecoveryReport {
                        success: true,
                        output: Some(text),
                        error: None,
                        attempts_used: attempt,
                        recovery_applied: applied,
                        final_arguments: args,
                        category: last_category,
                        stop_reason: None,
                    };
                }
                CallResult::Outcome(CapabilityOutcome::Failure { error }) => error,
                CallResult::TimedOut => format!(
                    "capability '{capability}' timed out after {}ms",
                    self.call_timeout.as_millis()
                ),
                CallResult::Fault(fault) => {
                    warn!(capability = %capability, error = %fault, "capability handler fault");
                    return RecoveryReport::failed(
                        format!("handler fault: {fault}"),
                        attempt,
                        applied,
                        args,
                        None,
                        StopReason::HandlerFault,
                    );
                }
                CallResult::Cancelled => {
                    return RecoveryReport::failed(
                        "cancelled".to_string(),
                        attempt,
                        applied,
                        args,
                        last_category,
                        StopReason::Cancelled,
                    );
                }
            };

            let Some(category) = classify_error(&last_error) else {
                debug!(capability = %capability, attempt, "unclassified capability error");
                return RecoveryReport::failed(
                    last_error,
                    attempt,
                    applied,
                    args,
                    None,
                    StopReason::Unclassified,
                );
            };
            last_category = Some(category);

            if attempt == max_attempts {
                break;
            }

            if !used.insert(category) {
                return RecoveryReport::failed(
                    last_error,
                    attempt,
                    applied,
                    args,
                    Some(category),
                    StopReason::RepeatedCategory { category },
                );
            }

            let Some(action) = self.playbook.action_for(category) else {
                return RecoveryReport::failed(
                    last_error,
                    attempt,
                    applied,
                    args,
                    Some(category),
                    StopReason::NoAction { category },
                );
            };

            match apply_action(
                action,
                category,
                attempt,
                capability,
                &mut args,
                ctx,
                &self.playbook,
            )
            .await
            {
                Ok(record) => {
                    crate::obs::emit_recovery_applied(
                        &ctx.stage,
                        capability.as_str(),
                        &category.to_string(),
                        &action.to_string(),
                        attempt,
                    );
                    applied.push(record);
                }
                Err(e) => {
                    return RecoveryReport::failed(
                        last_error,
                        attempt,
                        applied,
                        args,
                        Some(category),
                        StopReason::ActionFailed {
                            category,
                            error: e.to_string(),
                        },
                    );
                }
            }
        }

        RecoveryReport::failed(
            last_error,
            max_attempts,
            applied,
            args,
            last_category,
            StopReason::Exhausted,
        )
    }
}
