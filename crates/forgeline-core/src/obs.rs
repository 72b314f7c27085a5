//! Structured observability hooks for pipeline run lifecycle events.
//!
//! This module provides:
//! - The run-scoped `forgeline.run` span
//! - Emission functions for stage attempts, validation, escalation,
//!   invocations and recoveries
//!
//! Events are emitted at `info!` level except denials and verification
//! issues, which are `warn!`. Use `RUST_LOG` to filter.

use tracing::{info, warn};

/// Span tagged with the run_id; instrument the run future with it.
pub fn run_span(run_id: &str) -> tracing::Span {
    tracing::info_span!("forgeline.run", run_id = %run_id)
}

pub fn emit_run_started(run_id: &str, total_stages: usize) {
    info!(event = "run.started", run_id = %run_id, total_stages = total_stages);
}

pub fn emit_run_finished(run_id: &str, duration_ms: u64, stages_completed: usize, success: bool) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        duration_ms = duration_ms,
        stages_completed = stages_completed,
        success = success,
    );
}

pub fn emit_stage_attempt(stage: &str, attempt: u32, max_attempts: u32) {
    info!(event = "stage.attempt", stage = %stage, attempt = attempt, max_attempts = max_attempts);
}

pub fn emit_stage_validated(stage: &str, attempt: u32, success: bool, message: &str) {
    info!(
        event = "stage.validated",
        stage = %stage,
        attempt = attempt,
        success = success,
        message = %message,
    );
}

pub fn emit_stage_retry(stage: &str, attempt: u32, reason: &str) {
    info!(event = "stage.retry", stage = %stage, attempt = attempt, reason = %reason);
}

pub fn emit_stage_escalated(stage: &str, attempts_used: u32, required: bool) {
    warn!(
        event = "stage.escalated",
        stage = %stage,
        attempts_used = attempts_used,
        required = required,
    );
}

pub fn emit_escalation_resolved(stage: &str, resolution: &str) {
    info!(event = "escalation.resolved", stage = %stage, resolution = %resolution);
}

pub fn emit_invocation_recorded(stage: &str, seq: u64, capability: &str, ok: bool) {
    info!(
        event = "invocation.recorded",
        stage = %stage,
        seq = seq,
        capability = %capability,
        ok = ok,
    );
}

pub fn emit_invocation_denied(stage: &str, capability: &str) {
    warn!(event = "invocation.denied", stage = %stage, capability = %capability);
}

pub fn emit_recovery_applied(stage: &str, capability: &str, category: &str, action: &str, attempt: u32) {
    info!(
        event = "recovery.applied",
        stage = %stage,
        capability = %capability,
        category = %category,
        action = %action,
        attempt = attempt,
    );
}

pub fn emit_verification_issue(stage: &str, capability: &str, issue: &str) {
    warn!(event = "verify.issue", stage = %stage, capability = %capability, issue = %issue);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_span_create() {
        let span = run_span("test-run-id");
        let _entered = span.enter();
        emit_stage_attempt("plan", 1, 3);
    }
}
