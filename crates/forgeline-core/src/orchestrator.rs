//! Stage state machine and the validation-gated retry loop.
//!
//! For each stage, in order:
//!
//! ```text
//! Pending → Running → Validating → Committed
//!                         │
//!                         └→ RetryPending → Running …   (attempt < max)
//!                         └→ Escalated → Committed | Skipped | Aborted
//! ```
//!
//! Stages run strictly sequentially against one [`PipelineContext`]. The
//! orchestrator only looks at [`ValidationResult`]s; invocation detail is
//! the validators' business.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, warn, Instrument};

use crate::cancel::CancelSignal;
use crate::config::OrchestratorConfig;
use crate::context::{PipelineContext, Provenance};
use crate::error::{FailureKind, PipelineError, Result};
use crate::escalation::{EscalationRequest, EscalationResolution, Escalator};
use crate::invoker::{InvocationRecord, StageTools, ToolInvoker};
use crate::metrics::RunMetrics;
use crate::obs;
use crate::recovery::RecoveryLayer;
use crate::registry::CapabilityRegistry;
use crate::report::{EscalationDecision, PipelineRunResult, StageOutcome, StageReport};
use crate::stage::{Stage, StageDefinition, StageInput, StageOutput, ValidationResult};
use crate::verify::PostconditionVerifier;

// ---------------------------------------------------------------------------
// Stage states
// ---------------------------------------------------------------------------

/// Lifecycle state of one stage within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    Pending,
    Running,
    Validating,
    Committed,
    RetryPending,
    Escalated,
    Skipped,
    Aborted,
}

impl StageState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StageState::Committed | StageState::Skipped | StageState::Aborted
        )
    }

    /// Legal transitions. Every non-terminal state may move to `Aborted`
    /// on cancellation.
    pub fn can_transition_to(self, next: StageState) -> bool {
        use StageState::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Running, Validating)
                | (Running, RetryPending)
                | (Running, Escalated)
                | (Validating, Committed)
                | (Validating, RetryPending)
                | (Validating, Escalated)
                | (RetryPending, Running)
                | (Escalated, Committed)
                | (Escalated, Skipped)
        ) || (!self.is_terminal() && next == Aborted)
    }
}

impl std::fmt::Display for StageState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StageState::Pending => "pending",
            StageState::Running => "running",
            StageState::Validating => "validating",
            StageState::Committed => "committed",
            StageState::RetryPending => "retry_pending",
            StageState::Escalated => "escalated",
            StageState::Skipped => "skipped",
            StageState::Aborted => "aborted",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Retry bookkeeping
// ---------------------------------------------------------------------------

/// Why one attempt failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AttemptFailure {
    Validation {
        validation: ValidationResult,
        output: StageOutput,
    },
    Worker { error: String },
}

impl AttemptFailure {
    pub fn reason(&self) -> String {
        match self {
            AttemptFailure::Validation { validation, .. } => validation.message.clone(),
            AttemptFailure::Worker { error } => format!("worker error: {error}"),
        }
    }
}

/// A failed attempt, kept until the stage resolves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryAttempt {
    pub stage: String,
    /// 1-based.
    pub attempt: u32,
    pub failure: AttemptFailure,
    pub at: DateTime<Utc>,
}

struct StageRun<'a> {
    definition: &'a StageDefinition,
    states: Vec<StageState>,
    attempts_used: u32,
    cause: Option<FailureKind>,
}

impl<'a> StageRun<'a> {
    fn new(definition: &'a StageDefinition) -> Self {
        Self {
            definition,
            states: vec![StageState::Pending],
            attempts_used: 0,
            cause: None,
        }
    }

    fn current(&self) -> StageState {
        self.states
            .last()
            .copied()
            .unwrap_or(StageState::Pending)
    }

    fn advance(&mut self, next: StageState) {
        let current = self.current();
        if current.can_transition_to(next) {
            self.states.push(next);
        } else {
            error!(
                stage = %self.definition.name,
                from = %current,
                to = %next,
                "illegal stage transition ignored"
            );
        }
    }

    fn finish(
        mut self,
        outcome: StageOutcome,
        message: String,
        provenance: Option<Provenance>,
        failure: Option<FailureKind>,
        ctx: &PipelineContext,
    ) -> StageReport {
        let terminal = match outcome {
            StageOutcome::Committed => StageState::Committed,
            StageOutcome::Skipped => StageState::Skipped,
            StageOutcome::Aborted | StageOutcome::NotRun => StageState::Aborted,
        };
        self.advance(terminal);
        StageReport {
            name: self.definition.name.clone(),
            required: self.definition.required,
            outcome,
            success: outcome == StageOutcome::Committed,
            message,
            attempts_used: self.attempts_used,
            provenance,
            failure,
            cause: self.cause,
            transitions: self.states,
            invocations: ctx.log().for_stage(&self.definition.name).len(),
        }
    }

    fn cancelled(self, ctx: &PipelineContext) -> StageReport {
        self.finish(
            StageOutcome::Aborted,
            "run cancelled".to_string(),
            None,
            Some(FailureKind::Cancelled),
            ctx,
        )
    }

    fn commit(
        self,
        ctx: &mut PipelineContext,
        data: Value,
        provenance: Provenance,
        message: String,
    ) -> StageReport {
        match ctx.commit(&self.definition.name, data, provenance) {
            Ok(()) => self.finish(
                StageOutcome::Committed,
                message,
                Some(provenance),
                None,
                ctx,
            ),
            Err(e) => {
                error!(stage = %self.definition.name, error = %e, "commit failed");
                self.finish(
                    StageOutcome::Aborted,
                    e.to_string(),
                    None,
                    Some(FailureKind::RunAbort),
                    ctx,
                )
            }
        }
    }
}

/// Evidence class of a failed attempt, for the report only.
fn cause_of(records: &[InvocationRecord]) -> FailureKind {
    if records.iter().any(|r| r.is_denied()) {
        FailureKind::BoundaryViolation
    } else if records.iter().any(|r| !r.issues.is_empty()) {
        FailureKind::VerificationIssue
    } else if records.iter().any(|r| r.allowed && !r.is_ok()) {
        FailureKind::CapabilityError
    } else {
        FailureKind::ValidationFailure
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Runs an ordered list of stages against one pipeline context per run.
///
/// Immutable after construction; concurrent runs share nothing but the
/// read-only registry.
pub struct Orchestrator {
    config: OrchestratorConfig,
    registry: Arc<CapabilityRegistry>,
    stages: Vec<Arc<dyn Stage>>,
    escalator: Arc<dyn Escalator>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .field("capabilities", &self.registry.ids())
            .field("stages", &self.stage_names())
            .finish()
    }
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        registry: Arc<CapabilityRegistry>,
        stages: Vec<Arc<dyn Stage>>,
        escalator: Arc<dyn Escalator>,
    ) -> Result<Self> {
        config.validate()?;
        if stages.is_empty() {
            return Err(PipelineError::InvalidConfig(
                "pipeline has no stages".to_string(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for stage in &stages {
            let def = stage.definition();
            if def.name.trim().is_empty() {
                return Err(PipelineError::InvalidConfig(
                    "stage name must not be empty".to_string(),
                ));
            }
            if !seen.insert(def.name.clone()) {
                return Err(PipelineError::DuplicateStage(def.name.clone()));
            }
            for id in def.allow_list.iter() {
                if !registry.contains(id) {
                    warn!(stage = %def.name, capability = %id, "allow-list names an unregistered capability");
                }
            }
        }
        Ok(Self {
            config,
            registry,
            stages,
            escalator,
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages
            .iter()
            .map(|s| s.definition().name.as_str())
            .collect()
    }

    /// Run the pipeline for `task` in `working_dir`.
    pub async fn run(
        &self,
        task: &str,
        working_dir: impl Into<PathBuf>,
        cancel: CancelSignal,
    ) -> PipelineRunResult {
        self.run_with_context(PipelineContext::new(task, working_dir), cancel)
            .await
    }

    /// Run the pipeline against a caller-built context.
    pub async fn run_with_context(
        &self,
        context: PipelineContext,
        cancel: CancelSignal,
    ) -> PipelineRunResult {
        let span = obs::run_span(&context.run_id().to_string());
        self.execute(context, cancel).instrument(span).await
    }

    fn build_invoker(
        &self,
        ctx: &PipelineContext,
        metrics: Arc<RunMetrics>,
        cancel: &CancelSignal,
    ) -> Arc<ToolInvoker> {
        let recovery = RecoveryLayer::new(
            self.registry.clone(),
            self.config.recovery.clone(),
            self.config.tool_timeout(),
        );
        let verifier = self
            .config
            .verify_postconditions
            .then(|| PostconditionVerifier::new(self.config.verifier.clone()));
        Arc::new(
            ToolInvoker::new(self.registry.clone(), ctx.working_dir(), ctx.run_id())
                .with_recovery(recovery, self.config.recovery_max_attempts)
                .with_verifier(verifier)
                .with_log(ctx.log().clone())
                .with_metrics(metrics)
                .with_cancel(cancel.clone()),
        )
    }

    async fn execute(&self, mut ctx: PipelineContext, cancel: CancelSignal) -> PipelineRunResult {
        let started_at = Utc::now();
        let clock = Instant::now();
        let run_id = ctx.run_id().to_string();
        let metrics = Arc::new(RunMetrics::new());
        let invoker = self.build_invoker(&ctx, metrics.clone(), &cancel);

        obs::emit_run_started(&run_id, self.stages.len());

        let mut reports = Vec::with_capacity(self.stages.len());
        let mut escalations = Vec::new();
        let mut run_failure: Option<FailureKind> = None;

        for stage in &self.stages {
            let def = stage.definition();
            if run_failure.is_some() {
                reports.push(StageReport::not_run(&def.name, def.required));
                continue;
            }
            let report = self
                .run_stage(
                    stage.as_ref(),
                    &mut ctx,
                    &invoker,
                    &metrics,
                    &cancel,
                    &mut escalations,
                )
                .await;
            if report.outcome == StageOutcome::Aborted {
                run_failure = Some(match report.failure {
                    Some(FailureKind::Cancelled) => FailureKind::Cancelled,
                    _ => FailureKind::RunAbort,
                });
            }
            reports.push(report);
        }

        let stages_completed = reports
            .iter()
            .filter(|r| r.outcome == StageOutcome::Committed)
            .count();
        let success = run_failure.is_none()
            && reports
                .iter()
                .filter(|r| r.required)
                .all(|r| r.outcome == StageOutcome::Committed);
        let duration_ms = clock.elapsed().as_millis() as u64;

        metrics.flush(&run_id);
        obs::emit_run_finished(&run_id, duration_ms, stages_completed, success);

        PipelineRunResult {
            run_id: ctx.run_id(),
            task: ctx.task().to_string(),
            success,
            stages_completed,
            total_stages: self.stages.len(),
            per_stage: reports,
            committed_outputs: ctx.outputs().clone(),
            escalations,
            invocations: ctx.log().snapshot(),
            metrics: metrics.snapshot(),
            failure: run_failure,
            started_at,
            finished_at: Utc::now(),
            duration_ms,
        }
    }

    async fn run_stage(
        &self,
        stage: &dyn Stage,
        ctx: &mut PipelineContext,
        invoker: &Arc<ToolInvoker>,
        metrics: &RunMetrics,
        cancel: &CancelSignal,
        escalations: &mut Vec<EscalationDecision>,
    ) -> StageReport {
        let def = stage.definition();
        let max_attempts = self.config.max_attempts;
        let mut progress = StageRun::new(def);
        let mut retries: Vec<RetryAttempt> = Vec::new();
        let mut note: Option<String> = None;

        for attempt in 1..=max_attempts {
            if cancel.is_cancelled() {
                return progress.cancelled(ctx);
            }
            progress.attempts_used = attempt;
            progress.advance(StageState::Running);
            obs::emit_stage_attempt(&def.name, attempt, max_attempts);

            let tools = StageTools::new(invoker.clone(), def.name.clone(), def.allow_list.clone());
            let input = StageInput {
                context: &*ctx,
                attempt,
                max_attempts,
                retry_note: note.as_deref(),
            };
            let worker = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                result = stage.run(input, &tools) => Some(result),
            };
            let Some(worker) = worker else {
                return progress.cancelled(ctx);
            };
            let records = tools.take_records();

            let failure = match worker {
                Ok(output) => {
                    progress.advance(StageState::Validating);
                    let validation = stage.validate(&output, &records, ctx);
                    obs::emit_stage_validated(
                        &def.name,
                        attempt,
                        validation.success,
                        &validation.message,
                    );
                    if validation.success {
                        let data = validation
                            .data
                            .clone()
                            .unwrap_or_else(|| output.as_committed());
                        return progress.commit(ctx, data, Provenance::Validated, validation.message);
                    }
                    AttemptFailure::Validation { validation, output }
                }
                Err(e) => AttemptFailure::Worker {
                    error: format!("{e:#}"),
                },
            };
            progress.cause = Some(cause_of(&records));

            let reason = failure.reason();
            retries.push(RetryAttempt {
                stage: def.name.clone(),
                attempt,
                failure,
                at: Utc::now(),
            });

            if attempt < max_attempts {
                progress.advance(StageState::RetryPending);
                metrics.inc_stage_retries();
                obs::emit_stage_retry(&def.name, attempt, &reason);
            }
            note = Some(reason);
        }

        tracing::debug!(
            stage = %def.name,
            failed_attempts = retries.len(),
            "retry loop exhausted"
        );
        progress.advance(StageState::Escalated);
        metrics.inc_escalations();
        obs::emit_stage_escalated(&def.name, progress.attempts_used, def.required);

        let (last_validation, last_error, last_output) = match retries.pop().map(|r| r.failure) {
            Some(AttemptFailure::Validation { validation, output }) => {
                (Some(validation), None, Some(output))
            }
            Some(AttemptFailure::Worker { error }) => (None, Some(error), None),
            None => (None, None, None),
        };
        let request = EscalationRequest::new(
            ctx.run_id(),
            def,
            progress.attempts_used,
            last_validation,
            last_error,
            last_output,
        );

        let requested = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            resolution = self.escalator.present_escalation(&request) => Some(resolution),
        };
        let Some(requested) = requested else {
            return progress.cancelled(ctx);
        };

        let applied = if request.offers(requested.option()) {
            requested.clone()
        } else {
            warn!(
                stage = %def.name,
                requested = %requested.option(),
                "escalation resolution was not offered; aborting"
            );
            EscalationResolution::Abort
        };
        obs::emit_escalation_resolved(&def.name, &applied.option().to_string());
        escalations.push(EscalationDecision {
            stage: def.name.clone(),
            attempts_used: progress.attempts_used,
            message: request.message().to_string(),
            offered: request.options.clone(),
            requested: requested.option(),
            applied: applied.option(),
            decided_at: Utc::now(),
        });

        let message = request.message().to_string();
        match applied {
            EscalationResolution::Continue => {
                let data = request
                    .last_output
                    .as_ref()
                    .map(StageOutput::as_committed)
                    .unwrap_or(Value::Null);
                progress.commit(
                    ctx,
                    data,
                    Provenance::Unvalidated,
                    format!("continued without validation: {message}"),
                )
            }
            EscalationResolution::SubstituteOutput { data } => progress.commit(
                ctx,
                data,
                Provenance::OperatorSupplied,
                format!("operator supplied output: {message}"),
            ),
            EscalationResolution::Abort if def.required => progress.finish(
                StageOutcome::Aborted,
                message,
                None,
                Some(FailureKind::EscalationAbort),
                ctx,
            ),
            EscalationResolution::Abort => {
                let cause = progress.cause;
                progress.finish(StageOutcome::Skipped, message, None, cause, ctx)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::CapabilitySet;
    use crate::escalation::PolicyEscalator;
    use crate::fakes::{ScriptedEscalator, StaticStage};
    use serde_json::json;

    fn orchestrator(stages: Vec<Arc<dyn Stage>>, escalator: Arc<dyn Escalator>) -> Orchestrator {
        Orchestrator::new(
            OrchestratorConfig::default(),
            CapabilityRegistry::new().into_shared(),
            stages,
            escalator,
        )
        .unwrap()
    }

    #[test]
    fn test_transition_table() {
        use StageState::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Validating.can_transition_to(RetryPending));
        assert!(RetryPending.can_transition_to(Running));
        assert!(Escalated.can_transition_to(Skipped));
        assert!(Running.can_transition_to(Aborted));
        assert!(!Pending.can_transition_to(Committed));
        assert!(!Committed.can_transition_to(Running));
        assert!(!Skipped.can_transition_to(Aborted));
        assert!(!Validating.can_transition_to(Skipped));
    }

    #[test]
    fn test_construction_rejects_bad_pipelines() {
        let reg = CapabilityRegistry::new().into_shared();
        let esc: Arc<dyn Escalator> = Arc::new(PolicyEscalator::always_abort());
        let err = Orchestrator::new(OrchestratorConfig::default(), reg.clone(), vec![], esc.clone())
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidConfig(_)));

        let stages: Vec<Arc<dyn Stage>> = vec![
            Arc::new(StaticStage::passing("plan")),
            Arc::new(StaticStage::passing("plan")),
        ];
        let err = Orchestrator::new(OrchestratorConfig::default(), reg.clone(), stages, esc.clone())
            .unwrap_err();
        assert!(matches!(err, PipelineError::DuplicateStage(n) if n == "plan"));

        let err = Orchestrator::new(
            OrchestratorConfig::default().with_max_attempts(0),
            reg,
            vec![Arc::new(StaticStage::passing("plan"))],
            esc,
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_happy_path_commits_every_stage() {
        let orch = orchestrator(
            vec![
                Arc::new(StaticStage::passing("explore")),
                Arc::new(StaticStage::passing("plan")),
            ],
            Arc::new(PolicyEscalator::always_abort()),
        );
        let result = orch.run("task", ".", CancelSignal::never()).await;
        assert!(result.success);
        assert_eq!(result.stages_completed, 2);
        assert_eq!(result.total_stages, 2);
        let plan = result.stage("plan").unwrap();
        assert_eq!(
            plan.transitions,
            vec![
                StageState::Pending,
                StageState::Running,
                StageState::Validating,
                StageState::Committed
            ]
        );
        assert_eq!(plan.provenance, Some(Provenance::Validated));
        assert_eq!(result.output("explore").unwrap().data, json!("explore output"));
    }

    #[tokio::test]
    async fn test_required_abort_marks_rest_not_run() {
        let escalator = ScriptedEscalator::new(vec![EscalationResolution::Abort]);
        let orch = orchestrator(
            vec![
                Arc::new(StaticStage::failing("plan")),
                Arc::new(StaticStage::passing("implement")),
            ],
            Arc::new(escalator.clone()),
        );
        let result = orch.run("task", ".", CancelSignal::never()).await;
        assert!(!result.success);
        assert_eq!(result.failure, Some(FailureKind::RunAbort));
        let plan = result.stage("plan").unwrap();
        assert_eq!(plan.outcome, StageOutcome::Aborted);
        assert_eq!(plan.failure, Some(FailureKind::EscalationAbort));
        assert_eq!(plan.attempts_used, 3);
        assert_eq!(
            result.stage("implement").unwrap().outcome,
            StageOutcome::NotRun
        );
        assert_eq!(escalator.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_unoffered_resolution_is_abort() {
        let orch = orchestrator(
            vec![Arc::new(StaticStage::failing("plan"))],
            Arc::new(ScriptedEscalator::new(vec![
                EscalationResolution::SubstituteOutput { data: json!(1) },
            ])),
        );
        let result = orch.run("task", ".", CancelSignal::never()).await;
        assert!(!result.success);
        let decision = &result.escalations[0];
        assert_eq!(decision.requested, crate::escalation::EscalationOption::SubstituteOutput);
        assert_eq!(decision.applied, crate::escalation::EscalationOption::Abort);
        assert!(result.committed_outputs.is_empty());
    }

    #[tokio::test]
    async fn test_continue_commits_unvalidated_raw_output() {
        let orch = orchestrator(
            vec![Arc::new(StaticStage::failing("plan"))],
            Arc::new(PolicyEscalator::always_continue()),
        );
        let result = orch.run("task", ".", CancelSignal::never()).await;
        assert!(result.success);
        let out = result.output("plan").unwrap();
        assert_eq!(out.provenance, Provenance::Unvalidated);
        assert_eq!(out.data, json!("plan output"));
        assert!(result.stage("plan").unwrap().message.starts_with("continued"));
    }

    #[tokio::test]
    async fn test_substitute_output_for_accepting_stage() {
        let orch = orchestrator(
            vec![Arc::new(StaticStage::failing("plan").accepting_substitute())],
            Arc::new(ScriptedEscalator::new(vec![
                EscalationResolution::SubstituteOutput {
                    data: json!({"files": ["main.rs"]}),
                },
            ])),
        );
        let result = orch.run("task", ".", CancelSignal::never()).await;
        assert!(result.success);
        let out = result.output("plan").unwrap();
        assert_eq!(out.provenance, Provenance::OperatorSupplied);
        assert_eq!(out.data, json!({"files": ["main.rs"]}));
    }

    #[tokio::test]
    async fn test_cancel_before_start_aborts_without_commit() {
        let (handle, signal) = crate::cancel::cancel_pair();
        handle.cancel();
        let orch = orchestrator(
            vec![
                Arc::new(StaticStage::passing("explore")),
                Arc::new(StaticStage::passing("plan")),
            ],
            Arc::new(PolicyEscalator::always_abort()),
        );
        let result = orch.run("task", ".", signal).await;
        assert!(!result.success);
        assert_eq!(result.failure, Some(FailureKind::Cancelled));
        let explore = result.stage("explore").unwrap();
        assert_eq!(explore.outcome, StageOutcome::Aborted);
        assert_eq!(explore.attempts_used, 0);
        assert!(result.committed_outputs.is_empty());
        assert_eq!(result.stage("plan").unwrap().outcome, StageOutcome::NotRun);
    }
}
