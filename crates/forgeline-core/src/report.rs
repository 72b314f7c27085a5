//! Pipeline run result.
//!
//! A [`PipelineRunResult`] enumerates every stage's outcome, every
//! escalation decision and the full invocation log, so a failed run is
//! explainable from the result alone.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::context::{CommittedOutput, Provenance};
use crate::error::FailureKind;
use crate::escalation::EscalationOption;
use crate::invoker::InvocationRecord;
use crate::metrics::MetricsSnapshot;
use crate::orchestrator::StageState;

/// Final outcome of one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageOutcome {
    Committed,
    /// Non-required stage abandoned by the operator.
    Skipped,
    Aborted,
    /// Never started because the run ended earlier.
    NotRun,
}

/// Per-stage entry of the run result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageReport {
    pub name: String,
    pub required: bool,
    pub outcome: StageOutcome,
    /// `true` when the stage committed output.
    pub success: bool,
    /// Last validation message, worker error or abort reason.
    pub message: String,
    pub attempts_used: u32,
    pub provenance: Option<Provenance>,
    /// Why the stage did not commit validated output.
    pub failure: Option<FailureKind>,
    /// Evidence class behind the last failed attempt.
    pub cause: Option<FailureKind>,
    /// State trace, starting at `pending`.
    pub transitions: Vec<StageState>,
    /// Invocations issued by the stage across all attempts.
    pub invocations: usize,
}

impl StageReport {
    pub(crate) fn not_run(name: &str, required: bool) -> Self {
        Self {
            name: name.to_string(),
            required,
            outcome: StageOutcome::NotRun,
            success: false,
            message: "not run".to_string(),
            attempts_used: 0,
            provenance: None,
            failure: None,
            cause: None,
            transitions: vec![StageState::Pending],
            invocations: 0,
        }
    }
}

/// One operator decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationDecision {
    pub stage: String,
    pub attempts_used: u32,
    pub message: String,
    pub offered: Vec<EscalationOption>,
    /// What the escalator returned.
    pub requested: EscalationOption,
    /// What was applied; differs from `requested` when the escalator
    /// returned an option that was not offered.
    pub applied: EscalationOption,
    pub decided_at: DateTime<Utc>,
}

/// Everything a caller needs to know about one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRunResult {
    pub run_id: Uuid,
    pub task: String,
    pub success: bool,
    pub stages_completed: usize,
    pub total_stages: usize,
    /// Ordered as the pipeline.
    pub per_stage: Vec<StageReport>,
    pub committed_outputs: BTreeMap<String, CommittedOutput>,
    pub escalations: Vec<EscalationDecision>,
    pub invocations: Vec<InvocationRecord>,
    pub metrics: MetricsSnapshot,
    /// Why the run failed.
    pub failure: Option<FailureKind>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl PipelineRunResult {
    pub fn stage(&self, name: &str) -> Option<&StageReport> {
        self.per_stage.iter().find(|s| s.name == name)
    }

    pub fn output(&self, name: &str) -> Option<&CommittedOutput> {
        self.committed_outputs.get(name)
    }

    /// Compact `name -> {success, message, attempts_used}` view.
    pub fn summary(&self) -> BTreeMap<&str, StageSummary<'_>> {
        self.per_stage
            .iter()
            .map(|s| {
                (
                    s.name.as_str(),
                    StageSummary {
                        success: s.success,
                        message: &s.message,
                        attempts_used: s.attempts_used,
                    },
                )
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StageSummary<'a> {
    pub success: bool,
    pub message: &'a str,
    pub attempts_used: u32,
}
