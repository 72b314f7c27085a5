//! Pipeline context: the task, the committed stage outputs and the
//! run-wide invocation log.
//!
//! Stages receive the context read-only. Only the orchestrator commits
//! outputs, once per stage, after the stage's validation gate resolves.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{PipelineError, Result};
use crate::invoker::InvocationRecord;

/// How a committed output came to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    /// Passed the stage's validation gate.
    Validated,
    /// Raw output of a failed attempt, committed by an operator's
    /// "continue anyway".
    Unvalidated,
    /// Substitute output typed in by an operator.
    OperatorSupplied,
}

impl Provenance {
    /// Whether downstream stages may treat the output as trustworthy.
    pub fn is_trusted(self) -> bool {
        !matches!(self, Provenance::Unvalidated)
    }
}

/// One stage's committed output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommittedOutput {
    pub data: Value,
    pub provenance: Provenance,
}

/// Append-only, ordered log of every invocation in a run.
///
/// Cloning shares the underlying log. Sequence numbers are assigned under
/// the lock so the log order is the issue order.
#[derive(Debug, Clone, Default)]
pub struct InvocationLog {
    inner: Arc<Mutex<Vec<InvocationRecord>>>,
}

impl InvocationLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<InvocationRecord>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Build a record with the next sequence number (1-based) and append it.
    pub fn append_with<F>(&self, build: F) -> InvocationRecord
    where
        F: FnOnce(u64) -> InvocationRecord,
    {
        let mut log = self.lock();
        let record = build(log.len() as u64 + 1);
        log.push(record.clone());
        record
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Copy of the full log in issue order.
    pub fn snapshot(&self) -> Vec<InvocationRecord> {
        self.lock().clone()
    }

    pub fn for_stage(&self, stage: &str) -> Vec<InvocationRecord> {
        self.lock()
            .iter()
            .filter(|r| r.stage == stage)
            .cloned()
            .collect()
    }
}

/// Shared state of one pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineContext {
    run_id: Uuid,
    task: String,
    working_dir: PathBuf,
    outputs: BTreeMap<String, CommittedOutput>,
    log: InvocationLog,
}

impl PipelineContext {
    pub fn new(task: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            task: task.into(),
            working_dir: working_dir.into(),
            outputs: BTreeMap::new(),
            log: InvocationLog::new(),
        }
    }

    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = run_id;
        self
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn task(&self) -> &str {
        &self.task
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn log(&self) -> &InvocationLog {
        &self.log
    }

    /// Any committed output for `stage`, whatever its provenance.
    ///
    /// `None` means the stage was skipped, aborted, or has not run yet;
    /// callers treat that as "no information available".
    pub fn output(&self, stage: &str) -> Option<&CommittedOutput> {
        self.outputs.get(stage)
    }

    /// Committed data for `stage` only if it was validated or supplied by an
    /// operator.
    pub fn validated_output(&self, stage: &str) -> Option<&Value> {
        self.outputs
            .get(stage)
            .filter(|o| o.provenance.is_trusted())
            .map(|o| &o.data)
    }

    pub fn is_committed(&self, stage: &str) -> bool {
        self.outputs.contains_key(stage)
    }

    pub fn outputs(&self) -> &BTreeMap<String, CommittedOutput> {
        &self.outputs
    }

    /// Commit a stage's output. Each stage commits at most once.
    pub(crate) fn commit(
        &mut self,
        stage: &str,
        data: Value,
        provenance: Provenance,
    ) -> Result<()> {
        if self.outputs.contains_key(stage) {
            return Err(PipelineError::AlreadyCommitted(stage.to_string()));
        }
        self.outputs
            .insert(stage.to_string(), CommittedOutput { data, provenance });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_commit_once() {
        let mut ctx = PipelineContext::new("task", ".");
        ctx.commit("plan", json!({"steps": 2}), Provenance::Validated)
            .unwrap();
        let err = ctx
            .commit("plan", json!({"steps": 3}), Provenance::Validated)
            .unwrap_err();
        assert!(matches!(err, PipelineError::AlreadyCommitted(s) if s == "plan"));
        assert_eq!(ctx.output("plan").unwrap().data, json!({"steps": 2}));
    }

    #[test]
    fn test_validated_output_hides_unvalidated() {
        let mut ctx = PipelineContext::new("task", ".");
        ctx.commit("explore", json!("raw"), Provenance::Unvalidated)
            .unwrap();
        ctx.commit("plan", json!("typed"), Provenance::OperatorSupplied)
            .unwrap();
        assert!(ctx.output("explore").is_some());
        assert!(ctx.validated_output("explore").is_none());
        assert_eq!(ctx.validated_output("plan"), Some(&json!("typed")));
        assert!(ctx.validated_output("review").is_none());
    }

    #[test]
    fn test_log_clones_share_entries() {
        let ctx = PipelineContext::new("task", ".");
        let log = ctx.log().clone();
        assert!(log.is_empty());
        assert_eq!(ctx.log().len(), 0);
    }
}
