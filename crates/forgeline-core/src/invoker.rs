//! Tool invoker and boundary enforcement.
//!
//! Every capability call a stage makes goes through [`ToolInvoker::invoke`]:
//!
//! 1. allow-list check (a denied capability never reaches its handler)
//! 2. registry lookup and required-argument check
//! 3. bounded-retry execution via the [`RecoveryLayer`]
//! 4. postcondition verification for mutating capabilities
//! 5. append to the run's [`InvocationLog`]
//!
//! Stage workers hold a [`StageTools`] handle that binds the invoker to the
//! stage's name and allow-list and keeps the records it produced.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::cancel::CancelSignal;
use crate::capability::{CapabilityId, CapabilitySet};
use crate::context::InvocationLog;
use crate::metrics::RunMetrics;
use crate::obs;
use crate::recovery::{AppliedRecovery, RecoveryLayer, RecoveryPlaybook};
use crate::registry::{CapabilityRegistry, CapabilitySpec, ExecutionContext};
use crate::verify::PostconditionVerifier;

/// What came back from one invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum InvocationResult {
    Ok { text: String },
    Error { error: String },
    /// Rejected by the allow-list before execution.
    Denied,
}

/// Immutable record of one capability invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationRecord {
    /// 1-based position in the run's invocation log.
    pub seq: u64,
    pub stage: String,
    pub capability: CapabilityId,
    /// Arguments as issued by the stage.
    pub arguments: Value,
    pub result: InvocationResult,
    /// `false` when the call violated the stage's allow-list.
    pub allowed: bool,
    /// Postcondition outcome; `None` when not applicable or not run.
    pub verified: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub issues: Vec<String>,
    pub attempts_used: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recovery_applied: Vec<AppliedRecovery>,
    pub recorded_at: DateTime<Utc>,
}

impl InvocationRecord {
    pub fn is_ok(&self) -> bool {
        matches!(self.result, InvocationResult::Ok { .. })
    }

    pub fn is_denied(&self) -> bool {
        !self.allowed
    }

    /// Success payload, if any.
    pub fn text(&self) -> Option<&str> {
        match &self.result {
            InvocationResult::Ok { text } => Some(text),
            _ => None,
        }
    }

    /// Error message, if any. Denied calls report a boundary message.
    pub fn error(&self) -> Option<String> {
        match &self.result {
            InvocationResult::Ok { .. } => None,
            InvocationResult::Error { error } => Some(error.clone()),
            InvocationResult::Denied => Some(format!(
                "capability '{}' is not allowed in stage '{}'",
                self.capability, self.stage
            )),
        }
    }

    /// Usable as validation evidence: allowed, succeeded and not flagged by
    /// the verifier.
    pub fn is_clean(&self) -> bool {
        self.allowed && self.is_ok() && self.verified != Some(false)
    }
}

/// Executes capability calls for one pipeline run.
#[derive(Debug)]
pub struct ToolInvoker {
    registry: Arc<CapabilityRegistry>,
    recovery: RecoveryLayer,
    recovery_max_attempts: u32,
    verifier: Option<PostconditionVerifier>,
    log: InvocationLog,
    metrics: Arc<RunMetrics>,
    cancel: CancelSignal,
    working_dir: std::path::PathBuf,
    run_id: Uuid,
}

impl ToolInvoker {
    /// Invoker with the standard recovery playbook, verification enabled
    /// and a fresh log.
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        working_dir: impl Into<std::path::PathBuf>,
        run_id: Uuid,
    ) -> Self {
        let recovery = RecoveryLayer::new(
            registry.clone(),
            RecoveryPlaybook::standard(),
            Duration::from_secs(120),
        );
        Self {
            registry,
            recovery,
            recovery_max_attempts: 3,
            verifier: Some(PostconditionVerifier::default()),
            log: InvocationLog::new(),
            metrics: Arc::new(RunMetrics::new()),
            cancel: CancelSignal::never(),
            working_dir: working_dir.into(),
            run_id,
        }
    }

    pub fn with_recovery(mut self, recovery: RecoveryLayer, max_attempts: u32) -> Self {
        self.recovery = recovery;
        self.recovery_max_attempts = max_attempts.max(1);
        self
    }

    /// `None` disables postcondition checks.
    pub fn with_verifier(mut self, verifier: Option<PostconditionVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    pub fn with_log(mut self, log: InvocationLog) -> Self {
        self.log = log;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<RunMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn log(&self) -> &InvocationLog {
        &self.log
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    /// Invoke `capability` on behalf of `stage`, enforcing `allow_list`
    /// before anything executes.
    pub async fn invoke(
        &self,
        stage: &str,
        capability: &CapabilityId,
        arguments: Value,
        allow_list: &CapabilitySet,
    ) -> InvocationRecord {
        self.metrics.inc_invocations();

        if !allow_list.contains(capability) {
            self.metrics.inc_denied();
            obs::emit_invocation_denied(stage, capability.as_str());
            return self.append(stage, capability, arguments, Outcome::denied());
        }

        let Some(spec) = self.registry.spec(capability) else {
            let error = format!("unknown capability '{capability}'");
            return self.append(stage, capability, arguments, Outcome::error(error, 0));
        };
        if let Some(field) = spec.missing_argument(&arguments) {
            let error = format!("missing required argument '{field}'");
            return self.append(stage, capability, arguments, Outcome::error(error, 0));
        }

        let ctx = ExecutionContext::new(self.working_dir.clone(), self.run_id, stage);
        let report = self
            .recovery
            .execute_with_recovery(
                capability,
                &arguments,
                self.recovery_max_attempts,
                &ctx,
                &self.cancel,
            )
            .await;
        self.metrics
            .add_recoveries(report.recovery_applied.len() as u64);

        let mut outcome = Outcome {
            result: match (report.success, report.output) {
                (true, Some(text)) => InvocationResult::Ok { text },
                (true, None) => InvocationResult::Ok {
                    text: String::new(),
                },
                (false, _) => InvocationResult::Error {
                    error: report.error.unwrap_or_default(),
                },
            },
            allowed: true,
            verified: None,
            issues: Vec::new(),
            attempts_used: report.attempts_used,
            recovery_applied: report.recovery_applied,
        };

        if let (Some(verifier), InvocationResult::Ok { text }) = (&self.verifier, &outcome.result)
        {
            if let Some(verification) = verifier
                .verify(capability, &report.final_arguments, text, &ctx)
                .await
            {
                for issue in &verification.issues {
                    obs::emit_verification_issue(stage, capability.as_str(), issue);
                }
                self.metrics
                    .add_verification_issues(verification.issues.len() as u64);
                outcome.verified = Some(verification.success);
                outcome.issues = verification.issues;
            }
        }

        self.append(stage, capability, arguments, outcome)
    }

    fn append(
        &self,
        stage: &str,
        capability: &CapabilityId,
        arguments: Value,
        outcome: Outcome,
    ) -> InvocationRecord {
        let record = self.log.append_with(|seq| InvocationRecord {
            seq,
            stage: stage.to_string(),
            capability: capability.clone(),
            arguments,
            result: outcome.result,
            allowed: outcome.allowed,
            verified: outcome.verified,
            issues: outcome.issues,
            attempts_used: outcome.attempts_used,
            recovery_applied: outcome.recovery_applied,
            recorded_at: Utc::now(),
        });
        obs::emit_invocation_recorded(stage, record.seq, capability.as_str(), record.is_ok());
        record
    }
}

struct Outcome {
    result: InvocationResult,
    allowed: bool,
    verified: Option<bool>,
    issues: Vec<String>,
    attempts_used: u32,
    recovery_applied: Vec<AppliedRecovery>,
}

impl Outcome {
    fn denied() -> Self {
        Self {
            result: InvocationResult::Denied,
            allowed: false,
            verified: None,
            issues: Vec::new(),
            attempts_used: 0,
            recovery_applied: Vec::new(),
        }
    }

    fn error(error: String, attempts_used: u32) -> Self {
        Self {
            result: InvocationResult::Error { error },
            allowed: true,
            verified: None,
            issues: Vec::new(),
            attempts_used,
            recovery_applied: Vec::new(),
        }
    }
}

/// A stage worker's view of the invoker: bound to one stage and its
/// allow-list, and keeping the records of the current attempt.
#[derive(Debug)]
pub struct StageTools {
    invoker: Arc<ToolInvoker>,
    stage: String,
    allow_list: CapabilitySet,
    records: Mutex<Vec<InvocationRecord>>,
}

impl StageTools {
    pub fn new(invoker: Arc<ToolInvoker>, stage: impl Into<String>, allow_list: CapabilitySet) -> Self {
        Self {
            invoker,
            stage: stage.into(),
            allow_list,
            records: Mutex::new(Vec::new()),
        }
    }

    pub fn stage(&self) -> &str {
        &self.stage
    }

    pub fn allow_list(&self) -> &CapabilitySet {
        &self.allow_list
    }

    /// Invoke a capability; the record is returned and also kept for the
    /// stage's validator.
    pub async fn invoke(&self, capability: impl Into<CapabilityId>, arguments: Value) -> InvocationRecord {
        let capability = capability.into();
        let record = self
            .invoker
            .invoke(&self.stage, &capability, arguments, &self.allow_list)
            .await;
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(record.clone());
        record
    }

    /// Records produced through this handle so far.
    pub fn records(&self) -> Vec<InvocationRecord> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Drain the records produced through this handle.
    pub fn take_records(&self) -> Vec<InvocationRecord> {
        std::mem::take(
            &mut *self
                .records
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        )
    }

    /// Schemas of the registered capabilities this stage may call.
    pub fn schemas(&self) -> Vec<CapabilitySpec> {
        self.allow_list
            .iter()
            .filter_map(|id| self.invoker.registry().spec(id).cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::CountingHandler;
    use serde_json::json;

    fn invoker_with(handler: CountingHandler) -> Arc<ToolInvoker> {
        let mut reg = CapabilityRegistry::new();
        reg.register(
            CapabilitySpec::new(CapabilityId::ReadFile, "read").with_required(["path"]),
            handler.clone(),
        )
        .unwrap();
        reg.register(CapabilitySpec::new(CapabilityId::WriteFile, "write"), handler)
            .unwrap();
        Arc::new(
            ToolInvoker::new(reg.into_shared(), std::env::temp_dir(), Uuid::nil())
                .with_verifier(None),
        )
    }

    #[tokio::test]
    async fn test_denied_call_never_reaches_handler() {
        let handler = CountingHandler::new("written");
        let tools = StageTools::new(
            invoker_with(handler.clone()),
            "explore",
            CapabilitySet::new(["read", "glob"]),
        );

        let record = tools
            .invoke("Write", json!({"path": "a.txt", "content": "x"}))
            .await;
        assert!(!record.allowed);
        assert_eq!(record.result, InvocationResult::Denied);
        assert_eq!(handler.call_count(), 0);
        assert!(record.error().unwrap().contains("not allowed"));
    }

    #[tokio::test]
    async fn test_allowed_call_recorded_in_order() {
        let handler = CountingHandler::new("contents");
        let invoker = invoker_with(handler.clone());
        let tools = StageTools::new(invoker.clone(), "explore", CapabilitySet::read_only());

        tools.invoke("read", json!({"path": "a"})).await;
        tools.invoke("write", json!({"path": "b"})).await;
        tools.invoke("read", json!({"path": "c"})).await;

        let log = invoker.log().snapshot();
        assert_eq!(log.iter().map(|r| r.seq).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(log[1].result, InvocationResult::Denied);
        assert_eq!(handler.call_count(), 2);
        assert_eq!(tools.records().len(), 3);
        assert_eq!(tools.take_records().len(), 3);
        assert!(tools.records().is_empty());
    }

    #[tokio::test]
    async fn test_missing_required_argument_skips_handler() {
        let handler = CountingHandler::new("contents");
        let tools = StageTools::new(
            invoker_with(handler.clone()),
            "explore",
            CapabilitySet::read_only(),
        );
        let record = tools.invoke("read", json!({})).await;
        assert!(record.allowed);
        assert_eq!(
            record.error().as_deref(),
            Some("missing required argument 'path'")
        );
        assert_eq!(handler.call_count(), 0);
    }

    #[tokio::test]
    async fn test_schemas_limited_to_allow_list() {
        let tools = StageTools::new(
            invoker_with(CountingHandler::new("")),
            "explore",
            CapabilitySet::read_only(),
        );
        let schemas = tools.schemas();
        assert_eq!(schemas.len(), 1);
        assert_eq!(schemas[0].id, CapabilityId::ReadFile);
    }
}
