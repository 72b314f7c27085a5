//! End-to-end orchestrator behaviour against in-memory and built-in
//! capabilities.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};

use forgeline_core::fakes::{CountingHandler, ScriptedEscalator, ScriptedHandler, ScriptedStep, StaticStage};
use forgeline_core::recovery::RecoveryAction;
use forgeline_core::{
    builtin_registry, cancel_pair, CancelSignal, CapabilityHandler, CapabilityId, CapabilityRegistry, CapabilitySet,
    CapabilitySpec, EscalationRequest, EscalationResolution, Escalator, FailureKind, InvocationRecord, Orchestrator,
    OrchestratorConfig, PipelineContext, PipelineDefinition, PolicyEscalator, Provenance, Stage,
    StageDefinition, StageInput, StageOutcome, StageOutput, StageState, StageTools, ToolInvoker,
    ValidationResult, ValidationRuleSet,
};

/// Issues a fixed list of calls and validates with the standard rules.
struct CallingStage {
    definition: StageDefinition,
    calls: Vec<(CapabilityId, Value)>,
}

impl CallingStage {
    fn new(name: &str, allow: &[&str], calls: Vec<(&str, Value)>) -> Self {
        Self {
            definition: StageDefinition::new(name, CapabilitySet::new(allow.iter().copied())),
            calls: calls
                .into_iter()
                .map(|(c, a)| (CapabilityId::from(c), a))
                .collect(),
        }
    }
}

#[async_trait]
impl Stage for CallingStage {
    fn definition(&self) -> &StageDefinition {
        &self.definition
    }

    async fn run(&self, _input: StageInput<'_>, tools: &StageTools) -> anyhow::Result<StageOutput> {
        let mut seen = Vec::new();
        for (capability, arguments) in &self.calls {
            let record = tools.invoke(capability.clone(), arguments.clone()).await;
            seen.push(record.is_ok());
        }
        Ok(StageOutput::text(format!("{} calls", seen.len())).with_data(json!({ "ok": seen })))
    }

    fn validate(
        &self,
        output: &StageOutput,
        invocations: &[InvocationRecord],
        _context: &PipelineContext,
    ) -> ValidationResult {
        ValidationRuleSet::standard().evaluate(output, invocations)
    }
}

fn shared<H: CapabilityHandler>(handler: H) -> Arc<dyn CapabilityHandler> {
    Arc::new(handler)
}

fn registry_with(entries: Vec<(&str, Arc<dyn CapabilityHandler>)>) -> Arc<CapabilityRegistry> {
    let mut reg = CapabilityRegistry::new();
    for (name, handler) in entries {
        reg.register_arc(CapabilitySpec::new(CapabilityId::from(name), name), handler)
            .unwrap();
    }
    reg.into_shared()
}

#[tokio::test]
async fn test_disallowed_capability_never_reaches_handler() {
    let writer = CountingHandler::new("written");
    let reader = CountingHandler::new("contents");
    let registry = registry_with(vec![
        ("write_file", shared(writer.clone())),
        ("read_file", shared(reader.clone())),
    ]);
    let stage = CallingStage::new(
        "explore",
        &["read_file"],
        vec![
            ("read_file", json!({"path": "calc.py"})),
            ("write_file", json!({"path": "calc.py", "content": "x"})),
        ],
    );
    let orch = Orchestrator::new(
        OrchestratorConfig::default().with_max_attempts(2),
        registry,
        vec![Arc::new(stage)],
        Arc::new(PolicyEscalator::always_abort()),
    )
    .unwrap();

    let result = orch.run("inspect", ".", CancelSignal::never()).await;

    assert_eq!(writer.call_count(), 0);
    assert_eq!(reader.call_count(), 2);
    assert!(!result.success);
    let denied: Vec<_> = result.invocations.iter().filter(|r| r.is_denied()).collect();
    assert_eq!(denied.len(), 2);
    assert!(denied.iter().all(|r| !r.allowed && r.capability == CapabilityId::WriteFile));
    let report = result.stage("explore").unwrap();
    assert_eq!(report.cause, Some(FailureKind::BoundaryViolation));
    assert!(report.message.contains("write_file"));
}

#[tokio::test]
async fn test_retry_cap_then_single_escalation() {
    let stage = StaticStage::failing("plan");
    let escalator = ScriptedEscalator::new(vec![EscalationResolution::Abort]);
    let orch = Orchestrator::new(
        OrchestratorConfig::default().with_max_attempts(3),
        CapabilityRegistry::new().into_shared(),
        vec![Arc::new(stage.clone())],
        Arc::new(escalator.clone()),
    )
    .unwrap();

    let result = orch.run("plan it", ".", CancelSignal::never()).await;

    assert_eq!(stage.run_count(), 3);
    assert_eq!(
        stage.retry_notes(),
        vec![
            None,
            Some("plan rejected".to_string()),
            Some("plan rejected".to_string())
        ]
    );
    let requests = escalator.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].attempts_used, 3);
    assert_eq!(requests[0].message(), "plan rejected");
    assert_eq!(result.escalations.len(), 1);
    assert_eq!(result.metrics.stage_retries, 2);
    assert_eq!(result.metrics.escalations, 1);
}

#[tokio::test]
async fn test_write_that_did_not_happen_is_flagged() {
    let dir = tempfile::tempdir().unwrap();
    // Claims success without touching the filesystem.
    let liar = CountingHandler::new("wrote 3 lines");
    let registry = registry_with(vec![("write_file", shared(liar))]);
    let stage = CallingStage::new(
        "implement",
        &["write_file"],
        vec![(
            "write_file",
            json!({"path": "calc.py", "content": "a\nb\nc\n"}),
        )],
    );
    let orch = Orchestrator::new(
        OrchestratorConfig::default().with_max_attempts(1),
        registry,
        vec![Arc::new(stage)],
        Arc::new(PolicyEscalator::always_abort()),
    )
    .unwrap();

    let result = orch.run("fix", dir.path(), CancelSignal::never()).await;

    let record = &result.invocations[0];
    assert!(record.is_ok());
    assert_eq!(record.verified, Some(false));
    assert_eq!(record.issues, vec!["file not found after write".to_string()]);
    let report = result.stage("implement").unwrap();
    assert!(!report.success);
    assert_eq!(report.cause, Some(FailureKind::VerificationIssue));
}

#[tokio::test]
async fn test_missing_resource_resolves_path_once() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("src")).unwrap();
    std::fs::write(dir.path().join("src/calc.py"), "def divide(x, y): ...\n").unwrap();

    let handler = ScriptedHandler::new(vec![ScriptedStep::Fail(
        "ENOENT: no such file or directory, open 'calc.py'".to_string(),
    )]);
    let registry = registry_with(vec![("read_file", shared(handler.clone()))]);
    let invoker = ToolInvoker::new(registry, dir.path(), uuid::Uuid::new_v4());

    let record = invoker
        .invoke(
            "explore",
            &CapabilityId::ReadFile,
            json!({"path": "calc.py"}),
            &CapabilitySet::read_only(),
        )
        .await;

    // Initial call plus one re-invocation after resolve_path; the
    // recurring category then escalates instead of resolving again.
    assert_eq!(handler.call_count(), 2);
    assert_eq!(handler.arguments()[1]["path"], "src/calc.py");
    assert!(!record.is_ok());
    assert_eq!(record.recovery_applied.len(), 1);
    assert_eq!(record.recovery_applied[0].action, RecoveryAction::ResolvePath);
    assert_eq!(record.arguments, json!({"path": "calc.py"}));
}

#[tokio::test]
async fn test_resolved_path_recovers_the_call() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("src")).unwrap();
    std::fs::write(dir.path().join("src/calc.py"), "x").unwrap();

    let handler = ScriptedHandler::new(vec![
        ScriptedStep::Fail("ENOENT: no such file or directory, open 'calc.py'".to_string()),
        ScriptedStep::Succeed("x".to_string()),
    ]);
    let registry = registry_with(vec![("read_file", shared(handler))]);
    let invoker = ToolInvoker::new(registry, dir.path(), uuid::Uuid::new_v4());

    let record = invoker
        .invoke(
            "explore",
            &CapabilityId::ReadFile,
            json!({"path": "calc.py"}),
            &CapabilitySet::read_only(),
        )
        .await;

    assert_eq!(record.text(), Some("x"));
    assert_eq!(record.attempts_used, 2);
}

#[tokio::test]
async fn test_skipped_optional_stage_is_absent_downstream() {
    let pipeline = PipelineDefinition::from_toml_str(
        r#"
[[stages]]
name = "implement"
reads_from = ["review"]
"#,
    )
    .unwrap();
    let mut stages: Vec<Arc<dyn Stage>> = vec![
        Arc::new(StaticStage::passing("explore")),
        Arc::new(StaticStage::failing("review").optional()),
    ];
    stages.extend(pipeline.into_stages());
    let orch = Orchestrator::new(
        OrchestratorConfig::default().with_max_attempts(2),
        CapabilityRegistry::new().into_shared(),
        stages,
        Arc::new(PolicyEscalator::always_abort()),
    )
    .unwrap();

    let result = orch.run("fix", ".", CancelSignal::never()).await;

    assert!(result.success);
    assert_eq!(result.stages_completed, 2);
    let review = result.stage("review").unwrap();
    assert_eq!(review.outcome, StageOutcome::Skipped);
    assert_eq!(review.failure, Some(FailureKind::ValidationFailure));
    assert!(result.output("review").is_none());
    let implement = result.output("implement").unwrap();
    assert_eq!(implement.data["upstream"], json!({"review": "absent"}));
}

#[tokio::test]
async fn test_downstream_sees_provenance_of_upstream_output() {
    let pipeline = PipelineDefinition::from_toml_str(
        r#"
[[stages]]
name = "implement"
reads_from = ["explore", "plan"]
"#,
    )
    .unwrap();
    let mut stages: Vec<Arc<dyn Stage>> = vec![
        Arc::new(StaticStage::passing("explore")),
        Arc::new(StaticStage::failing("plan")),
    ];
    stages.extend(pipeline.into_stages());
    let orch = Orchestrator::new(
        OrchestratorConfig::default().with_max_attempts(1),
        CapabilityRegistry::new().into_shared(),
        stages,
        Arc::new(ScriptedEscalator::new(vec![EscalationResolution::Continue])),
    )
    .unwrap();

    let result = orch.run("fix", ".", CancelSignal::never()).await;

    assert!(result.success);
    assert_eq!(result.output("explore").unwrap().data, json!("explore output"));
    assert_eq!(result.output("plan").unwrap().provenance, Provenance::Unvalidated);
    assert_eq!(
        result.output("implement").unwrap().data["upstream"],
        json!({"explore": "validated", "plan": "unvalidated"})
    );
}

#[tokio::test]
async fn test_scripted_pipeline_with_builtin_capabilities() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("calc.py"),
        "def divide(x, y):\n    return x - y\n",
    )
    .unwrap();
    let pipeline = PipelineDefinition::from_toml_str(
        r#"
[[stages]]
name = "explore"
allow_list = ["grep", "read"]
calls = [{ capability = "grep", arguments = { pattern = "def divide" } }]
rules = [{ type = "output_matches", pattern = "grep: ok" }]

[[stages]]
name = "implement"
reads_from = ["explore"]
allow_list = ["edit", "read"]
calls = [
  { capability = "edit", arguments = { path = "calc.py", old_string = "x - y", new_string = "x / y" } },
]
rules = [{ type = "require_capability", capability = "edit_file" }, { type = "no_failed_invocations" }]

[[stages]]
name = "verify"
allow_list = ["bash"]
calls = [{ capability = "bash", arguments = { command = "grep -q 'x / y' calc.py && echo fixed" } }]
rules = [{ type = "no_failed_invocations" }]
"#,
    )
    .unwrap();
    let orch = Orchestrator::new(
        OrchestratorConfig::default(),
        builtin_registry().unwrap().into_shared(),
        pipeline.into_stages(),
        Arc::new(PolicyEscalator::always_abort()),
    )
    .unwrap();

    let result = orch.run("fix divide", dir.path(), CancelSignal::never()).await;

    assert!(result.success, "{:?}", result.summary());
    assert_eq!(result.stages_completed, 3);
    let source = std::fs::read_to_string(dir.path().join("calc.py")).unwrap();
    assert!(source.contains("return x / y"));
    let edit = result
        .invocations
        .iter()
        .find(|r| r.capability == CapabilityId::EditFile)
        .unwrap();
    assert_eq!(edit.verified, Some(true));
    let seqs: Vec<u64> = result.invocations.iter().map(|r| r.seq).collect();
    assert_eq!(seqs, vec![1, 2, 3]);
}

/// An operator who never answers.
struct SilentEscalator;

#[async_trait]
impl Escalator for SilentEscalator {
    async fn present_escalation(&self, _request: &EscalationRequest) -> EscalationResolution {
        std::future::pending().await
    }
}

#[tokio::test]
async fn test_cancel_during_tool_invocation_aborts_stage() {
    let slow = ScriptedHandler::new(vec![ScriptedStep::Sleep(Duration::from_secs(30))]);
    let registry = registry_with(vec![("run_shell", shared(slow.clone()))]);
    let stage = CallingStage::new(
        "implement",
        &["run_shell"],
        vec![("run_shell", json!({"command": "make"}))],
    );
    let after = StaticStage::passing("review");
    let orch = Orchestrator::new(
        OrchestratorConfig::default().with_tool_timeout(Duration::from_secs(60)),
        registry,
        vec![Arc::new(StaticStage::passing("explore")), Arc::new(stage), Arc::new(after.clone())],
        Arc::new(PolicyEscalator::always_continue()),
    )
    .unwrap();
    let (handle, signal) = cancel_pair();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.cancel();
    });

    let started = Instant::now();
    let result = orch.run("build", ".", signal).await;

    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(slow.call_count(), 1);
    assert!(!result.success);
    assert_eq!(result.failure, Some(FailureKind::Cancelled));
    let implement = result.stage("implement").unwrap();
    assert_eq!(implement.outcome, StageOutcome::Aborted);
    assert_eq!(implement.failure, Some(FailureKind::Cancelled));
    assert_eq!(implement.attempts_used, 1);
    assert!(result.output("implement").is_none());
    assert!(result.output("explore").is_some());
    assert_eq!(result.stage("review").unwrap().outcome, StageOutcome::NotRun);
    assert_eq!(after.run_count(), 0);
}

#[tokio::test]
async fn test_cancel_while_escalation_pending() {
    let stage = StaticStage::failing("plan");
    let orch = Orchestrator::new(
        OrchestratorConfig::default().with_max_attempts(2),
        CapabilityRegistry::new().into_shared(),
        vec![Arc::new(stage.clone())],
        Arc::new(SilentEscalator),
    )
    .unwrap();
    let (handle, signal) = cancel_pair();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.cancel();
    });

    let result = orch.run("plan it", ".", signal).await;

    assert_eq!(stage.run_count(), 2);
    assert!(!result.success);
    assert_eq!(result.failure, Some(FailureKind::Cancelled));
    let plan = result.stage("plan").unwrap();
    assert_eq!(plan.outcome, StageOutcome::Aborted);
    assert!(plan.transitions.contains(&StageState::Escalated));
    assert!(result.committed_outputs.is_empty());
    assert!(result.escalations.is_empty());
}
