//! In-memory fakes for tests: capability handlers, stages, escalators and
//! chat backends with scripted behaviour and call recording.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::agent::{ChatBackend, ChatMessage, ChatReply};
use crate::capability::CapabilitySet;
use crate::context::PipelineContext;
use crate::escalation::{EscalationRequest, EscalationResolution, Escalator};
use crate::invoker::{InvocationRecord, StageTools};
use crate::registry::{CapabilityHandler, CapabilityOutcome, CapabilitySpec, ExecutionContext};
use crate::stage::{Stage, StageDefinition, StageInput, StageOutput, ValidationResult};
use crate::validation;

// ---------------------------------------------------------------------------
// Capability handlers
// ---------------------------------------------------------------------------

/// Succeeds with a fixed text and counts calls.
#[derive(Debug, Clone)]
pub struct CountingHandler {
    text: String,
    calls: Arc<AtomicUsize>,
}

impl CountingHandler {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CapabilityHandler for CountingHandler {
    async fn execute(
        &self,
        _arguments: &Value,
        _ctx: &ExecutionContext,
    ) -> anyhow::Result<CapabilityOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(CapabilityOutcome::success(self.text.clone()))
    }
}

/// One scripted handler response.
#[derive(Debug, Clone)]
pub enum ScriptedStep {
    Succeed(String),
    Fail(String),
    /// Sleep, then succeed with an empty payload.
    Sleep(Duration),
    /// Raise an unexpected fault.
    Fault(String),
}

/// Plays back steps in order; the last step repeats once the script runs
/// out. Records the arguments of every call.
#[derive(Debug, Clone)]
pub struct ScriptedHandler {
    steps: Arc<Mutex<VecDeque<ScriptedStep>>>,
    last: Arc<Mutex<Option<ScriptedStep>>>,
    arguments: Arc<Mutex<Vec<Value>>>,
}

impl ScriptedHandler {
    pub fn new(steps: Vec<ScriptedStep>) -> Self {
        Self {
            steps: Arc::new(Mutex::new(steps.into())),
            last: Arc::new(Mutex::new(None)),
            arguments: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn call_count(&self) -> usize {
        self.arguments.lock().map(|a| a.len()).unwrap_or_default()
    }

    /// Arguments of every call, in order.
    pub fn arguments(&self) -> Vec<Value> {
        self.arguments
            .lock()
            .map(|a| a.clone())
            .unwrap_or_default()
    }

    fn next_step(&self) -> Option<ScriptedStep> {
        let next = self.steps.lock().ok()?.pop_front();
        let mut last = self.last.lock().ok()?;
        match next {
            Some(step) => {
                *last = Some(step.clone());
                Some(step)
            }
            None => last.clone(),
        }
    }
}

#[async_trait]
impl CapabilityHandler for ScriptedHandler {
    async fn execute(
        &self,
        arguments: &Value,
        _ctx: &ExecutionContext,
    ) -> anyhow::Result<CapabilityOutcome> {
        if let Ok(mut recorded) = self.arguments.lock() {
            recorded.push(arguments.clone());
        }
        match self.next_step() {
            Some(ScriptedStep::Succeed(text)) => Ok(CapabilityOutcome::success(text)),
            Some(ScriptedStep::Fail(error)) => Ok(CapabilityOutcome::failure(error)),
            Some(ScriptedStep::Sleep(d)) => {
                tokio::time::sleep(d).await;
                Ok(CapabilityOutcome::success(""))
            }
            Some(ScriptedStep::Fault(msg)) => Err(anyhow::anyhow!(msg)),
            None => Ok(CapabilityOutcome::failure("script exhausted")),
        }
    }
}

// ---------------------------------------------------------------------------
// Stages
// ---------------------------------------------------------------------------

/// Stage whose worker returns `"<name> output"` and whose validator always
/// passes or always fails. Counts worker runs and keeps retry notes.
#[derive(Debug, Clone)]
pub struct StaticStage {
    definition: StageDefinition,
    passes: bool,
    runs: Arc<AtomicUsize>,
    notes: Arc<Mutex<Vec<Option<String>>>>,
}

impl StaticStage {
    fn with(name: &str, passes: bool) -> Self {
        Self {
            definition: StageDefinition::new(name, CapabilitySet::empty()),
            passes,
            runs: Arc::new(AtomicUsize::new(0)),
            notes: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn passing(name: &str) -> Self {
        Self::with(name, true)
    }

    pub fn failing(name: &str) -> Self {
        Self::with(name, false)
    }

    pub fn optional(mut self) -> Self {
        self.definition = self.definition.optional();
        self
    }

    pub fn accepting_substitute(mut self) -> Self {
        self.definition = self.definition.with_substitute();
        self
    }

    pub fn run_count(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    /// Retry note seen by each run, in order.
    pub fn retry_notes(&self) -> Vec<Option<String>> {
        self.notes.lock().map(|n| n.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Stage for StaticStage {
    fn definition(&self) -> &StageDefinition {
        &self.definition
    }

    async fn run(&self, input: StageInput<'_>, _tools: &StageTools) -> anyhow::Result<StageOutput> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut notes) = self.notes.lock() {
            notes.push(input.retry_note.map(str::to_string));
        }
        Ok(StageOutput::text(format!("{} output", self.definition.name)))
    }

    fn validate(
        &self,
        output: &StageOutput,
        invocations: &[InvocationRecord],
        _context: &PipelineContext,
    ) -> ValidationResult {
        if self.passes {
            validation::accept(output, invocations)
        } else {
            ValidationResult::fail(format!("{} rejected", self.definition.name))
        }
    }
}

// ---------------------------------------------------------------------------
// Escalators
// ---------------------------------------------------------------------------

/// Answers escalations from a script (then aborts) and records requests.
#[derive(Debug, Clone, Default)]
pub struct ScriptedEscalator {
    resolutions: Arc<Mutex<VecDeque<EscalationResolution>>>,
    requests: Arc<Mutex<Vec<EscalationRequest>>>,
}

impl ScriptedEscalator {
    pub fn new(resolutions: Vec<EscalationResolution>) -> Self {
        Self {
            resolutions: Arc::new(Mutex::new(resolutions.into())),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn requests(&self) -> Vec<EscalationRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Escalator for ScriptedEscalator {
    async fn present_escalation(&self, request: &EscalationRequest) -> EscalationResolution {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        self.resolutions
            .lock()
            .ok()
            .and_then(|mut r| r.pop_front())
            .unwrap_or(EscalationResolution::Abort)
    }
}

// ---------------------------------------------------------------------------
// Chat backends
// ---------------------------------------------------------------------------

/// Replays replies in order, repeating the last one, and records every
/// message history it was called with.
#[derive(Debug, Clone)]
pub struct ScriptedChatBackend {
    replies: Arc<Mutex<VecDeque<ChatReply>>>,
    last: Arc<Mutex<Option<ChatReply>>>,
    calls: Arc<Mutex<Vec<Vec<ChatMessage>>>>,
}

impl ScriptedChatBackend {
    pub fn new(replies: Vec<ChatReply>) -> Self {
        Self {
            replies: Arc::new(Mutex::new(replies.into())),
            last: Arc::new(Mutex::new(None)),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn calls(&self) -> Vec<Vec<ChatMessage>> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ChatBackend for ScriptedChatBackend {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        _capabilities: &[CapabilitySpec],
    ) -> anyhow::Result<ChatReply> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(messages.to_vec());
        }
        let next = self
            .replies
            .lock()
            .map_err(|_| anyhow::anyhow!("reply script poisoned"))?
            .pop_front();
        let mut last = self
            .last
            .lock()
            .map_err(|_| anyhow::anyhow!("reply script poisoned"))?;
        match next {
            Some(reply) => {
                *last = Some(reply.clone());
                Ok(reply)
            }
            None => last
                .clone()
                .ok_or_else(|| anyhow::anyhow!("chat script exhausted")),
        }
    }
}
