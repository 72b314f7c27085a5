//! Language-model-backed stage worker.
//!
//! [`AgentStage`] drives a bounded tool-use loop against a [`ChatBackend`]:
//! each reply is either final text or one capability call, which is routed
//! through the stage's [`StageTools`] and fed back as a tool message. The
//! final text is parsed best-effort with [`crate::extract`].

use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::context::PipelineContext;
use crate::extract::{extract_fenced_json, extract_file_paths};
use crate::invoker::{InvocationRecord, StageTools};
use crate::registry::CapabilitySpec;
use crate::stage::{Stage, StageDefinition, StageInput, StageOutput, ValidationResult};
use crate::validation::{ValidationRule, ValidationRuleSet};

/// One message of a chat history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum ChatMessage {
    System { content: String },
    User { content: String },
    Assistant { content: String },
    /// A capability call the assistant requested.
    ToolCall { name: String, arguments: Value },
    /// The result of that call.
    ToolResult { name: String, content: String },
}

/// What the backend answered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatReply {
    Text { content: String },
    ToolCall { name: String, arguments: Value },
}

/// A chat/completion backend.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        capabilities: &[CapabilitySpec],
    ) -> anyhow::Result<ChatReply>;
}

/// Stage whose worker is a language model with tool access.
pub struct AgentStage {
    definition: StageDefinition,
    backend: Arc<dyn ChatBackend>,
    system_prompt: String,
    reads_from: Vec<String>,
    max_turns: usize,
    rules: ValidationRuleSet,
}

impl std::fmt::Debug for AgentStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentStage")
            .field("definition", &self.definition)
            .field("reads_from", &self.reads_from)
            .field("max_turns", &self.max_turns)
            .finish()
    }
}

impl AgentStage {
    pub fn new(
        definition: StageDefinition,
        backend: Arc<dyn ChatBackend>,
        system_prompt: impl Into<String>,
    ) -> Self {
        Self {
            definition,
            backend,
            system_prompt: system_prompt.into(),
            reads_from: Vec::new(),
            max_turns: 16,
            rules: ValidationRuleSet::standard().with_rule(ValidationRule::NonEmptyOutput),
        }
    }

    /// Upstream stages whose committed output is included in the prompt.
    pub fn reading_from<I, S>(mut self, stages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.reads_from = stages.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_max_turns(mut self, max_turns: usize) -> Self {
        self.max_turns = max_turns.max(1);
        self
    }

    pub fn with_rules(mut self, rules: ValidationRuleSet) -> Self {
        self.rules = rules;
        self
    }

    fn prompt(&self, input: &StageInput<'_>) -> String {
        let mut prompt = format!("Task:\n{}\n", input.context.task());
        for stage in &self.reads_from {
            prompt.push_str(&format!("\n[{stage}]\n"));
            prompt.push_str(&upstream_section(input.context, stage));
            prompt.push('\n');
        }
        if let Some(note) = input.retry_note {
            prompt.push_str(&format!(
                "\nAttempt {} of {}. The previous attempt was rejected: {note}\n",
                input.attempt, input.max_attempts
            ));
        }
        prompt
    }
}

fn upstream_section(context: &PipelineContext, stage: &str) -> String {
    match (context.validated_output(stage), context.output(stage)) {
        (Some(data), _) => render(data),
        (None, Some(raw)) => format!("(unvalidated) {}", render(&raw.data)),
        (None, None) => "no information available".to_string(),
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    }
}

fn observation(record: &InvocationRecord) -> String {
    let mut text = match (record.text(), record.error()) {
        (Some(text), _) => text.to_string(),
        (None, Some(error)) => format!("error: {error}"),
        (None, None) => String::new(),
    };
    if !record.issues.is_empty() {
        text.push_str(&format!("\nverification issues: {}", record.issues.join("; ")));
    }
    text
}

#[async_trait]
impl Stage for AgentStage {
    fn definition(&self) -> &StageDefinition {
        &self.definition
    }

    async fn run(&self, input: StageInput<'_>, tools: &StageTools) -> anyhow::Result<StageOutput> {
        let schemas = tools.schemas();
        let mut messages = vec![
            ChatMessage::System {
                content: self.system_prompt.clone(),
            },
            ChatMessage::User {
                content: self.prompt(&input),
            },
        ];

        for _ in 0..self.max_turns {
            match self.backend.complete(&messages, &schemas).await? {
                ChatReply::Text { content } => {
                    let data = json!({
                        "files": extract_file_paths(&content),
                        "structured": extract_fenced_json(&content),
                    });
                    return Ok(StageOutput::text(content).with_data(data));
                }
                ChatReply::ToolCall { name, arguments } => {
                    let record = tools.invoke(name.as_str(), arguments.clone()).await;
                    messages.push(ChatMessage::ToolCall {
                        name: name.clone(),
                        arguments,
                    });
                    messages.push(ChatMessage::ToolResult {
                        name,
                        content: observation(&record),
                    });
                }
            }
        }
        bail!(
            "stage '{}' exceeded {} turns without a final answer",
            self.definition.name,
            self.max_turns
        )
    }

    fn validate(
        &self,
        output: &StageOutput,
        invocations: &[InvocationRecord],
        _context: &PipelineContext,
    ) -> ValidationResult {
        self.rules.evaluate(output, invocations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{CapabilityId, CapabilitySet};
    use crate::context::Provenance;
    use crate::fakes::{CountingHandler, ScriptedChatBackend};
    use crate::invoker::ToolInvoker;
    use crate::registry::CapabilityRegistry;
    use uuid::Uuid;

    fn tools(handler: CountingHandler, allow: CapabilitySet) -> StageTools {
        let mut reg = CapabilityRegistry::new();
        reg.register(
            CapabilitySpec::new(CapabilityId::ReadFile, "read").with_required(["path"]),
            handler,
        )
        .unwrap();
        let invoker = ToolInvoker::new(reg.into_shared(), std::env::temp_dir(), Uuid::nil());
        StageTools::new(Arc::new(invoker), "explore", allow)
    }

    #[tokio::test]
    async fn test_tool_loop_then_final_text() {
        let backend = ScriptedChatBackend::new(vec![
            ChatReply::ToolCall {
                name: "Read".into(),
                arguments: json!({"path": "src/calc.py"}),
            },
            ChatReply::Text {
                content: "The bug is in src/calc.py".into(),
            },
        ]);
        let stage = AgentStage::new(
            StageDefinition::new("explore", CapabilitySet::read_only()),
            Arc::new(backend.clone()),
            "You explore code.",
        );
        let handler = CountingHandler::new("def divide(x, y): return x - y");
        let tools = tools(handler.clone(), CapabilitySet::read_only());
        let ctx = PipelineContext::new("fix divide", ".");
        let input = StageInput {
            context: &ctx,
            attempt: 1,
            max_attempts: 3,
            retry_note: None,
        };

        let output = stage.run(input, &tools).await.unwrap();
        assert_eq!(handler.call_count(), 1);
        assert_eq!(output.data["files"], json!(["src/calc.py"]));

        let second_call = &backend.calls()[1];
        assert!(matches!(
            second_call.last(),
            Some(ChatMessage::ToolResult { content, .. }) if content.contains("return x - y")
        ));

        let records = tools.take_records();
        assert!(stage.validate(&output, &records, &ctx).success);
    }

    #[tokio::test]
    async fn test_turn_limit_is_an_error() {
        let backend = ScriptedChatBackend::new(vec![ChatReply::ToolCall {
            name: "read".into(),
            arguments: json!({"path": "a"}),
        }]);
        let stage = AgentStage::new(
            StageDefinition::new("explore", CapabilitySet::read_only()),
            Arc::new(backend),
            "",
        )
        .with_max_turns(2);
        let tools = tools(CountingHandler::new("x"), CapabilitySet::read_only());
        let ctx = PipelineContext::new("t", ".");
        let input = StageInput {
            context: &ctx,
            attempt: 1,
            max_attempts: 1,
            retry_note: None,
        };
        let err = stage.run(input, &tools).await.unwrap_err();
        assert!(err.to_string().contains("exceeded 2 turns"));
    }

    #[tokio::test]
    async fn test_prompt_marks_upstream_provenance() {
        let mut ctx = PipelineContext::new("fix divide", ".");
        ctx.commit("explore", json!("calc.py is wrong"), Provenance::Unvalidated)
            .unwrap();
        let stage = AgentStage::new(
            StageDefinition::new("plan", CapabilitySet::empty()),
            Arc::new(ScriptedChatBackend::new(vec![])),
            "",
        )
        .reading_from(["explore", "review"]);
        let prompt = stage.prompt(&StageInput {
            context: &ctx,
            attempt: 2,
            max_attempts: 3,
            retry_note: Some("no files listed"),
        });
        assert!(prompt.contains("(unvalidated) calc.py is wrong"));
        assert!(prompt.contains("[review]\nno information available"));
        assert!(prompt.contains("Attempt 2 of 3. The previous attempt was rejected: no files listed"));
    }
}
