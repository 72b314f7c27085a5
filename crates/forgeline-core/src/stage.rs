//! The stage interface the orchestrator drives.
//!
//! A stage is a worker ([`Stage::run`]) plus a validation gate
//! ([`Stage::validate`]) under a fixed [`StageDefinition`]. The orchestrator
//! depends only on this trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::capability::CapabilitySet;
use crate::context::PipelineContext;
use crate::invoker::{InvocationRecord, StageTools};

/// Immutable description of a stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageDefinition {
    pub name: String,
    /// Capabilities the worker may invoke.
    pub allow_list: CapabilitySet,
    /// A required stage that ends unresolved aborts the run.
    #[serde(default = "default_required")]
    pub required: bool,
    /// Whether escalation may offer operator-supplied substitute output.
    #[serde(default)]
    pub accepts_substitute: bool,
}

fn default_required() -> bool {
    true
}

impl StageDefinition {
    /// A required stage with no substitute option.
    pub fn new(name: impl Into<String>, allow_list: CapabilitySet) -> Self {
        Self {
            name: name.into(),
            allow_list,
            required: true,
            accepts_substitute: false,
        }
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn with_substitute(mut self) -> Self {
        self.accepts_substitute = true;
        self
    }
}

/// What a worker sees on each attempt.
#[derive(Debug, Clone, Copy)]
pub struct StageInput<'a> {
    pub context: &'a PipelineContext,
    /// 1-based attempt index.
    pub attempt: u32,
    pub max_attempts: u32,
    /// Why the previous attempt failed; `None` on the first attempt.
    pub retry_note: Option<&'a str>,
}

/// Proposed output of one attempt. Not visible downstream until committed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageOutput {
    pub text: String,
    #[serde(default)]
    pub data: Value,
}

impl StageOutput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            data: Value::Null,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    /// The value committed when this output is accepted without a
    /// validator-provided payload.
    pub fn as_committed(&self) -> Value {
        if self.data.is_null() {
            Value::String(self.text.clone())
        } else {
            self.data.clone()
        }
    }
}

/// Verdict of a stage's validation gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    /// On success, the value committed for the stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ValidationResult {
    pub fn pass(message: impl Into<String>, data: Value) -> Self {
        Self {
            success: true,
            message: message.into(),
            details: None,
            data: Some(data),
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            details: None,
            data: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// A unit of pipeline work.
#[async_trait]
pub trait Stage: Send + Sync {
    fn definition(&self) -> &StageDefinition;

    /// Produce a proposed output, calling capabilities through `tools`.
    ///
    /// An `Err` counts as a failed attempt, exactly like a failed validation.
    async fn run(&self, input: StageInput<'_>, tools: &StageTools) -> anyhow::Result<StageOutput>;

    /// Decide whether `output` passes. Must fail when any invocation in
    /// `invocations` was denied by the allow-list.
    fn validate(
        &self,
        output: &StageOutput,
        invocations: &[InvocationRecord],
        context: &PipelineContext,
    ) -> ValidationResult;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_definition_builders() {
        let def = StageDefinition::new("review", CapabilitySet::read_only())
            .optional()
            .with_substitute();
        assert!(!def.required);
        assert!(def.accepts_substitute);
    }

    #[test]
    fn test_definition_defaults_from_toml() {
        let def: StageDefinition =
            toml::from_str("name = \"plan\"\nallow_list = [\"Read\", \"grep\"]\n").unwrap();
        assert!(def.required);
        assert!(!def.accepts_substitute);
        assert_eq!(def.allow_list.len(), 2);
    }

    #[test]
    fn test_committed_value_falls_back_to_text() {
        assert_eq!(StageOutput::text("plan").as_committed(), json!("plan"));
        assert_eq!(
            StageOutput::text("plan")
                .with_data(json!({"files": []}))
                .as_committed(),
            json!({"files": []})
        );
    }
}
