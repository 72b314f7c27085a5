//! Declarative stages and pipeline files.
//!
//! A scripted stage replays a fixed list of capability calls and is judged
//! by a [`ValidationRuleSet`]. A pipeline file is an ordered list of them:
//!
//! ```toml
//! [[stages]]
//! name = "explore"
//! allow_list = ["read", "glob"]
//! calls = [{ capability = "glob", arguments = { pattern = "**/*.py" } }]
//! rules = [{ type = "require_capability", capability = "glob" }]
//!
//! [[stages]]
//! name = "review"
//! required = false
//! reads_from = ["explore"]
//! allow_list = ["read"]
//! ```
//!
//! String arguments may reference `{task}`, `{run_id}` and `{attempt}`.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::capability::{CapabilityId, CapabilitySet};
use crate::config::OrchestratorConfig;
use crate::context::PipelineContext;
use crate::error::{PipelineError, Result};
use crate::invoker::{InvocationRecord, StageTools};
use crate::stage::{Stage, StageDefinition, StageInput, StageOutput, ValidationResult};
use crate::validation::ValidationRuleSet;

/// One replayed capability call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptedCall {
    pub capability: CapabilityId,
    #[serde(default = "empty_object")]
    pub arguments: Value,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

fn default_required() -> bool {
    true
}

/// Data-driven stage definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptedStageSpec {
    pub name: String,
    #[serde(default = "default_required")]
    pub required: bool,
    #[serde(default)]
    pub allow_list: CapabilitySet,
    #[serde(default)]
    pub accepts_substitute: bool,
    #[serde(default)]
    pub calls: Vec<ScriptedCall>,
    /// Upstream stages whose presence is reported in the output data.
    #[serde(default)]
    pub reads_from: Vec<String>,
    #[serde(default)]
    pub rules: ValidationRuleSet,
}

impl ScriptedStageSpec {
    pub fn definition(&self) -> StageDefinition {
        StageDefinition {
            name: self.name.clone(),
            allow_list: self.allow_list.clone(),
            required: self.required,
            accepts_substitute: self.accepts_substitute,
        }
    }

    pub fn check(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(PipelineError::InvalidConfig(
                "stage name must not be empty".to_string(),
            ));
        }
        self.rules
            .check()
            .map_err(|e| PipelineError::InvalidConfig(format!("stage '{}': {e}", self.name)))
    }
}

/// Replace `{task}`, `{run_id}` and `{attempt}` in every string of `value`.
fn render_arguments(value: &Value, input: &StageInput<'_>) -> Value {
    match value {
        Value::String(s) => Value::String(
            s.replace("{task}", input.context.task())
                .replace("{run_id}", &input.context.run_id().to_string())
                .replace("{attempt}", &input.attempt.to_string()),
        ),
        Value::Array(items) => Value::Array(items.iter().map(|v| render_arguments(v, input)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render_arguments(v, input)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Stage built from a [`ScriptedStageSpec`].
#[derive(Debug, Clone)]
pub struct ScriptedStage {
    spec: ScriptedStageSpec,
    definition: StageDefinition,
}

impl ScriptedStage {
    pub fn new(spec: ScriptedStageSpec) -> Self {
        let definition = spec.definition();
        Self { spec, definition }
    }

    pub fn spec(&self) -> &ScriptedStageSpec {
        &self.spec
    }
}

#[async_trait]
impl Stage for ScriptedStage {
    fn definition(&self) -> &StageDefinition {
        &self.definition
    }

    async fn run(&self, input: StageInput<'_>, tools: &StageTools) -> anyhow::Result<StageOutput> {
        let mut lines = Vec::with_capacity(self.spec.calls.len());
        let mut calls = Vec::with_capacity(self.spec.calls.len());

        for call in &self.spec.calls {
            let arguments = render_arguments(&call.arguments, &input);
            let record = tools.invoke(call.capability.clone(), arguments).await;
            let status = match (record.text(), record.error()) {
                (Some(_), _) => "ok".to_string(),
                (None, Some(e)) => format!("error: {e}"),
                (None, None) => "no result".to_string(),
            };
            lines.push(format!("#{} {}: {status}", record.seq, record.capability));
            calls.push(json!({
                "seq": record.seq,
                "capability": record.capability,
                "allowed": record.allowed,
                "ok": record.is_ok(),
                "text": record.text(),
                "error": record.error(),
                "issues": record.issues,
            }));
        }

        let upstream: Map<String, Value> = self
            .spec
            .reads_from
            .iter()
            .map(|name| {
                let state = match input.context.output(name) {
                    Some(o) if o.provenance.is_trusted() => "validated",
                    Some(_) => "unvalidated",
                    None => "absent",
                };
                (name.clone(), Value::String(state.to_string()))
            })
            .collect();

        Ok(StageOutput::text(lines.join("\n")).with_data(json!({
            "calls": calls,
            "upstream": upstream,
        })))
    }

    fn validate(
        &self,
        output: &StageOutput,
        invocations: &[InvocationRecord],
        _context: &PipelineContext,
    ) -> ValidationResult {
        self.spec.rules.evaluate(output, invocations)
    }
}

/// A pipeline file: optional orchestrator settings and ordered stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    #[serde(default)]
    pub config: Option<OrchestratorConfig>,
    pub stages: Vec<ScriptedStageSpec>,
}

impl PipelineDefinition {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let def: Self = toml::from_str(s)?;
        def.check()?;
        Ok(def)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        Self::from_toml_str(&std::fs::read_to_string(path)?)
    }

    pub fn check(&self) -> Result<()> {
        if self.stages.is_empty() {
            return Err(PipelineError::InvalidConfig(
                "pipeline has no stages".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for stage in &self.stages {
            stage.check()?;
            if !seen.insert(stage.name.as_str()) {
                return Err(PipelineError::DuplicateStage(stage.name.clone()));
            }
        }
        if let Some(config) = &self.config {
            config.validate()?;
        }
        Ok(())
    }

    pub fn into_stages(self) -> Vec<Arc<dyn Stage>> {
        self.stages
            .into_iter()
            .map(|spec| Arc::new(ScriptedStage::new(spec)) as Arc<dyn Stage>)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation::ValidationRule;

    const PIPELINE: &str = r#"
[config]
max_attempts = 2

[[stages]]
name = "explore"
allow_list = ["read", "glob"]
calls = [{ capability = "glob", arguments = { pattern = "**/*.py" } }]
rules = [{ type = "require_capability", capability = "glob" }]

[[stages]]
name = "review"
required = false
reads_from = ["explore"]
allow_list = ["read"]
"#;

    #[test]
    fn test_parse_pipeline() {
        let def = PipelineDefinition::from_toml_str(PIPELINE).unwrap();
        assert_eq!(def.config.as_ref().unwrap().max_attempts, 2);
        assert_eq!(def.stages.len(), 2);
        let explore = &def.stages[0];
        assert!(explore.required);
        assert_eq!(explore.calls[0].capability, CapabilityId::Glob);
        assert_eq!(explore.rules.rules()[0], ValidationRule::NoBoundaryViolations);
        let review = &def.stages[1];
        assert!(!review.required);
        assert_eq!(review.rules, ValidationRuleSet::standard());
        assert_eq!(def.into_stages().len(), 2);
    }

    #[test]
    fn test_duplicate_stage_rejected() {
        let text = "[[stages]]\nname = \"a\"\n\n[[stages]]\nname = \"a\"\n";
        let err = PipelineDefinition::from_toml_str(text).unwrap_err();
        assert!(matches!(err, PipelineError::DuplicateStage(n) if n == "a"));
    }

    #[test]
    fn test_empty_pipeline_rejected() {
        let err = PipelineDefinition::from_toml_str("stages = []").unwrap_err();
        assert!(matches!(err, PipelineError::InvalidConfig(_)));
    }

    #[test]
    fn test_render_arguments() {
        let ctx = PipelineContext::new("fix divide", ".");
        let input = StageInput {
            context: &ctx,
            attempt: 2,
            max_attempts: 3,
            retry_note: None,
        };
        let rendered = render_arguments(
            &json!({"command": "echo '{task}' {attempt}", "n": 1, "list": ["{task}"]}),
            &input,
        );
        assert_eq!(
            rendered,
            json!({"command": "echo 'fix divide' 2", "n": 1, "list": ["fix divide"]})
        );
    }
}
