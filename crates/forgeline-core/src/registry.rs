//! Capability registry: handler contract, specs and lookup.
//!
//! The registry is built once at startup and shared read-only (behind `Arc`)
//! by every pipeline run.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::capability::CapabilityId;
use crate::error::{PipelineError, Result};

/// Ambient information handed to every handler call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub working_dir: PathBuf,
    pub run_id: Uuid,
    pub stage: String,
}

impl ExecutionContext {
    pub fn new(working_dir: impl Into<PathBuf>, run_id: Uuid, stage: impl Into<String>) -> Self {
        Self {
            working_dir: working_dir.into(),
            run_id,
            stage: stage.into(),
        }
    }

    /// Resolve a possibly-relative path argument against the working directory.
    pub fn resolve(&self, path: impl AsRef<Path>) -> PathBuf {
        let path = path.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.working_dir.join(path)
        }
    }
}

/// What a handler reports for an expected outcome: a success payload or an
/// error, never both.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CapabilityOutcome {
    Success { text: String },
    Failure { error: String },
}

impl CapabilityOutcome {
    pub fn success(text: impl Into<String>) -> Self {
        Self::Success { text: text.into() }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self::Failure {
            error: error.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// Contract for a concrete capability implementation.
///
/// Expected failures (missing file, non-zero exit) must come back as
/// [`CapabilityOutcome::Failure`] so the recovery layer can classify them.
/// `Err` is reserved for faults the handler did not anticipate.
#[async_trait]
pub trait CapabilityHandler: Send + Sync + 'static {
    async fn execute(
        &self,
        arguments: &Value,
        ctx: &ExecutionContext,
    ) -> anyhow::Result<CapabilityOutcome>;
}

/// Declared shape of a capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilitySpec {
    pub id: CapabilityId,
    pub description: String,
    /// JSON schema advertised to language-model backends.
    pub input_schema: Value,
    /// Top-level argument fields that must be present.
    pub required_arguments: Vec<String>,
}

impl CapabilitySpec {
    pub fn new(id: impl Into<CapabilityId>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            input_schema: serde_json::json!({"type": "object"}),
            required_arguments: Vec::new(),
        }
    }

    /// Declare required string arguments and derive a matching object schema.
    pub fn with_required<const N: usize>(mut self, fields: [&str; N]) -> Self {
        let properties: serde_json::Map<String, Value> = fields
            .iter()
            .map(|f| ((*f).to_string(), serde_json::json!({"type": "string"})))
            .collect();
        self.required_arguments = fields.iter().map(|f| (*f).to_string()).collect();
        self.input_schema = serde_json::json!({
            "type": "object",
            "properties": properties,
            "required": self.required_arguments,
        });
        self
    }

    pub fn with_schema(mut self, schema: Value) -> Self {
        self.input_schema = schema;
        self
    }

    /// First required argument missing from `arguments`, if any.
    pub fn missing_argument(&self, arguments: &Value) -> Option<&str> {
        self.required_arguments
            .iter()
            .find(|field| arguments.get(field.as_str()).is_none())
            .map(String::as_str)
    }
}

/// A registered capability: spec plus handler.
#[derive(Clone)]
pub struct RegisteredCapability {
    pub spec: CapabilitySpec,
    pub handler: Arc<dyn CapabilityHandler>,
}

impl std::fmt::Debug for RegisteredCapability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredCapability")
            .field("spec", &self.spec)
            .finish_non_exhaustive()
    }
}

/// Maps capability ids to handlers.
#[derive(Debug, Clone, Default)]
pub struct CapabilityRegistry {
    entries: HashMap<CapabilityId, RegisteredCapability>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H>(&mut self, spec: CapabilitySpec, handler: H) -> Result<()>
    where
        H: CapabilityHandler,
    {
        self.register_arc(spec, Arc::new(handler))
    }

    pub fn register_arc(
        &mut self,
        spec: CapabilitySpec,
        handler: Arc<dyn CapabilityHandler>,
    ) -> Result<()> {
        if self.entries.contains_key(&spec.id) {
            return Err(PipelineError::DuplicateCapability(spec.id.to_string()));
        }
        self.entries
            .insert(spec.id.clone(), RegisteredCapability { spec, handler });
        Ok(())
    }

    pub fn get(&self, id: &CapabilityId) -> Option<&RegisteredCapability> {
        self.entries.get(id)
    }

    pub fn spec(&self, id: &CapabilityId) -> Option<&CapabilitySpec> {
        self.entries.get(id).map(|e| &e.spec)
    }

    pub fn contains(&self, id: &CapabilityId) -> bool {
        self.entries.contains_key(id)
    }

    /// Registered ids in canonical-name order.
    pub fn ids(&self) -> Vec<CapabilityId> {
        let mut ids: Vec<_> = self.entries.keys().cloned().collect();
        ids.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        ids
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Freeze the registry for sharing across runs.
    pub fn into_shared(self) -> Arc<Self> {
        Arc::new(self)
    }
}
