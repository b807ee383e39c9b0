//! Tool abstraction for model-invoked capabilities.
//!
//! The classifier exposes exactly one tool, `move_email`. The model only
//! ever sees folder paths; ids stay inside the resolver.

pub mod move_email;
pub mod registry;

pub use move_email::{MOVE_EMAIL_TOOL, MoveEmailTool, MoveReceipt};
pub use registry::ToolRegistry;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::ToolError;

/// Per-classification context handed to every tool call.
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// Mailbox owner the classification runs for.
    pub owner_id: String,
    /// The message currently being classified.
    pub message_id: String,
}

impl ToolContext {
    pub fn new(owner_id: impl Into<String>, message_id: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            message_id: message_id.into(),
        }
    }
}

/// Result of a successful tool execution.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub result: serde_json::Value,
    /// Wall time spent in the tool.
    pub duration: Duration,
}

impl ToolOutput {
    pub fn success(result: serde_json::Value, duration: Duration) -> Self {
        Self { result, duration }
    }

    /// Text handed back to the model as the tool result.
    pub fn to_model_text(&self) -> String {
        match &self.result {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// A capability the model can invoke.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON schema of the tool's parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError>;
}

/// Read a required string parameter.
pub fn require_str<'a>(
    tool: &str,
    params: &'a serde_json::Value,
    key: &str,
) -> Result<&'a str, ToolError> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| ToolError::InvalidParameters {
            name: tool.to_string(),
            reason: format!("missing string parameter '{key}'"),
        })
}
