use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::capabilities::{Capabilities, Capability};
use crate::error::ChatError;

/// Outcome of one tool call, sent to the panel as a `toolResult` notification.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolResult {
    pub tool: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolResult {
    pub fn ok(tool: impl Into<String>, data: Value) -> Self {
        Self {
            tool: tool.into(),
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(tool: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }
}

#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Capability that must be enabled before `handle` runs
    fn required_capability(&self) -> Option<Capability> {
        None
    }

    async fn handle(&self, payload: &Value) -> Result<Value, String>;
}

/// Maps a payload's `type` field to its handler.
pub struct ToolDispatcher {
    handlers: HashMap<String, Arc<dyn ToolHandler>>,
    capabilities: Arc<Capabilities>,
}

impl ToolDispatcher {
    pub fn new(capabilities: Arc<Capabilities>) -> Self {
        Self {
            handlers: HashMap::new(),
            capabilities,
        }
    }

    pub fn register(&mut self, tool_type: impl Into<String>, handler: Arc<dyn ToolHandler>) {
        self.handlers.insert(tool_type.into(), handler);
    }

    pub fn has_handler(&self, tool_type: &str) -> bool {
        self.handlers.contains_key(tool_type)
    }

    /// Never fails: every problem becomes a failed `ToolResult`.
    pub async fn dispatch(&self, payload: &Value) -> ToolResult {
        let Some(tool_type) = payload.get("type").and_then(Value::as_str) else {
            warn!("tool call without a type field");
            return ToolResult::err("unknown", "tool call payload has no \"type\" field");
        };

        let Some(handler) = self.handlers.get(tool_type) else {
            warn!(tool = tool_type, "no handler registered");
            return ToolResult::err(tool_type, ChatError::UnknownTool(tool_type.to_string()).to_string());
        };

        if let Some(capability) = handler.required_capability() {
            if !self.capabilities.is_enabled(capability) {
                info!(tool = tool_type, capability = capability.key(), "capability disabled");
                return ToolResult::err(
                    tool_type,
                    format!("Capability {} is disabled", capability.key()),
                );
            }
        }

        info!(tool = tool_type, "executing tool call");
        match handler.handle(payload).await {
            Ok(data) => ToolResult::ok(tool_type, data),
            Err(e) => {
                warn!(tool = tool_type, error = %e, "tool call failed");
                ToolResult::err(tool_type, e)
            }
        }
    }
}
