//! Tool registry: lookup by name, argument validation and dispatch.

use std::collections::HashMap;
use std::sync::Arc;

use carebot_core::error::{CarebotError, Result};
use carebot_core::traits::Tool;
use carebot_core::types::{ToolDefinition, ToolResult};

/// Tools available to the model, keyed by name.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool, replacing any previous tool with the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Definitions advertised to the model, sorted by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self.tools.values().map(|t| t.definition()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Look up, validate and run a tool call.
    pub async fn execute(&self, name: &str, arguments: &str) -> Result<ToolResult> {
        let tool = self
            .get(name)
            .ok_or_else(|| CarebotError::ToolNotFound(name.to_string()))?;

        let raw = if arguments.trim().is_empty() { "{}" } else { arguments };
        let args: serde_json::Value = serde_json::from_str(raw)
            .map_err(|e| CarebotError::Tool(format!("{name}: arguments are not valid JSON: {e}")))?;
        validate_args(&tool.definition(), &args)
            .map_err(|e| CarebotError::Tool(format!("{name}: {e}")))?;

        tool.execute(raw).await
    }
}

/// Validate that a tool call has the required arguments.
pub fn validate_args(definition: &ToolDefinition, args: &serde_json::Value) -> std::result::Result<(), String> {
    if !args.is_object() {
        return Err("arguments must be a JSON object".into());
    }
    let params = &definition.parameters;
    if let Some(required) = params.get("required").and_then(|r| r.as_array()) {
        for key in required.iter().filter_map(|r| r.as_str()) {
            if args.get(key).is_none_or(|v| v.is_null()) {
                return Err(format!("Missing required argument: {key}"));
            }
        }
    }
    Ok(())
}
