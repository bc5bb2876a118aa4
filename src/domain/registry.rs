//! Catalog of the tools the model may call.

use crate::domain::models::ToolResult;
use crate::domain::ports::Tool;
use crate::error::{AssistantError, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

type Handler = dyn Fn(Value) -> ToolResult + Send + Sync;

/// A tool built from a name, a parameter schema and a plain function.
pub struct ToolDefinition {
    name: String,
    description: String,
    parameters: Value,
    handler: Arc<Handler>,
}

impl ToolDefinition {
    pub fn new<F>(name: impl Into<String>, description: impl Into<String>, parameters: Value, handler: F) -> Self
    where
        F: Fn(Value) -> ToolResult + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            handler: Arc::new(handler),
        }
    }
}

#[async_trait]
impl Tool for ToolDefinition {
    fn name(&self) -> &str {
        &self.name
    }

    fn schema(&self) -> Value {
        json!({
            "name": self.name,
            "description": self.description,
            "parameters": self.parameters,
        })
    }

    async fn execute(&self, input: Value) -> ToolResult {
        (self.handler.as_ref())(input)
    }
}

/// Insertion-ordered tool catalog.
///
/// Mutation needs `&mut self`; once handed to the orchestrator the registry is
/// frozen behind an `Arc`, so nothing can be registered while turns run.
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
    index: HashMap<String, usize>,
    reject_duplicates: bool,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// With `reject_duplicates` a second tool with an existing name is refused
    /// instead of replacing the first one.
    pub fn with_duplicate_rejection(reject_duplicates: bool) -> Self {
        Self {
            reject_duplicates,
            ..Self::default()
        }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<()> {
        let name = tool.name().to_string();
        if name.trim().is_empty() {
            return Err(AssistantError::InvalidDefinition(
                "tool name must not be empty".to_string(),
            ));
        }

        let schema = tool.schema();
        let Some(schema_obj) = schema.as_object() else {
            return Err(AssistantError::InvalidDefinition(format!(
                "schema for '{}' must be a JSON object",
                name
            )));
        };
        if let Some(declared) = schema_obj.get("name") {
            if declared.as_str() != Some(name.as_str()) {
                return Err(AssistantError::InvalidDefinition(format!(
                    "schema name {} does not match tool name '{}'",
                    declared, name
                )));
            }
        }

        match self.index.get(&name) {
            Some(_) if self.reject_duplicates => Err(AssistantError::DuplicateTool(name)),
            Some(&pos) => {
                warn!(tool = %name, "Tool registered twice, replacing previous definition");
                self.tools[pos] = tool;
                Ok(())
            }
            None => {
                self.index.insert(name.clone(), self.tools.len());
                self.tools.push(tool);
                info!(tool = %name, "Tool registered");
                Ok(())
            }
        }
    }

    /// Convenience wrapper for closure-backed tools.
    pub fn register_fn<F>(&mut self, name: &str, description: &str, parameters: Value, handler: F) -> Result<()>
    where
        F: Fn(Value) -> ToolResult + Send + Sync + 'static,
    {
        self.register(Arc::new(ToolDefinition::new(name, description, parameters, handler)))
    }

    pub fn lookup(&self, name: &str) -> Result<Arc<dyn Tool>> {
        self.index
            .get(name)
            .map(|&pos| Arc::clone(&self.tools[pos]))
            .ok_or_else(|| AssistantError::ToolNotFound(name.to_string()))
    }

    /// Schemas in registration order, wrapped the way chat-completion backends
    /// expect: `{ type: "function", function: {...} }`.
    pub fn list_schemas(&self) -> Vec<Value> {
        self.tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": t.schema()
                })
            })
            .collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn clear(&mut self) {
        self.tools.clear();
        self.index.clear();
        info!("Tool registry cleared");
    }
}
