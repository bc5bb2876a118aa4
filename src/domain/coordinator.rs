use crate::domain::events::{event_types, panic_message, EventBus};
use crate::domain::models::{Message, ToolCall, ToolCallResult, ToolOutcome};
use crate::domain::registry::ToolRegistry;
use crate::error::{AssistantError, Result};
use futures::FutureExt;
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{error, info, warn};

pub const ARGUMENT_PARSE_ERROR: &str = "argument parse error";
pub const UNKNOWN_TOOL: &str = "unknown tool";

/// Runs the tool calls of one model reply against the registry.
///
/// A failing call only affects its own result: bad arguments, unknown names,
/// handler errors and handler panics all become `ToolOutcome::Err` for that id.
pub struct ToolCallCoordinator {
    registry: Arc<ToolRegistry>,
    bus: Arc<EventBus>,
}

impl ToolCallCoordinator {
    pub fn new(registry: Arc<ToolRegistry>, bus: Arc<EventBus>) -> Self {
        Self { registry, bus }
    }

    pub async fn execute(&self, requests: &[ToolCall]) -> Vec<ToolCallResult> {
        let mut results = Vec::with_capacity(requests.len());
        for call in requests {
            let outcome = self.execute_one(call).await;
            results.push(ToolCallResult {
                id: call.id.clone(),
                tool_name: call.name.clone(),
                outcome,
            });
        }
        results
    }

    async fn execute_one(&self, call: &ToolCall) -> ToolOutcome {
        let args = match parse_arguments(&call.arguments) {
            Ok(args) => args,
            Err(e) => return failed(call, e),
        };

        let tool = match self.registry.lookup(&call.name) {
            Ok(tool) => tool,
            Err(e) => return failed(call, e),
        };

        info!(tool = %call.name, id = %call.id, "Executing tool");
        let outcome = match AssertUnwindSafe(tool.execute(args.clone())).catch_unwind().await {
            Ok(Ok(value)) => ToolOutcome::Ok(value),
            Ok(Err(message)) => failed(call, AssistantError::ToolExecution(message)),
            Err(panic) => {
                let message = panic_message(&panic);
                error!(tool = %call.name, panic = %message, "Tool panicked");
                failed(call, AssistantError::ToolExecution(format!("tool panicked: {}", message)))
            }
        };

        self.bus.publish(
            event_types::TOOL_EXECUTED,
            json!({
                "name": call.name,
                "arguments": args,
                "outcome": outcome,
            }),
        );

        outcome
    }

    /// Renders results as `role: tool` messages, one per requested id that has
    /// a result, in request order and without repeating an id.
    pub fn format_for_backend(requests: &[ToolCall], results: &[ToolCallResult]) -> Vec<Message> {
        let mut seen = HashSet::new();
        requests
            .iter()
            .filter(|call| seen.insert(call.id.as_str()))
            .filter_map(|call| {
                results
                    .iter()
                    .find(|r| r.id == call.id)
                    .map(|r| Message::tool_result(call.id.clone(), render_outcome(&r.outcome)))
            })
            .collect()
    }
}

/// Blank argument text means "no arguments"; anything else must be a JSON object.
fn parse_arguments(text: &str) -> Result<Value> {
    if text.trim().is_empty() {
        return Ok(Value::Object(Map::new()));
    }
    match serde_json::from_str::<Value>(text) {
        Ok(value @ Value::Object(_)) => Ok(value),
        Ok(other) => Err(AssistantError::ArgumentParse(format!(
            "expected a JSON object, got {}",
            json_type(&other)
        ))),
        Err(e) => Err(AssistantError::ArgumentParse(e.to_string())),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Logs a per-call failure and turns it into the text the model sees.
fn failed(call: &ToolCall, e: AssistantError) -> ToolOutcome {
    warn!(tool = %call.name, id = %call.id, kind = e.kind(), error = %e, "Tool call failed");
    let message = match e {
        AssistantError::ArgumentParse(_) => ARGUMENT_PARSE_ERROR.to_string(),
        AssistantError::ToolNotFound(_) => UNKNOWN_TOOL.to_string(),
        AssistantError::ToolExecution(message) => message,
        other => other.to_string(),
    };
    ToolOutcome::Err(message)
}

pub fn render_outcome(outcome: &ToolOutcome) -> String {
    match outcome {
        ToolOutcome::Ok(Value::String(s)) => s.clone(),
        ToolOutcome::Ok(value) => value.to_string(),
        ToolOutcome::Err(message) => format!("Error: {}", message),
    }
}
