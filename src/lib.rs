//! Tool-calling assistant orchestrator.
//!
//! A turn goes from [`Orchestrator::process`] to a chat backend, through the
//! [`ToolCallCoordinator`] when the model asks for tools, and ends as an
//! `ai_response_received` event on the [`EventBus`].

pub mod adapters;
pub mod config;
pub mod domain;
pub mod error;
pub mod logging;

pub use domain::coordinator::ToolCallCoordinator;
pub use domain::events::{event_types, Event, EventBus, SubscriptionId};
pub use domain::models::{ConversationTurn, Message, Role, ToolCall, ToolCallResult, ToolOutcome};
pub use domain::orchestrator::{Orchestrator, OrchestratorSettings, TurnOutcome, TurnState};
pub use domain::ports::{Backend, ModelAdapter, StreamingModelAdapter, Tool};
pub use domain::registry::{ToolDefinition, ToolRegistry};
pub use domain::stream::ResponseChunk;
pub use error::{AssistantError, Result};

