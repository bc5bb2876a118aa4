use crate::domain::models::*;
use crate::error::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;
use std::sync::Arc;

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    /// The function object advertised to the model: `{name, description, parameters}`.
    fn schema(&self) -> Value;
    async fn execute(&self, input: Value) -> ToolResult;
}

pub type ChunkStream = BoxStream<'static, Result<StreamDelta>>;

#[async_trait]
pub trait ModelAdapter: Send + Sync {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse>;
}

#[async_trait]
pub trait StreamingModelAdapter: ModelAdapter {
    async fn stream(&self, req: ChatRequest) -> Result<ChunkStream>;
}

/// The backend a turn runs against, chosen once when the orchestrator is built.
#[derive(Clone)]
pub enum Backend {
    Complete(Arc<dyn ModelAdapter>),
    Streaming(Arc<dyn StreamingModelAdapter>),
}

impl Backend {
    pub fn is_streaming(&self) -> bool {
        matches!(self, Backend::Streaming(_))
    }

    pub async fn chat(&self, req: ChatRequest) -> Result<ChatResponse> {
        match self {
            Backend::Complete(adapter) => adapter.chat(req).await,
            Backend::Streaming(adapter) => adapter.chat(req).await,
        }
    }
}
