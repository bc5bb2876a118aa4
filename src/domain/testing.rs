//! Scripted model backend for tests.

use crate::domain::models::{ChatRequest, ChatResponse, StreamDelta};
use crate::domain::ports::{Backend, ChunkStream, ModelAdapter, StreamingModelAdapter};
use crate::error::{AssistantError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

type RequestHook = Arc<dyn Fn(&ChatRequest) + Send + Sync>;

#[derive(Default)]
struct Script {
    replies: VecDeque<Result<ChatResponse>>,
    streams: VecDeque<Vec<Result<StreamDelta>>>,
    requests: Vec<ChatRequest>,
    hook: Option<RequestHook>,
}

/// Plays back queued replies in order and records every request it receives.
#[derive(Clone, Default)]
pub struct ScriptedBackend {
    script: Arc<Mutex<Script>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(self, response: ChatResponse) -> Self {
        self.script.lock().replies.push_back(Ok(response));
        self
    }

    pub fn fail(self, error: AssistantError) -> Self {
        self.script.lock().replies.push_back(Err(error));
        self
    }

    pub fn stream(self, deltas: Vec<StreamDelta>) -> Self {
        self.script
            .lock()
            .streams
            .push_back(deltas.into_iter().map(Ok).collect());
        self
    }

    pub fn stream_then_fail(self, deltas: Vec<StreamDelta>, error: AssistantError) -> Self {
        let mut items: Vec<Result<StreamDelta>> = deltas.into_iter().map(Ok).collect();
        items.push(Err(error));
        self.script.lock().streams.push_back(items);
        self
    }

    /// Runs `hook` on every request before it is answered.
    pub fn on_request(self, hook: impl Fn(&ChatRequest) + Send + Sync + 'static) -> Self {
        self.script.lock().hook = Some(Arc::new(hook));
        self
    }

    fn run_hook(&self, req: &ChatRequest) {
        let hook = self.script.lock().hook.clone();
        if let Some(hook) = hook {
            hook(req);
        }
    }

    pub fn complete(&self) -> Backend {
        Backend::Complete(Arc::new(self.clone()))
    }

    pub fn streaming(&self) -> Backend {
        Backend::Streaming(Arc::new(self.clone()))
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.script.lock().requests.clone()
    }

    pub fn chat_requests(&self) -> Vec<ChatRequest> {
        self.requests().into_iter().filter(|r| !r.stream).collect()
    }

    pub fn stream_requests(&self) -> Vec<ChatRequest> {
        self.requests().into_iter().filter(|r| r.stream).collect()
    }
}

#[async_trait]
impl ModelAdapter for ScriptedBackend {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse> {
        self.run_hook(&req);
        let mut script = self.script.lock();
        script.requests.push(req);
        script
            .replies
            .pop_front()
            .unwrap_or_else(|| Err(AssistantError::BackendRequest("script exhausted".to_string())))
    }
}

#[async_trait]
impl StreamingModelAdapter for ScriptedBackend {
    async fn stream(&self, req: ChatRequest) -> Result<ChunkStream> {
        self.run_hook(&req);
        let mut script = self.script.lock();
        script.requests.push(req);
        let items = script
            .streams
            .pop_front()
            .ok_or_else(|| AssistantError::BackendRequest("script exhausted".to_string()))?;
        Ok(Box::pin(futures::stream::iter(items)))
    }
}
