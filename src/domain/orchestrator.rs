use crate::config::Config;
use crate::domain::context::ContextBuilder;
use crate::domain::coordinator::ToolCallCoordinator;
use crate::domain::events::{event_types, EventBus};
use crate::domain::models::{
    ChatRequest, ChatResponse, ConversationTurn, GenerationParams, Message, ModelId, ToolCall, Usage,
};
use crate::domain::ports::{Backend, StreamingModelAdapter};
use crate::domain::registry::ToolRegistry;
use crate::domain::stream::{ChunkQueue, ResponseChunk};
use crate::error::{AssistantError, Result};
use futures::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub const DEFAULT_APOLOGY: &str = "Sorry, I ran into a problem while processing your request.";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    Requesting,
    DirectAnswer,
    ToolCallsDetected,
    ExecutingTools,
    RequestingFinal,
    Responding,
    Failed,
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub model: ModelId,
    pub system_prompt: String,
    pub params: GenerationParams,
    /// History window, counted in user/assistant pairs.
    pub context_window_size: usize,
    pub apology: String,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl OrchestratorSettings {
    /// Settings taken from the `ai` section.
    pub fn from_config(config: &Config) -> Self {
        let ai = config.ai();
        Self {
            model: ModelId(ai.model),
            system_prompt: ai.system_prompt,
            params: GenerationParams {
                temperature: ai.temperature,
                top_p: ai.top_p,
                max_tokens: ai.max_tokens,
                frequency_penalty: ai.frequency_penalty,
                presence_penalty: ai.presence_penalty,
            },
            context_window_size: ai.context_window_size,
            apology: ai.apology,
        }
    }
}

/// What a finished turn produced. On failure `answer` holds the apology and
/// `error` the reason.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TurnOutcome {
    pub answer: String,
    pub streamed: bool,
    pub tool_calls_executed: usize,
    pub error: Option<String>,
}

impl TurnOutcome {
    fn skipped() -> Self {
        Self {
            answer: String::new(),
            streamed: false,
            tool_calls_executed: 0,
            error: None,
        }
    }
}

struct Answer {
    text: String,
    usage: Option<Usage>,
    tool_calls_executed: usize,
}

struct Inner {
    backend: Backend,
    registry: Arc<ToolRegistry>,
    coordinator: ToolCallCoordinator,
    bus: Arc<EventBus>,
    settings: OrchestratorSettings,
    in_flight: AtomicBool,
    state: Mutex<TurnState>,
    chunks: ChunkQueue,
}

/// Drives one user turn from input to published answer.
///
/// Cheap to clone; clones share the backend, the in-flight flag and the chunk
/// queue.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

/// Clears the in-flight flag and returns to `Idle` however the turn ends.
struct InFlightGuard<'a> {
    inner: &'a Inner,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.inner.set_state(TurnState::Idle);
        self.inner.in_flight.store(false, Ordering::SeqCst);
    }
}

/// Ends the chunk stream once, even if the streaming adapter panics.
struct StreamEndGuard<'a> {
    chunks: &'a ChunkQueue,
}

impl Drop for StreamEndGuard<'_> {
    fn drop(&mut self) {
        self.chunks.finish();
    }
}

impl Orchestrator {
    pub fn new(backend: Backend, registry: ToolRegistry, bus: Arc<EventBus>, settings: OrchestratorSettings) -> Self {
        let registry = Arc::new(registry);
        let coordinator = ToolCallCoordinator::new(Arc::clone(&registry), Arc::clone(&bus));
        info!(
            model = %settings.model.0,
            streaming = backend.is_streaming(),
            tools = registry.len(),
            "Orchestrator ready"
        );
        Self {
            inner: Arc::new(Inner {
                backend,
                registry,
                coordinator,
                bus,
                settings,
                in_flight: AtomicBool::new(false),
                state: Mutex::new(TurnState::Idle),
                chunks: ChunkQueue::new(),
            }),
        }
    }

    pub fn is_processing(&self) -> bool {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> TurnState {
        *self.inner.state.lock()
    }

    pub fn is_streaming(&self) -> bool {
        self.inner.backend.is_streaming()
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.inner.registry
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.inner.bus
    }

    /// Next streamed chunk, waiting up to `timeout`.
    pub fn next_chunk(&self, timeout: Duration) -> Option<ResponseChunk> {
        self.inner.chunks.next(timeout)
    }

    /// Runs the turn on its own task.
    pub fn spawn(&self, turn: ConversationTurn) -> JoinHandle<TurnOutcome> {
        let this = self.clone();
        tokio::spawn(async move { this.process(turn).await })
    }

    pub async fn process(&self, turn: ConversationTurn) -> TurnOutcome {
        if turn.user_text.trim().is_empty() {
            debug!("Ignoring blank user input");
            return TurnOutcome::skipped();
        }

        let inner = &self.inner;
        if inner.in_flight.swap(true, Ordering::SeqCst) {
            warn!("A turn is already in flight, starting another one concurrently");
        }
        let _guard = InFlightGuard { inner: inner.as_ref() };

        let messages = ContextBuilder::build(
            &turn,
            &inner.settings.system_prompt,
            inner.settings.context_window_size,
        );
        let estimated_tokens = ContextBuilder::estimate_message_tokens(&messages);
        debug!(messages = messages.len(), estimated_tokens, "Context built");

        let streamed = inner.backend.is_streaming();
        let result = match &inner.backend {
            Backend::Complete(_) => inner.complete_turn(messages).await,
            Backend::Streaming(adapter) => {
                let _end = StreamEndGuard { chunks: &inner.chunks };
                inner.streaming_turn(adapter.as_ref(), messages).await
            }
        };

        match result {
            Ok(answer) => {
                inner.set_state(TurnState::Responding);
                let estimated = ContextBuilder::estimate_tokens(&answer.text);
                inner.bus.publish(
                    event_types::AI_RESPONSE_RECEIVED,
                    json!({
                        "response": answer.text,
                        "model": inner.settings.model.0,
                        "streaming": streamed,
                        "tokens": answer.usage,
                        "estimated_tokens": estimated,
                    }),
                );
                info!(tool_calls = answer.tool_calls_executed, streamed, "Turn completed");
                TurnOutcome {
                    answer: answer.text,
                    streamed,
                    tool_calls_executed: answer.tool_calls_executed,
                    error: None,
                }
            }
            Err(e) => {
                inner.set_state(TurnState::Failed);
                error!(error = %e, kind = e.kind(), "Turn failed");
                let message = e.to_string();
                inner.bus.publish(
                    event_types::ERROR,
                    json!({
                        "source": "orchestrator",
                        "kind": e.kind(),
                        "message": message,
                        "critical": false,
                    }),
                );
                inner.bus.publish(
                    event_types::AI_RESPONSE_RECEIVED,
                    json!({
                        "response": inner.settings.apology,
                        "model": inner.settings.model.0,
                        "streaming": streamed,
                        "estimated_tokens": ContextBuilder::estimate_tokens(&inner.settings.apology),
                        "error": message,
                    }),
                );
                TurnOutcome {
                    answer: inner.settings.apology.clone(),
                    streamed,
                    tool_calls_executed: 0,
                    error: Some(message),
                }
            }
        }
    }
}

impl Inner {
    fn set_state(&self, next: TurnState) {
        let mut state = self.state.lock();
        if *state != next {
            debug!(from = ?*state, to = ?next, "Turn state");
            *state = next;
        }
    }

    fn request(&self, messages: Vec<Message>, stream: bool) -> ChatRequest {
        let tools = if self.registry.is_empty() {
            None
        } else {
            Some(self.registry.list_schemas())
        };
        ChatRequest {
            messages,
            model_id: self.settings.model.clone(),
            params: self.settings.params,
            tools,
            stream,
        }
    }

    async fn complete_turn(&self, messages: Vec<Message>) -> Result<Answer> {
        self.set_state(TurnState::Requesting);
        let response = self.backend.chat(self.request(messages.clone(), false)).await?;
        self.settle(messages, response).await
    }

    /// Turns a non-streamed reply into the final answer, running the tool
    /// path when the reply asks for tools.
    async fn settle(&self, messages: Vec<Message>, response: ChatResponse) -> Result<Answer> {
        if response.has_tool_calls() {
            self.set_state(TurnState::ToolCallsDetected);
            self.run_tool_calls(messages, response).await
        } else {
            self.set_state(TurnState::DirectAnswer);
            Ok(Answer {
                text: response.content.unwrap_or_default(),
                usage: response.usage,
                tool_calls_executed: 0,
            })
        }
    }

    async fn run_tool_calls(&self, mut messages: Vec<Message>, response: ChatResponse) -> Result<Answer> {
        let calls: Vec<ToolCall> = response.tool_calls.unwrap_or_default();

        let mut ids = HashSet::new();
        if let Some(dup) = calls.iter().find(|c| !ids.insert(c.id.as_str())) {
            return Err(AssistantError::ProtocolViolation(format!(
                "duplicate tool call id '{}' in one batch",
                dup.id
            )));
        }

        self.set_state(TurnState::ExecutingTools);
        info!(count = calls.len(), "Executing tool calls");
        let results = self.coordinator.execute(&calls).await;

        if let Some(missing) = calls.iter().find(|c| !results.iter().any(|r| r.id == c.id)) {
            return Err(AssistantError::ProtocolViolation(format!(
                "no result for tool call '{}'",
                missing.id
            )));
        }

        let tool_messages = ToolCallCoordinator::format_for_backend(&calls, &results);
        messages.push(Message::assistant_tool_calls(response.content, calls.clone()));
        messages.extend(tool_messages);

        self.set_state(TurnState::RequestingFinal);
        let second = self.backend.chat(self.request(messages, false)).await?;
        if second.has_tool_calls() {
            return Err(AssistantError::ProtocolViolation(
                "model requested further tool calls after receiving tool results".to_string(),
            ));
        }

        self.bus.publish(
            event_types::FUNCTIONS_CALLED,
            json!({
                "tool_calls": calls,
                "results": results,
            }),
        );

        Ok(Answer {
            text: second.content.unwrap_or_default(),
            usage: second.usage,
            tool_calls_executed: calls.len(),
        })
    }

    async fn streaming_turn(&self, adapter: &dyn StreamingModelAdapter, messages: Vec<Message>) -> Result<Answer> {
        let stale = self.chunks.discard_pending();
        if stale > 0 {
            debug!(stale, "Discarded chunks left over from an earlier turn");
        }

        self.set_state(TurnState::Requesting);
        let mut stream = adapter.stream(self.request(messages.clone(), true)).await?;

        let mut buffer = String::new();
        let mut saw_tool_call = false;
        while let Some(item) = stream.next().await {
            let delta = item?;
            if delta.tool_call_delta {
                saw_tool_call = true;
                break;
            }
            if let Some(text) = delta.content.filter(|t| !t.is_empty()) {
                buffer.push_str(&text);
                self.chunks.push_text(text);
            }
        }
        drop(stream);

        if !saw_tool_call {
            self.set_state(TurnState::DirectAnswer);
            return Ok(Answer {
                text: buffer,
                usage: None,
                tool_calls_executed: 0,
            });
        }

        let discarded = self.chunks.discard_pending();
        info!(discarded, "Tool call in stream, falling back to a complete request");
        self.set_state(TurnState::ToolCallsDetected);

        let fallback = adapter.chat(self.request(messages.clone(), false)).await?;
        let answer = self.settle(messages, fallback).await?;
        self.chunks.push_text(answer.text.clone());
        Ok(answer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::events::Event;
    use crate::domain::models::StreamDelta;
    use crate::domain::testing::ScriptedBackend;

    fn capture(bus: &Arc<EventBus>, event_type: &str) -> Arc<Mutex<Vec<Event>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.subscribe(event_type, move |event| {
            sink.lock().push(event.clone());
            Ok(())
        });
        seen
    }

    fn orchestrator(backend: Backend, registry: ToolRegistry) -> (Orchestrator, Arc<EventBus>) {
        let bus = Arc::new(EventBus::synchronous());
        let orch = Orchestrator::new(backend, registry, Arc::clone(&bus), OrchestratorSettings::default());
        (orch, bus)
    }

    fn drain(orch: &Orchestrator) -> Vec<ResponseChunk> {
        let mut out = Vec::new();
        while let Some(chunk) = orch.next_chunk(Duration::from_millis(10)) {
            out.push(chunk);
        }
        out
    }

    #[tokio::test]
    async fn test_direct_answer_publishes_once() {
        let backend = ScriptedBackend::new().reply(ChatResponse::text("Hello there"));
        let (orch, bus) = orchestrator(backend.complete(), ToolRegistry::new());
        let answers = capture(&bus, event_types::AI_RESPONSE_RECEIVED);

        let outcome = orch.process(ConversationTurn::new("hi")).await;

        assert_eq!(outcome.answer, "Hello there");
        assert!(outcome.error.is_none());
        assert!(!orch.is_processing());
        assert_eq!(orch.state(), TurnState::Idle);

        let answers = answers.lock();
        assert_eq!(answers.len(), 1);
        assert_eq!(answers[0].payload["response"], "Hello there");
        assert_eq!(answers[0].payload["streaming"], false);

        // Empty registry: no tool schemas attached.
        assert!(backend.requests()[0].tools.is_none());
    }

    #[tokio::test]
    async fn test_blank_input_is_ignored() {
        let backend = ScriptedBackend::new();
        let (orch, bus) = orchestrator(backend.streaming(), ToolRegistry::new());
        let answers = capture(&bus, event_types::AI_RESPONSE_RECEIVED);

        let outcome = orch.process(ConversationTurn::new("   ")).await;

        assert_eq!(outcome.answer, "");
        assert!(answers.lock().is_empty());
        assert!(backend.requests().is_empty());
        assert!(drain(&orch).is_empty());
    }

    #[tokio::test]
    async fn test_backend_failure_publishes_error_and_apology() {
        let backend = ScriptedBackend::new().fail(AssistantError::BackendRequest("503".to_string()));
        let (orch, bus) = orchestrator(backend.complete(), ToolRegistry::new());
        let errors = capture(&bus, event_types::ERROR);
        let answers = capture(&bus, event_types::AI_RESPONSE_RECEIVED);

        let outcome = orch.process(ConversationTurn::new("hi")).await;

        assert_eq!(outcome.answer, DEFAULT_APOLOGY);
        assert!(outcome.error.as_deref().unwrap().contains("503"));
        assert!(!orch.is_processing());

        let errors = errors.lock();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].payload["source"], "orchestrator");
        assert_eq!(errors[0].payload["critical"], false);

        let answers = answers.lock();
        assert_eq!(answers.len(), 1);
        assert_eq!(answers[0].payload["response"], DEFAULT_APOLOGY);
        assert!(answers[0].get("error").is_some());
    }

    #[tokio::test]
    async fn test_nested_tool_calls_are_a_protocol_violation() {
        let mut registry = ToolRegistry::new();
        registry
            .register_fn("noop", "Does nothing", json!({"type": "object"}), |_| Ok(json!("done")))
            .unwrap();
        let call = ToolCall {
            id: "c1".to_string(),
            name: "noop".to_string(),
            arguments: "{}".to_string(),
        };
        let backend = ScriptedBackend::new()
            .reply(ChatResponse::with_tool_calls(vec![call.clone()]))
            .reply(ChatResponse::with_tool_calls(vec![call]));
        let (orch, bus) = orchestrator(backend.complete(), registry);
        let errors = capture(&bus, event_types::ERROR);
        let called = capture(&bus, event_types::FUNCTIONS_CALLED);

        let outcome = orch.process(ConversationTurn::new("loop forever")).await;

        assert!(outcome.error.as_deref().unwrap().contains("Protocol violation"));
        assert_eq!(errors.lock()[0].payload["kind"], "protocol_violation");
        assert!(called.lock().is_empty());
        assert_eq!(backend.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_ids_are_rejected_before_execution() {
        let mut registry = ToolRegistry::new();
        registry
            .register_fn("noop", "Does nothing", json!({"type": "object"}), |_| Ok(json!("done")))
            .unwrap();
        let call = ToolCall {
            id: "same".to_string(),
            name: "noop".to_string(),
            arguments: "{}".to_string(),
        };
        let backend = ScriptedBackend::new().reply(ChatResponse::with_tool_calls(vec![call.clone(), call]));
        let (orch, bus) = orchestrator(backend.complete(), registry);
        let executed = capture(&bus, event_types::TOOL_EXECUTED);

        let outcome = orch.process(ConversationTurn::new("twice")).await;

        assert!(outcome.error.is_some());
        assert!(executed.lock().is_empty());
        assert_eq!(backend.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_streamed_text_is_the_answer() {
        let backend = ScriptedBackend::new().stream(vec![
            StreamDelta::text("Hel"),
            StreamDelta::text(""),
            StreamDelta::text("lo!"),
        ]);
        let (orch, bus) = orchestrator(backend.streaming(), ToolRegistry::new());
        let answers = capture(&bus, event_types::AI_RESPONSE_RECEIVED);

        let outcome = orch.process(ConversationTurn::new("greet me")).await;

        assert_eq!(outcome.answer, "Hello!");
        assert!(outcome.streamed);
        assert_eq!(
            drain(&orch),
            vec![
                ResponseChunk::Text("Hel".into()),
                ResponseChunk::Text("lo!".into()),
                ResponseChunk::EndOfStream,
            ]
        );
        assert_eq!(answers.lock()[0].payload["streaming"], true);
        assert!(backend.requests()[0].stream);
    }

    #[tokio::test]
    async fn test_stream_error_still_ends_stream_once() {
        let backend = ScriptedBackend::new()
            .stream_then_fail(vec![StreamDelta::text("par")], AssistantError::BackendRequest("reset".to_string()));
        let (orch, _bus) = orchestrator(backend.streaming(), ToolRegistry::new());

        let outcome = orch.process(ConversationTurn::new("hi")).await;

        assert!(outcome.error.is_some());
        let chunks = drain(&orch);
        assert_eq!(chunks.iter().filter(|c| **c == ResponseChunk::EndOfStream).count(), 1);
        assert_eq!(chunks.last(), Some(&ResponseChunk::EndOfStream));
    }

    #[tokio::test]
    async fn test_stale_chunks_are_discarded_between_turns() {
        let backend = ScriptedBackend::new()
            .stream(vec![StreamDelta::text("first")])
            .stream(vec![StreamDelta::text("second")]);
        let (orch, _bus) = orchestrator(backend.streaming(), ToolRegistry::new());

        orch.process(ConversationTurn::new("one")).await;
        orch.process(ConversationTurn::new("two")).await;

        assert_eq!(
            drain(&orch),
            vec![ResponseChunk::Text("second".into()), ResponseChunk::EndOfStream]
        );
    }

    fn processing_slots() -> (Arc<Mutex<Option<Orchestrator>>>, Arc<Mutex<Vec<bool>>>) {
        (Arc::new(Mutex::new(None)), Arc::new(Mutex::new(Vec::new())))
    }

    /// Backend hook that records `is_processing()` each time a request arrives.
    fn record_processing(
        slot: &Arc<Mutex<Option<Orchestrator>>>,
        seen: &Arc<Mutex<Vec<bool>>>,
    ) -> impl Fn(&ChatRequest) + Send + Sync + 'static {
        let slot = Arc::clone(slot);
        let seen = Arc::clone(seen);
        move |_| {
            if let Some(orch) = slot.lock().as_ref() {
                seen.lock().push(orch.is_processing());
            }
        }
    }

    #[tokio::test]
    async fn test_processing_flag_is_set_during_complete_turn() {
        let (slot, seen) = processing_slots();
        let mut registry = ToolRegistry::new();
        let tool_slot = Arc::clone(&slot);
        let tool_seen = Arc::clone(&seen);
        registry
            .register_fn("noop", "Does nothing", json!({"type": "object"}), move |_| {
                if let Some(orch) = tool_slot.lock().as_ref() {
                    tool_seen.lock().push(orch.is_processing());
                }
                Ok(json!("done"))
            })
            .unwrap();
        let backend = ScriptedBackend::new()
            .reply(ChatResponse::with_tool_calls(vec![ToolCall {
                id: "c1".to_string(),
                name: "noop".to_string(),
                arguments: "{}".to_string(),
            }]))
            .reply(ChatResponse::text("ok"))
            .on_request(record_processing(&slot, &seen));
        let (orch, _bus) = orchestrator(backend.complete(), registry);
        *slot.lock() = Some(orch.clone());

        assert!(!orch.is_processing());
        let outcome = orch.process(ConversationTurn::new("go")).await;
        slot.lock().take();

        assert_eq!(outcome.answer, "ok");
        // First request, tool handler, second request.
        assert_eq!(*seen.lock(), vec![true, true, true]);
        assert!(!orch.is_processing());
        assert_eq!(orch.state(), TurnState::Idle);
    }

    #[tokio::test]
    async fn test_processing_flag_is_set_during_streaming_turn() {
        let (slot, seen) = processing_slots();
        let backend = ScriptedBackend::new()
            .stream(vec![StreamDelta::text("Hm"), StreamDelta::tool_call()])
            .reply(ChatResponse::text("fallback"))
            .on_request(record_processing(&slot, &seen));
        let (orch, _bus) = orchestrator(backend.streaming(), ToolRegistry::new());
        *slot.lock() = Some(orch.clone());

        let outcome = orch.process(ConversationTurn::new("go")).await;
        slot.lock().take();

        assert_eq!(outcome.answer, "fallback");
        // Streamed request, then the complete fallback.
        assert_eq!(*seen.lock(), vec![true, true]);
        assert!(!orch.is_processing());
    }

    #[tokio::test]
    async fn test_panicking_stream_adapter_still_ends_stream() {
        let backend = ScriptedBackend::new()
            .stream(vec![StreamDelta::text("never")])
            .on_request(|_| panic!("adapter blew up"));
        let (orch, _bus) = orchestrator(backend.streaming(), ToolRegistry::new());

        let joined = orch.spawn(ConversationTurn::new("hi")).await;

        assert!(joined.unwrap_err().is_panic());
        assert_eq!(drain(&orch), vec![ResponseChunk::EndOfStream]);
        assert!(!orch.is_processing());
        assert_eq!(orch.state(), TurnState::Idle);
    }

    #[tokio::test]
    async fn test_spawned_turn_runs_to_completion() {
        let backend = ScriptedBackend::new().reply(ChatResponse::text("done"));
        let (orch, _bus) = orchestrator(backend.complete(), ToolRegistry::new());

        let outcome = orch.spawn(ConversationTurn::new("go")).await.unwrap();

        assert_eq!(outcome.answer, "done");
        assert!(!orch.is_processing());
    }
}
