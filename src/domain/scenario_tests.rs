//! End-to-end turns against a scripted backend.

use crate::config::EventBusConfig;
use crate::domain::events::{event_types, Event, EventBus};
use crate::domain::models::{ChatResponse, ConversationTurn, Message, Role, StreamDelta, ToolCall};
use crate::domain::orchestrator::{Orchestrator, OrchestratorSettings};
use crate::domain::registry::ToolRegistry;
use crate::domain::stream::ResponseChunk;
use crate::domain::testing::ScriptedBackend;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn weather_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry
        .register_fn(
            "get_weather",
            "Current weather for a city",
            json!({
                "type": "object",
                "properties": { "location": { "type": "string" } },
                "required": ["location"]
            }),
            |args| match args.get("location").and_then(|v| v.as_str()) {
                Some("Quito") => Ok(json!({"temp": 18})),
                Some(other) => Err(format!("no data for {}", other)),
                None => Err("missing location".to_string()),
            },
        )
        .unwrap();
    registry
}

fn weather_call(id: &str) -> ToolCall {
    ToolCall {
        id: id.to_string(),
        name: "get_weather".to_string(),
        arguments: r#"{"location":"Quito"}"#.to_string(),
    }
}

#[derive(Clone, Default)]
struct Recorder {
    events: Arc<Mutex<Vec<Event>>>,
}

impl Recorder {
    fn attach(bus: &EventBus) -> Self {
        let recorder = Self::default();
        for event_type in [
            event_types::AI_RESPONSE_RECEIVED,
            event_types::FUNCTIONS_CALLED,
            event_types::TOOL_EXECUTED,
            event_types::ERROR,
        ] {
            let sink = Arc::clone(&recorder.events);
            bus.subscribe(event_type, move |event| {
                sink.lock().push(event.clone());
                Ok(())
            });
        }
        recorder
    }

    fn of(&self, event_type: &str) -> Vec<Event> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }
}

fn drain(orch: &Orchestrator) -> Vec<ResponseChunk> {
    let mut chunks = Vec::new();
    while let Some(chunk) = orch.next_chunk(Duration::from_millis(10)) {
        chunks.push(chunk);
    }
    chunks
}

#[tokio::test]
async fn weather_question_runs_tool_and_answers() {
    let backend = ScriptedBackend::new()
        .reply(ChatResponse::with_tool_calls(vec![weather_call("call_1")]))
        .reply(ChatResponse::text("2 + 2 is 4, and it is 18°C in Quito."));
    let bus = Arc::new(EventBus::synchronous());
    let recorder = Recorder::attach(&bus);
    let orch = Orchestrator::new(
        backend.complete(),
        weather_registry(),
        Arc::clone(&bus),
        OrchestratorSettings::default(),
    );

    let outcome = orch
        .process(ConversationTurn::new("What is 2+2 and what's the weather in Quito?"))
        .await;

    assert!(outcome.error.is_none());
    assert_eq!(outcome.tool_calls_executed, 1);

    let executed = recorder.of(event_types::TOOL_EXECUTED);
    assert_eq!(executed.len(), 1);
    assert_eq!(
        executed[0].payload,
        json!({
            "name": "get_weather",
            "arguments": {"location": "Quito"},
            "outcome": {"ok": {"temp": 18}}
        })
    );

    let called = recorder.of(event_types::FUNCTIONS_CALLED);
    assert_eq!(called.len(), 1);
    let calls = called[0].payload["tool_calls"].as_array().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0]["name"], "get_weather");

    let answers = recorder.of(event_types::AI_RESPONSE_RECEIVED);
    assert_eq!(answers.len(), 1);
    assert!(!answers[0].payload["response"].as_str().unwrap().is_empty());

    // Second request: assistant tool-call message followed by the tool result,
    // with the schemas attached again.
    let requests = backend.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].tools.as_ref().unwrap().len(), 1);
    assert_eq!(requests[1].tools.as_ref().unwrap().len(), 1);
    let tail = &requests[1].messages[requests[1].messages.len() - 2..];
    assert_eq!(tail[0].role, Role::Assistant);
    assert_eq!(tail[0].tool_calls.as_ref().unwrap()[0].id, "call_1");
    assert_eq!(tail[1], Message::tool_result("call_1", r#"{"temp":18}"#));
}

#[tokio::test]
async fn events_reach_async_subscribers_before_shutdown_returns() {
    let backend = ScriptedBackend::new()
        .reply(ChatResponse::with_tool_calls(vec![weather_call("call_1")]))
        .reply(ChatResponse::text("18°C in Quito."));
    let bus = Arc::new(EventBus::new(&EventBusConfig::default()));
    let recorder = Recorder::attach(&bus);
    let orch = Orchestrator::new(
        backend.complete(),
        weather_registry(),
        Arc::clone(&bus),
        OrchestratorSettings::default(),
    );

    orch.process(ConversationTurn::new("Weather in Quito?")).await;
    bus.shutdown();

    let order: Vec<String> = recorder.events.lock().iter().map(|e| e.event_type.clone()).collect();
    assert_eq!(
        order,
        vec![
            event_types::TOOL_EXECUTED,
            event_types::FUNCTIONS_CALLED,
            event_types::AI_RESPONSE_RECEIVED,
        ]
    );
}

#[tokio::test]
async fn unknown_tool_error_is_sent_back_to_the_model() {
    let backend = ScriptedBackend::new()
        .reply(ChatResponse::with_tool_calls(vec![ToolCall {
            id: "call_x".to_string(),
            name: "launch_rockets".to_string(),
            arguments: "{}".to_string(),
        }]))
        .reply(ChatResponse::text("I can't do that."));
    let bus = Arc::new(EventBus::synchronous());
    let recorder = Recorder::attach(&bus);
    let orch = Orchestrator::new(
        backend.complete(),
        weather_registry(),
        Arc::clone(&bus),
        OrchestratorSettings::default(),
    );

    let outcome = orch.process(ConversationTurn::new("Launch the rockets")).await;

    assert!(outcome.error.is_none());
    assert_eq!(outcome.answer, "I can't do that.");
    assert!(recorder.of(event_types::TOOL_EXECUTED).is_empty());

    let called = recorder.of(event_types::FUNCTIONS_CALLED);
    assert_eq!(called[0].payload["results"][0]["outcome"], json!({"error": "unknown tool"}));

    let second = &backend.requests()[1];
    assert_eq!(
        second.messages.last(),
        Some(&Message::tool_result("call_x", "Error: unknown tool"))
    );
}

#[tokio::test]
async fn tool_call_mid_stream_falls_back_once() {
    let backend = ScriptedBackend::new()
        .stream(vec![
            StreamDelta::text("Let"),
            StreamDelta::text(" me"),
            StreamDelta::text(" check"),
            StreamDelta::tool_call(),
            StreamDelta::text(" never read"),
        ])
        .reply(ChatResponse::with_tool_calls(vec![weather_call("call_1")]))
        .reply(ChatResponse::text("It is 18°C in Quito."));
    let bus = Arc::new(EventBus::synchronous());
    let recorder = Recorder::attach(&bus);
    let orch = Orchestrator::new(
        backend.streaming(),
        weather_registry(),
        Arc::clone(&bus),
        OrchestratorSettings::default(),
    );

    let outcome = orch.process(ConversationTurn::new("Weather in Quito?")).await;

    assert_eq!(outcome.answer, "It is 18°C in Quito.");
    assert!(outcome.streamed);

    // One streamed request, one fallback with the same messages, one follow-up.
    let streamed = backend.stream_requests();
    let complete = backend.chat_requests();
    assert_eq!(streamed.len(), 1);
    assert_eq!(complete.len(), 2);
    assert_eq!(complete[0].messages, streamed[0].messages);
    assert!(complete[0].tools.is_some());

    let chunks = drain(&orch);
    assert_eq!(
        chunks,
        vec![
            ResponseChunk::Text("It is 18°C in Quito.".into()),
            ResponseChunk::EndOfStream,
        ]
    );

    assert_eq!(recorder.of(event_types::TOOL_EXECUTED).len(), 1);
    let answers = recorder.of(event_types::AI_RESPONSE_RECEIVED);
    assert_eq!(answers.len(), 1);
    assert_eq!(answers[0].payload["response"], "It is 18°C in Quito.");
}

#[tokio::test]
async fn fallback_without_tool_calls_uses_its_text() {
    let backend = ScriptedBackend::new()
        .stream(vec![StreamDelta::text("Hm"), StreamDelta::tool_call()])
        .reply(ChatResponse::text("Nothing to look up."));
    let orch = Orchestrator::new(
        backend.streaming(),
        weather_registry(),
        Arc::new(EventBus::synchronous()),
        OrchestratorSettings::default(),
    );

    let outcome = orch.process(ConversationTurn::new("hello")).await;

    assert_eq!(outcome.answer, "Nothing to look up.");
    assert_eq!(backend.chat_requests().len(), 1);
    let chunks = drain(&orch);
    assert_eq!(chunks.iter().filter(|c| **c == ResponseChunk::EndOfStream).count(), 1);
}

#[tokio::test]
async fn long_history_is_cut_to_the_window() {
    let mut history: Vec<Message> = (0..29)
        .map(|i| {
            if i % 2 == 0 {
                Message::user(format!("q{}", i))
            } else {
                Message::assistant(format!("a{}", i))
            }
        })
        .collect();
    history.push(Message::user("and now?"));

    let backend = ScriptedBackend::new().reply(ChatResponse::text("ok"));
    let settings = OrchestratorSettings {
        context_window_size: 10,
        ..OrchestratorSettings::default()
    };
    let orch = Orchestrator::new(
        backend.complete(),
        ToolRegistry::new(),
        Arc::new(EventBus::synchronous()),
        settings,
    );

    orch.process(ConversationTurn::new("and now?").with_history(history.clone()))
        .await;

    let sent = &backend.requests()[0].messages;
    assert_eq!(sent.len(), 21);
    assert_eq!(sent[0].role, Role::System);
    assert_eq!(&sent[1..], &history[10..]);
}
