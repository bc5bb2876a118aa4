use crate::domain::models::*;
use crate::domain::ports::{ChunkStream, ModelAdapter, StreamingModelAdapter};
use crate::error::{AssistantError, Result};
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::future;
use futures::stream::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Chat-completions client for OpenAI and wire-compatible endpoints.
pub struct OpenAIAdapter {
    client: Client,
    api_key: String,
    base_url: String,
    timeout: Duration,
}

impl OpenAIAdapter {
    pub fn new(api_key: String, base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder().connect_timeout(Duration::from_secs(10)).build()?;
        Ok(Self {
            client,
            api_key,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    async fn send(&self, body: &OpenAIRequest, with_timeout: bool) -> Result<reqwest::Response> {
        let mut builder = self
            .client
            .post(self.endpoint())
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(body);
        // A streamed body may legitimately outlive the request timeout.
        if with_timeout {
            builder = builder.timeout(self.timeout);
        }

        let response = builder.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let err_text = response.text().await.unwrap_or_default();
            return Err(AssistantError::BackendRequest(format!("HTTP {}: {}", status, err_text)));
        }
        Ok(response)
    }
}

// --- Request Structs ---

#[derive(Serialize)]
struct OpenAIRequest {
    model: String,
    messages: Vec<OpenAIMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<Value>>,
    temperature: f32,
    top_p: f32,
    max_tokens: u32,
    frequency_penalty: f32,
    presence_penalty: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

impl OpenAIRequest {
    fn from_chat(req: ChatRequest) -> Self {
        Self {
            model: req.model_id.0,
            messages: req.messages.iter().map(OpenAIMessage::from).collect(),
            tools: req.tools,
            temperature: req.params.temperature,
            top_p: req.params.top_p,
            max_tokens: req.params.max_tokens,
            frequency_penalty: req.params.frequency_penalty,
            presence_penalty: req.params.presence_penalty,
            stream: req.stream.then_some(true),
        }
    }
}

#[derive(Serialize)]
struct OpenAIMessage {
    role: &'static str,
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<OpenAIToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

impl From<&Message> for OpenAIMessage {
    fn from(m: &Message) -> Self {
        let tool_calls = m.tool_calls.as_ref().map(|tcs| {
            tcs.iter()
                .map(|tc| OpenAIToolCall {
                    id: tc.id.clone(),
                    type_: "function".to_string(),
                    function: OpenAIFunctionCall {
                        name: tc.name.clone(),
                        arguments: tc.arguments.clone(),
                    },
                })
                .collect()
        });

        Self {
            role: m.role.as_str(),
            content: m.content.clone(),
            tool_calls,
            tool_call_id: m.tool_call_id.clone(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone)]
struct OpenAIToolCall {
    id: String,
    #[serde(rename = "type")]
    type_: String, // "function"
    function: OpenAIFunctionCall,
}

#[derive(Serialize, Deserialize, Clone)]
struct OpenAIFunctionCall {
    name: String,
    #[serde(default)]
    arguments: String,
}

// --- Response Structs ---

#[derive(Deserialize)]
struct OpenAIResponse {
    choices: Vec<OpenAIChoice>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct OpenAIChoice {
    message: OpenAIResponseMessage,
}

#[derive(Deserialize)]
struct OpenAIResponseMessage {
    content: Option<String>,
    tool_calls: Option<Vec<OpenAIToolCall>>,
}

impl OpenAIResponse {
    fn into_chat_response(self) -> Result<ChatResponse> {
        let choice = self
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| AssistantError::BackendRequest("no choice in response".to_string()))?;

        let tool_calls = choice.message.tool_calls.map(|tcs| {
            tcs.into_iter()
                .map(|tc| ToolCall {
                    id: tc.id,
                    name: tc.function.name,
                    arguments: tc.function.arguments,
                })
                .collect()
        });

        Ok(ChatResponse {
            content: choice.message.content,
            tool_calls,
            usage: self.usage,
        })
    }
}

// --- Stream Response Structs ---

#[derive(Deserialize)]
struct OpenAIStreamResponse {
    choices: Vec<OpenAIStreamChoice>,
}

#[derive(Deserialize)]
struct OpenAIStreamChoice {
    delta: OpenAIStreamDelta,
}

#[derive(Deserialize)]
struct OpenAIStreamDelta {
    content: Option<String>,
    // Fragments are only detected, never reassembled.
    tool_calls: Option<Vec<Value>>,
}

/// Decodes one SSE `data:` payload. Unparsable or choice-less chunks yield `None`.
fn decode_stream_chunk(data: &str) -> Option<StreamDelta> {
    let chunk = match serde_json::from_str::<OpenAIStreamResponse>(data) {
        Ok(chunk) => chunk,
        Err(e) => {
            debug!(error = %e, "Skipping unparsable stream chunk");
            return None;
        }
    };
    let choice = chunk.choices.into_iter().next()?;
    if choice.delta.tool_calls.is_some_and(|tcs| !tcs.is_empty()) {
        return Some(StreamDelta::tool_call());
    }
    Some(StreamDelta {
        content: choice.delta.content,
        tool_call_delta: false,
    })
}

#[async_trait]
impl ModelAdapter for OpenAIAdapter {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse> {
        let mut body = OpenAIRequest::from_chat(req);
        body.stream = None;

        let response = self.send(&body, true).await?;
        let parsed: OpenAIResponse = response
            .json()
            .await
            .map_err(|e| AssistantError::BackendRequest(format!("invalid response body: {}", e)))?;
        parsed.into_chat_response()
    }
}

#[async_trait]
impl StreamingModelAdapter for OpenAIAdapter {
    async fn stream(&self, req: ChatRequest) -> Result<ChunkStream> {
        let mut body = OpenAIRequest::from_chat(req);
        body.stream = Some(true);

        let response = self.send(&body, false).await?;
        let stream = response
            .bytes_stream()
            .eventsource()
            .take_while(|event| {
                let done = matches!(event, Ok(e) if e.data.trim() == "[DONE]");
                future::ready(!done)
            })
            .filter_map(|event| {
                future::ready(match event {
                    Ok(event) => decode_stream_chunk(&event.data).map(Ok),
                    Err(e) => {
                        warn!(error = %e, "Stream error");
                        Some(Err(AssistantError::BackendRequest(format!("stream error: {}", e))))
                    }
                })
            });

        Ok(Box::pin(stream))
    }
}
