//! OpenAI-compatible provider implementation.
//!
//! Works with LM Studio, Ollama, vLLM, llama.cpp server and any endpoint
//! exposing `/v1/chat/completions`.
//!
//! Supports:
//! - Chat completions (non-streaming, used for history folding)
//! - Streaming SSE completions with trailing usage (used for user turns)
//! - Function tools and `image_url` content parts (used by the tool round)
//! - Health checks

use async_trait::async_trait;
use futures::StreamExt;
use localapi_config::LlmConfig;
use localapi_core::error::ProviderError;
use localapi_core::message::ChatMessage;
use localapi_core::provider::*;
use localapi_core::tool::{ToolCall, ToolDefinition};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// An OpenAI-compatible LLM provider.
pub struct OpenAiCompatProvider {
    name: String,
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    /// Create a new OpenAI-compatible provider.
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::NotConfigured(format!("HTTP client: {e}")))?;

        Ok(Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            client,
        })
    }

    /// Build the provider from the `[llm]` config section.
    pub fn from_config(config: &LlmConfig, api_key: Option<String>) -> Result<Self, ProviderError> {
        Self::new(
            "lmstudio",
            &config.base_url,
            api_key,
            Duration::from_secs(config.request_timeout_secs),
        )
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Convert our prompt messages to OpenAI API format.
    fn to_api_messages(messages: &[ChatMessage]) -> Vec<ApiRequestMessage> {
        messages.iter().map(ApiRequestMessage::from_chat).collect()
    }

    fn request_body(request: &ProviderRequest, stream: bool) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": request.model,
            "messages": Self::to_api_messages(&request.messages),
            "temperature": request.temperature,
            "stream": stream,
        });

        if stream {
            body["stream_options"] = serde_json::json!({ "include_usage": true });
        }

        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }

        if !request.stop.is_empty() {
            body["stop"] = serde_json::json!(request.stop);
        }

        if !request.tools.is_empty() {
            let tools: Vec<ApiToolDefinition> = request.tools.iter().map(ApiToolDefinition::from_definition).collect();
            body["tools"] = serde_json::json!(tools);
        }

        body
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.header("Authorization", format!("Bearer {key}")),
            None => builder,
        }
    }

    /// Send a chat completion request and reject non-success statuses.
    async fn post_completion(&self, body: &serde_json::Value, sse: bool) -> Result<reqwest::Response, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut builder = self
            .authorized(self.client.post(&url))
            .header("Content-Type", "application/json");
        if sse {
            builder = builder.header("Accept", "text/event-stream");
        }

        let response = builder.json(body).send().await.map_err(map_transport_error)?;

        let status = response.status().as_u16();
        if status == 404 {
            let error_body = response.text().await.unwrap_or_default();
            return Err(ProviderError::ModelNotFound(error_body));
        }

        if !response.status().is_success() {
            let error_body = response.text().await.unwrap_or_default();
            warn!(provider = %self.name, status, body = %error_body, "Provider returned error");
            return Err(ProviderError::ApiError {
                status_code: status,
                message: error_body,
            });
        }

        Ok(response)
    }
}

fn map_transport_error(e: reqwest::Error) -> ProviderError {
    if e.is_timeout() {
        ProviderError::Timeout(e.to_string())
    } else {
        ProviderError::Network(e.to_string())
    }
}

#[async_trait]
impl localapi_core::Provider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: ProviderRequest) -> std::result::Result<ProviderResponse, ProviderError> {
        let body = Self::request_body(&request, false);

        debug!(provider = %self.name, model = %request.model, "Sending completion request");

        let response = self.post_completion(&body, false).await?;

        let api_response: ApiResponse = response.json().await.map_err(|e| ProviderError::ApiError {
            status_code: 200,
            message: format!("Failed to parse response: {e}"),
        })?;

        let choice = api_response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::ApiError {
                status_code: 200,
                message: "No choices in response".into(),
            })?;

        let usage = api_response.usage.map(ApiUsage::into_usage);
        let tool_calls = choice
            .message
            .tool_calls
            .into_iter()
            .map(ApiToolCall::into_tool_call)
            .collect();

        Ok(ProviderResponse {
            content: choice.message.content.unwrap_or_default(),
            usage,
            model: api_response.model.unwrap_or(request.model),
            tool_calls,
        })
    }

    async fn stream(&self, request: ProviderRequest) -> std::result::Result<ChunkReceiver, ProviderError> {
        let body = Self::request_body(&request, true);

        debug!(provider = %self.name, model = %request.model, "Sending streaming request");

        let response = self.post_completion(&body, true).await?;

        let (tx, rx) = tokio::sync::mpsc::channel(64);
        let provider_name = self.name.clone();

        // Spawn task to read the SSE byte stream and parse chunks
        tokio::spawn(async move {
            let mut byte_stream = response.bytes_stream();
            let mut decoder = SseDecoder::default();
            let mut usage: Option<Usage> = None;

            while let Some(chunk_result) = byte_stream.next().await {
                let bytes = match chunk_result {
                    Ok(b) => b,
                    Err(e) => {
                        let _ = tx.send(Err(ProviderError::StreamInterrupted(e.to_string()))).await;
                        return;
                    }
                };

                for item in decoder.push(&bytes) {
                    let data = match item {
                        SseItem::Done => {
                            let _ = tx
                                .send(Ok(StreamChunk {
                                    content: None,
                                    done: true,
                                    usage,
                                }))
                                .await;
                            return;
                        }
                        SseItem::Data(data) => data,
                    };

                    match parse_stream_data(&data) {
                        Ok(parsed) => {
                            if let Some(u) = parsed.usage {
                                usage = Some(u);
                            }
                            if let Some(text) = parsed.content
                                && tx.send(Ok(delta_chunk(text))).await.is_err()
                            {
                                return; // receiver dropped
                            }
                        }
                        Err(e) => {
                            trace!(provider = %provider_name, data = %data, "Malformed SSE chunk");
                            let _ = tx.send(Err(e)).await;
                            return;
                        }
                    }
                }
            }

            // Stream closed without [DONE]; a trailing usage frame still marks a full reply
            let last = match usage {
                Some(usage) => Ok(StreamChunk {
                    content: None,
                    done: true,
                    usage: Some(usage),
                }),
                None => Err(ProviderError::StreamInterrupted(
                    "stream ended before [DONE]".into(),
                )),
            };
            let _ = tx.send(last).await;
        });

        Ok(rx)
    }

    async fn health_check(&self) -> std::result::Result<bool, ProviderError> {
        let url = format!("{}/models", self.base_url);
        let response = self
            .authorized(self.client.get(&url))
            .send()
            .await
            .map_err(map_transport_error)?;

        Ok(response.status().is_success())
    }
}

fn delta_chunk(text: String) -> StreamChunk {
    StreamChunk {
        content: Some(text),
        done: false,
        usage: None,
    }
}

// --- SSE framing ---

/// One meaningful SSE line.
#[derive(Debug, PartialEq)]
enum SseItem {
    Data(String),
    Done,
}

/// Splits a byte stream into `data:` payloads.
///
/// Buffers raw bytes so a multi-byte character split across network chunks
/// is decoded only once its line is complete.
#[derive(Default)]
struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    fn push(&mut self, bytes: &[u8]) -> Vec<SseItem> {
        self.buffer.extend_from_slice(bytes);

        let mut items = Vec::new();
        while let Some(line_end) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=line_end).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);

            // Skip empty lines, SSE comments and non-data fields
            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();
            if data.is_empty() {
                continue;
            }
            if data == "[DONE]" {
                items.push(SseItem::Done);
            } else {
                items.push(SseItem::Data(data.to_string()));
            }
        }
        items
    }
}

/// Content and usage carried by one `data:` payload.
#[derive(Debug, Default, PartialEq)]
struct ParsedChunk {
    content: Option<String>,
    usage: Option<Usage>,
}

fn parse_stream_data(data: &str) -> Result<ParsedChunk, ProviderError> {
    let parsed: StreamResponse =
        serde_json::from_str(data).map_err(|e| ProviderError::MalformedChunk(format!("{e}: {data}")))?;

    if let Some(error) = parsed.error {
        return Err(ProviderError::StreamInterrupted(error.to_string()));
    }

    let content = parsed
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta.or(choice.message))
        .and_then(|delta| delta.content)
        .filter(|text| !text.is_empty());

    Ok(ParsedChunk {
        content,
        usage: parsed.usage.map(ApiUsage::into_usage),
    })
}

// --- OpenAI API types (internal) ---

#[derive(Debug, Serialize)]
struct ApiRequestMessage {
    role: String,
    /// A plain string, or text plus `image_url` parts when images are attached
    content: serde_json::Value,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<ApiToolCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

impl ApiRequestMessage {
    fn from_chat(message: &ChatMessage) -> Self {
        let content = if message.image_urls.is_empty() {
            serde_json::Value::String(message.content.clone())
        } else {
            let mut parts = vec![serde_json::json!({ "type": "text", "text": message.content })];
            parts.extend(message.image_urls.iter().map(|url| {
                serde_json::json!({ "type": "image_url", "image_url": { "url": url } })
            }));
            serde_json::Value::Array(parts)
        };

        Self {
            role: message.role.as_str().to_string(),
            content,
            tool_calls: message.tool_calls.iter().map(ApiToolCall::from_tool_call).collect(),
            tool_call_id: message.tool_call_id.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ApiToolCall>,
}

#[derive(Debug, Serialize)]
struct ApiToolDefinition {
    #[serde(rename = "type")]
    kind: &'static str,
    function: ApiFunctionDefinition,
}

#[derive(Debug, Serialize)]
struct ApiFunctionDefinition {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

impl ApiToolDefinition {
    fn from_definition(def: &ToolDefinition) -> Self {
        Self {
            kind: "function",
            function: ApiFunctionDefinition {
                name: def.name.clone(),
                description: def.description.clone(),
                parameters: def.parameters.clone(),
            },
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolCall {
    #[serde(default)]
    id: String,
    #[serde(rename = "type", default = "function_kind")]
    kind: String,
    function: ApiFunctionCall,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiFunctionCall {
    name: String,
    /// JSON-encoded arguments
    #[serde(default)]
    arguments: String,
}

fn function_kind() -> String {
    "function".into()
}

impl ApiToolCall {
    fn from_tool_call(call: &ToolCall) -> Self {
        Self {
            id: call.id.clone(),
            kind: function_kind(),
            function: ApiFunctionCall {
                name: call.name.clone(),
                arguments: call.arguments.to_string(),
            },
        }
    }

    /// Unparseable arguments become an empty object; the tool rejects them.
    fn into_tool_call(self) -> ToolCall {
        let arguments = serde_json::from_str(&self.function.arguments).unwrap_or_else(|e| {
            warn!(tool = %self.function.name, "Tool arguments are not JSON: {e}");
            serde_json::json!({})
        });
        ToolCall {
            id: self.id,
            name: self.function.name,
            arguments,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<ApiChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiMessage,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: Option<u32>,
}

impl ApiUsage {
    fn into_usage(self) -> Usage {
        Usage {
            prompt_tokens: self.prompt_tokens,
            completion_tokens: self.completion_tokens,
            total_tokens: self
                .total_tokens
                .unwrap_or(self.prompt_tokens + self.completion_tokens),
        }
    }
}

// --- Streaming SSE types ---

/// A single SSE `data: {...}` chunk from a streaming response.
#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<StreamDelta>,
    /// Some servers send whole-message frames instead of deltas
    #[serde(default)]
    message: Option<StreamDelta>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}
