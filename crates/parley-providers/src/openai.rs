//! OpenAI Chat Completions API provider.
//!
//! Speaks `/v1/chat/completions` in both streaming and non-streaming mode,
//! so it also serves OpenRouter, Ollama, and other compatible endpoints.
//! Stream chunks are mapped one to one; reassembly happens in the caller.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio_stream::StreamExt;
use tracing::{debug, trace};

use parley_core::config::Config;
use parley_core::types::{MessageRole, ToolDefinition};

use crate::assembler::parse_arguments;
use crate::sse::parse_sse_stream;
use crate::{
    ChunkStream, Completion, CompletionProvider, CompletionRequest, ProviderMessage, StreamChunk,
    TokenUsage, ToolCallDelta, ToolCallRequest,
};

const OPENAI_BASE_URL: &str = "https://api.openai.com";

pub struct OpenAiProvider {
    pub base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl OpenAiProvider {
    pub fn new(base_url: Option<&str>, api_key: Option<String>) -> Self {
        Self {
            base_url: base_url
                .unwrap_or(OPENAI_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            api_key,
            client: reqwest::Client::new(),
        }
    }

    /// Build from the `llm` config section; the key may come from an env var.
    pub fn from_config(config: &Config) -> Self {
        let llm = config.llm.clone().unwrap_or_default();
        Self::new(llm.base_url.as_deref(), llm.resolve_api_key())
    }

    fn request(&self, body: &ChatRequest<'_>) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .header("content-type", "application/json");
        if let Some(key) = &self.api_key {
            builder = builder.header("authorization", format!("Bearer {key}"));
        }
        builder.json(body)
    }

    async fn send(&self, body: &ChatRequest<'_>) -> anyhow::Result<reqwest::Response> {
        debug!(model = %body.model, base_url = %self.base_url, stream = body.stream, "Calling chat completions");
        let response = self.request(body).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("OpenAI API error {status}: {text}");
        }
        Ok(response)
    }
}

// --- wire types ---

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<Value>,
    stream: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reasoning_effort: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct WireToolCallDelta {
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionDelta>,
}

#[derive(Debug, Default, Deserialize)]
struct FunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    id: String,
    function: WireFunction,
}

#[derive(Debug, Deserialize)]
struct WireFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

// --- request formatting ---

fn format_tools(tools: &[ToolDefinition]) -> Vec<Value> {
    tools
        .iter()
        .map(|t| {
            json!({
                "type": "function",
                "function": {
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters,
                }
            })
        })
        .collect()
}

fn format_messages(messages: &[ProviderMessage]) -> Vec<Value> {
    messages
        .iter()
        .map(|msg| match msg.role {
            MessageRole::Tool => json!({
                "role": "tool",
                "tool_call_id": msg.tool_call_id,
                "content": msg.content,
            }),
            MessageRole::Assistant if !msg.tool_calls.is_empty() => {
                let calls: Vec<Value> = msg
                    .tool_calls
                    .iter()
                    .map(|tc| {
                        json!({
                            "id": tc.id,
                            "type": "function",
                            "function": {
                                "name": tc.name,
                                "arguments": tc.arguments.to_string(),
                            }
                        })
                    })
                    .collect();
                let content = if msg.content.is_empty() {
                    Value::Null
                } else {
                    json!(msg.content)
                };
                json!({ "role": "assistant", "content": content, "tool_calls": calls })
            }
            role => json!({ "role": role.as_str(), "content": msg.content }),
        })
        .collect()
}

fn build_body(request: &CompletionRequest, stream: bool) -> ChatRequest<'_> {
    ChatRequest {
        model: &request.model,
        messages: format_messages(&request.messages),
        stream,
        tools: format_tools(&request.tools),
        temperature: request.temperature,
        max_tokens: request.max_tokens,
        reasoning_effort: request.reasoning_effort.as_deref(),
        stream_options: stream.then_some(StreamOptions { include_usage: true }),
    }
}

fn map_chunk(chunk: ChatCompletionChunk) -> StreamChunk {
    let mut out = StreamChunk {
        usage: chunk
            .usage
            .map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens)),
        ..StreamChunk::default()
    };
    if let Some(choice) = chunk.choices.into_iter().next() {
        out.content_delta = choice.delta.content.filter(|c| !c.is_empty());
        out.finish_reason = choice.finish_reason;
        out.tool_calls = choice
            .delta
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|tc| {
                let function = tc.function.unwrap_or_default();
                ToolCallDelta {
                    index: tc.index,
                    id: tc.id,
                    name: function.name,
                    arguments: function.arguments,
                }
            })
            .collect();
    }
    out
}

#[async_trait]
impl CompletionProvider for OpenAiProvider {
    fn id(&self) -> &str {
        "openai"
    }

    async fn complete(&self, request: &CompletionRequest) -> anyhow::Result<Completion> {
        let body = build_body(request, false);
        let response: ChatCompletion = self.send(&body).await?.json().await?;

        let usage = response
            .usage
            .map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens))
            .unwrap_or_default();
        let Some(choice) = response.choices.into_iter().next() else {
            anyhow::bail!("OpenAI API returned no choices");
        };

        let tool_calls = choice
            .message
            .tool_calls
            .into_iter()
            .map(|tc| {
                Ok(ToolCallRequest {
                    arguments: parse_arguments(&tc.function.arguments)?,
                    id: tc.id,
                    name: tc.function.name,
                })
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        Ok(Completion {
            content: choice.message.content.unwrap_or_default(),
            tool_calls,
            usage,
        })
    }

    async fn stream(&self, request: &CompletionRequest) -> anyhow::Result<ChunkStream> {
        let body = build_body(request, true);
        let response = self.send(&body).await?;

        let chunks = parse_sse_stream(response)
            .take_while(|event| !matches!(event, Ok(e) if e.data.trim() == "[DONE]"))
            .filter_map(|event| match event {
                Ok(event) => match serde_json::from_str::<ChatCompletionChunk>(event.data.trim()) {
                    Ok(chunk) => Some(Ok(map_chunk(chunk))),
                    Err(e) => {
                        trace!(%e, data = %event.data, "Skipping unparseable chunk");
                        None
                    }
                },
                Err(e) => Some(Err(e)),
            });

        Ok(Box::pin(chunks))
    }
}
