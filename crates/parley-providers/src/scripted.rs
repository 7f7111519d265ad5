//! A deterministic provider that replays queued responses.
//!
//! Used by engine and gateway tests.
//! Every request is recorded so tests can assert on the prompt that was sent.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::Value;

use crate::assembler::ToolCallAssembler;
use crate::{
    ChunkStream, Completion, CompletionProvider, CompletionRequest, StreamChunk, TokenUsage,
    ToolCallDelta,
};

/// One scripted model response.
#[derive(Debug, Clone)]
pub enum ScriptedTurn {
    /// Yield the chunks, then end the stream.
    Chunks(Vec<StreamChunk>),
    /// Yield the chunks, then never yield again.
    Stalled(Vec<StreamChunk>),
    /// Fail the call before any chunk.
    Fail(String),
}

impl ScriptedTurn {
    /// A plain text answer, streamed word by word, with usage attached.
    pub fn text(content: &str) -> Self {
        let mut chunks: Vec<StreamChunk> = content
            .split_inclusive(' ')
            .map(|word| StreamChunk {
                content_delta: Some(word.to_string()),
                ..StreamChunk::default()
            })
            .collect();
        chunks.push(usage_chunk("stop"));
        Self::Chunks(chunks)
    }

    /// One tool call with its arguments split into two fragments.
    pub fn tool_call(id: &str, name: &str, arguments: Value) -> Self {
        Self::tool_calls("", &[(id, name, arguments)])
    }

    /// Optional text followed by several tool calls, each fragmented.
    pub fn tool_calls(content: &str, calls: &[(&str, &str, Value)]) -> Self {
        let mut chunks = Vec::new();
        if !content.is_empty() {
            chunks.push(StreamChunk {
                content_delta: Some(content.to_string()),
                ..StreamChunk::default()
            });
        }
        for (index, (id, name, arguments)) in calls.iter().enumerate() {
            let raw = arguments.to_string();
            let mut mid = raw.len() / 2;
            while !raw.is_char_boundary(mid) {
                mid -= 1;
            }
            let (head, tail) = raw.split_at(mid);
            chunks.push(StreamChunk {
                tool_calls: vec![ToolCallDelta {
                    index,
                    id: Some((*id).to_string()),
                    name: Some((*name).to_string()),
                    arguments: Some(head.to_string()),
                }],
                ..StreamChunk::default()
            });
            chunks.push(StreamChunk {
                tool_calls: vec![ToolCallDelta {
                    index,
                    arguments: Some(tail.to_string()),
                    ..ToolCallDelta::default()
                }],
                ..StreamChunk::default()
            });
        }
        chunks.push(usage_chunk("tool_calls"));
        Self::Chunks(chunks)
    }

    /// Stream some text and then hang, for cancellation tests.
    pub fn stalled(content: &str) -> Self {
        Self::Stalled(vec![StreamChunk {
            content_delta: Some(content.to_string()),
            ..StreamChunk::default()
        }])
    }

    pub fn fail(message: &str) -> Self {
        Self::Fail(message.to_string())
    }
}

/// Usage reported by every finished scripted response.
pub const SCRIPTED_USAGE: TokenUsage = TokenUsage {
    prompt_tokens: 10,
    completion_tokens: 5,
    total_tokens: 15,
};

fn usage_chunk(finish_reason: &str) -> StreamChunk {
    StreamChunk {
        usage: Some(SCRIPTED_USAGE),
        finish_reason: Some(finish_reason.to_string()),
        ..StreamChunk::default()
    }
}

#[derive(Default)]
pub struct ScriptedProvider {
    turns: Mutex<VecDeque<ScriptedTurn>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ScriptedProvider {
    pub fn new(turns: impl IntoIterator<Item = ScriptedTurn>) -> Self {
        Self {
            turns: Mutex::new(turns.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, turn: ScriptedTurn) {
        lock(&self.turns).push_back(turn);
    }

    /// Every request received so far, oldest first.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        lock(&self.requests).clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.requests).len()
    }

    pub fn remaining(&self) -> usize {
        lock(&self.turns).len()
    }

    fn next_turn(&self, request: &CompletionRequest) -> anyhow::Result<ScriptedTurn> {
        lock(&self.requests).push(request.clone());
        lock(&self.turns)
            .pop_front()
            .ok_or_else(|| anyhow::anyhow!("scripted provider has no responses left"))
    }
}

#[async_trait]
impl CompletionProvider for ScriptedProvider {
    fn id(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: &CompletionRequest) -> anyhow::Result<Completion> {
        let chunks = match self.next_turn(request)? {
            ScriptedTurn::Chunks(chunks) | ScriptedTurn::Stalled(chunks) => chunks,
            ScriptedTurn::Fail(message) => anyhow::bail!(message),
        };
        let mut assembler = ToolCallAssembler::new();
        for chunk in &chunks {
            assembler.push(chunk);
        }
        let response = assembler.finish()?;
        Ok(Completion {
            content: response.content,
            tool_calls: response.tool_calls,
            usage: response.usage,
        })
    }

    async fn stream(&self, request: &CompletionRequest) -> anyhow::Result<ChunkStream> {
        use futures::StreamExt;

        match self.next_turn(request)? {
            ScriptedTurn::Chunks(chunks) => {
                Ok(futures::stream::iter(chunks.into_iter().map(Ok)).boxed())
            }
            ScriptedTurn::Stalled(chunks) => Ok(futures::stream::iter(chunks.into_iter().map(Ok))
                .chain(futures::stream::pending())
                .boxed()),
            ScriptedTurn::Fail(message) => anyhow::bail!(message),
        }
    }
}
