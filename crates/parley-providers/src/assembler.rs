//! Reassembly of streamed responses.
//!
//! Tool-call arguments arrive as string fragments keyed by a position
//! index. Fragments are buffered per index and parsed once, after the
//! stream has ended.

use std::collections::BTreeMap;

use anyhow::bail;
use serde_json::Value;
use tracing::warn;

use crate::{StreamChunk, TokenUsage, ToolCallRequest};

#[derive(Debug, Default)]
struct PartialCall {
    id: Option<String>,
    name: String,
    arguments: String,
}

/// Accumulates the chunks of one streamed response.
#[derive(Debug, Default)]
pub struct ToolCallAssembler {
    content: String,
    calls: BTreeMap<usize, PartialCall>,
    usage: TokenUsage,
    finish_reason: Option<String>,
}

/// The complete response once the stream has ended.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssembledResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCallRequest>,
    pub usage: TokenUsage,
    pub finish_reason: Option<String>,
}

impl ToolCallAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &StreamChunk) {
        if let Some(delta) = &chunk.content_delta {
            self.content.push_str(delta);
        }
        for delta in &chunk.tool_calls {
            let call = self.calls.entry(delta.index).or_default();
            if let Some(id) = delta.id.as_deref().filter(|id| !id.is_empty()) {
                call.id = Some(id.to_string());
            }
            if let Some(name) = delta.name.as_deref().filter(|n| !n.is_empty()) {
                call.name = name.to_string();
            }
            if let Some(fragment) = &delta.arguments {
                call.arguments.push_str(fragment);
            }
        }
        if let Some(usage) = &chunk.usage {
            self.usage.add(usage);
        }
        if chunk.finish_reason.is_some() {
            self.finish_reason.clone_from(&chunk.finish_reason);
        }
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn usage(&self) -> TokenUsage {
        self.usage
    }

    /// Finish the response, parsing every tool call's arguments in index order.
    pub fn finish(self) -> anyhow::Result<AssembledResponse> {
        let mut tool_calls = Vec::with_capacity(self.calls.len());
        for (index, call) in self.calls {
            if call.name.is_empty() {
                bail!("tool call at index {index} has no name");
            }
            let arguments = parse_arguments(&call.arguments)
                .map_err(|e| anyhow::anyhow!("tool call '{}': {e}", call.name))?;
            tool_calls.push(ToolCallRequest {
                id: call
                    .id
                    .unwrap_or_else(|| format!("call_{}", uuid::Uuid::new_v4().simple())),
                name: call.name,
                arguments,
            });
        }
        Ok(AssembledResponse {
            content: self.content,
            tool_calls,
            usage: self.usage,
            finish_reason: self.finish_reason,
        })
    }
}

/// Parse tool arguments, recovering the first well-formed JSON object when
/// the model emitted trailing garbage or a repeated object.
pub fn parse_arguments(raw: &str) -> anyhow::Result<Value> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(Value::Object(Default::default()));
    }

    match serde_json::from_str::<Value>(trimmed) {
        Ok(value) => Ok(value),
        Err(err) => {
            let first = serde_json::Deserializer::from_str(trimmed)
                .into_iter::<Value>()
                .next();
            match first {
                Some(Ok(value)) if value.is_object() => {
                    warn!(%err, "Recovered first JSON object from malformed tool arguments");
                    Ok(value)
                }
                _ => bail!("malformed tool arguments: {err}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::ToolCallDelta;

    fn delta(index: usize, id: Option<&str>, name: Option<&str>, args: &str) -> StreamChunk {
        StreamChunk {
            tool_calls: vec![ToolCallDelta {
                index,
                id: id.map(Into::into),
                name: name.map(Into::into),
                arguments: Some(args.into()),
            }],
            ..StreamChunk::default()
        }
    }

    #[test]
    fn test_interleaved_fragments_reassemble() {
        let mut asm = ToolCallAssembler::new();
        asm.push(&StreamChunk { content_delta: Some("Let me ".into()), ..Default::default() });
        asm.push(&delta(1, Some("call_b"), Some("transfer_funds"), "{\"amount\":"));
        asm.push(&delta(0, Some("call_a"), Some("save_user_fact"), "{\"content\""));
        asm.push(&delta(1, None, None, " 100}"));
        asm.push(&delta(0, None, None, ":\"likes tea\"}"));
        asm.push(&StreamChunk { content_delta: Some("check.".into()), ..Default::default() });
        asm.push(&StreamChunk {
            usage: Some(TokenUsage::new(12, 8)),
            finish_reason: Some("tool_calls".into()),
            ..Default::default()
        });

        let response = asm.finish().unwrap();
        assert_eq!(response.content, "Let me check.");
        assert_eq!(response.usage.total_tokens, 20);
        assert_eq!(response.finish_reason.as_deref(), Some("tool_calls"));
        assert_eq!(
            response.tool_calls,
            vec![
                ToolCallRequest {
                    id: "call_a".into(),
                    name: "save_user_fact".into(),
                    arguments: json!({"content": "likes tea"}),
                },
                ToolCallRequest {
                    id: "call_b".into(),
                    name: "transfer_funds".into(),
                    arguments: json!({"amount": 100}),
                },
            ]
        );
    }

    #[test]
    fn test_missing_id_gets_generated() {
        let mut asm = ToolCallAssembler::new();
        asm.push(&delta(0, None, Some("save_user_fact"), ""));
        let response = asm.finish().unwrap();
        assert!(response.tool_calls[0].id.starts_with("call_"));
        assert_eq!(response.tool_calls[0].arguments, json!({}));
    }

    #[test]
    fn test_argument_recovery() {
        assert_eq!(parse_arguments(r#"{"a":1}{"a":1}"#).unwrap(), json!({"a": 1}));
        assert_eq!(parse_arguments("  ").unwrap(), json!({}));
        assert!(parse_arguments("not json").is_err());
        assert!(parse_arguments(r#"{"a":"#).is_err());
    }

    #[test]
    fn test_nameless_call_is_an_error() {
        let mut asm = ToolCallAssembler::new();
        asm.push(&delta(0, Some("call_x"), None, "{}"));
        assert!(asm.finish().is_err());
    }
}
