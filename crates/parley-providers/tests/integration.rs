//! Provider integration tests against a real endpoint.
//!
//! Skipped when `OPENAI_API_KEY` is not set.
//! Run with: `cargo test -p parley-providers --test integration`

use parley_core::types::ToolDefinition;
use parley_providers::{CompletionProvider, CompletionRequest, OpenAiProvider, ProviderMessage, ToolCallAssembler};
use serde_json::json;
use tokio_stream::StreamExt;

fn openai_key() -> Option<String> {
    std::env::var("OPENAI_API_KEY").ok().filter(|k| !k.is_empty())
}

fn request(tools: Vec<ToolDefinition>, prompt: &str) -> CompletionRequest {
    CompletionRequest {
        model: "gpt-4o-mini".into(),
        messages: vec![
            ProviderMessage::system("You are a helpful assistant. Follow instructions exactly."),
            ProviderMessage::user(prompt),
        ],
        tools,
        temperature: Some(0.0),
        max_tokens: Some(100),
        reasoning_effort: None,
    }
}

#[tokio::test]
async fn test_openai_streaming_text() {
    let Some(api_key) = openai_key() else {
        eprintln!("Skipping: OPENAI_API_KEY not set");
        return;
    };
    let provider = OpenAiProvider::new(None, Some(api_key));

    let mut stream = provider
        .stream(&request(Vec::new(), "Reply with exactly the word 'hello'."))
        .await
        .expect("stream");
    let mut assembler = ToolCallAssembler::new();
    while let Some(chunk) = stream.next().await {
        assembler.push(&chunk.expect("chunk"));
    }
    let response = assembler.finish().expect("assembled");

    assert!(response.content.to_lowercase().contains("hello"), "got: {}", response.content);
    assert!(response.usage.total_tokens > 0, "usage should be reported");
}

#[tokio::test]
async fn test_openai_streaming_tool_call() {
    let Some(api_key) = openai_key() else {
        eprintln!("Skipping: OPENAI_API_KEY not set");
        return;
    };
    let provider = OpenAiProvider::new(None, Some(api_key));
    let tools = vec![ToolDefinition {
        name: "save_user_fact".into(),
        description: "Remember a short fact about the user".into(),
        parameters: json!({
            "type": "object",
            "properties": { "content": { "type": "string" } },
            "required": ["content"],
        }),
    }];

    let mut stream = provider
        .stream(&request(tools, "Remember that I prefer tea. Use the tool."))
        .await
        .expect("stream");
    let mut assembler = ToolCallAssembler::new();
    while let Some(chunk) = stream.next().await {
        assembler.push(&chunk.expect("chunk"));
    }
    let response = assembler.finish().expect("assembled");

    assert_eq!(response.tool_calls.len(), 1);
    assert_eq!(response.tool_calls[0].name, "save_user_fact");
    assert!(response.tool_calls[0].arguments["content"].is_string());
}
