//! Gateway integration tests: start a real gateway and drive it over WS + HTTP.
//!
//! Run with: `cargo test -p parley-gateway --test integration`

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use uuid::Uuid;

use parley_agent::Engine;
use parley_core::config::{Config, ConfigHandle};
use parley_gateway::GatewayState;
use parley_providers::ScriptedProvider;
use parley_providers::scripted::ScriptedTurn;
use parley_store::{connect_with_settings, migrations::run_pending};

type Socket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Find an available port.
fn find_free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a gateway over an in-memory database and a scripted model.
async fn start_test_gateway(turns: Vec<ScriptedTurn>) -> (Arc<GatewayState>, u16) {
    let port = find_free_port();

    let pool = connect_with_settings("sqlite::memory:", 1, 30).await.unwrap();
    run_pending(&pool).await.unwrap();
    let config = ConfigHandle::new(Config::default());
    let provider = Arc::new(ScriptedProvider::new(turns));
    let engine = Arc::new(Engine::from_pool(pool, provider, config.clone()));
    let state = Arc::new(GatewayState::new(config, engine));

    let state_clone = state.clone();
    tokio::spawn(async move {
        let _ = parley_gateway::start_gateway(state_clone, port).await;
    });

    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if reqwest::get(format!("http://127.0.0.1:{port}/health")).await.is_ok() {
            break;
        }
    }

    (state, port)
}

async fn next_frame(ws: &mut Socket) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("socket closed")
            .expect("socket error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

async fn request(ws: &mut Socket, id: &str, method: &str, params: Value) {
    let frame = json!({ "type": "req", "id": id, "method": method, "params": params });
    ws.send(Message::Text(frame.to_string().into())).await.unwrap();
}

/// Collect `chat.event` payloads until the response to `id` arrives.
async fn until_response(ws: &mut Socket, id: &str) -> (Vec<Value>, Value) {
    let mut events = Vec::new();
    loop {
        let frame = next_frame(ws).await;
        if frame["type"] == "event" && frame["event"] == "chat.event" {
            events.push(frame["payload"].clone());
        } else if frame["type"] == "res" && frame["id"] == id {
            return (events, frame);
        }
    }
}

/// Open a socket, read the hello, and identify as a fresh user.
async fn connect_client(port: u16) -> (Socket, Uuid) {
    let (mut ws, _) = connect_async(format!("ws://127.0.0.1:{port}/ws")).await.unwrap();
    let hello = next_frame(&mut ws).await;
    assert_eq!(hello["event"], "hello");

    let user_id = Uuid::new_v4();
    request(
        &mut ws,
        "c1",
        "connect",
        json!({ "user_id": user_id, "organization_id": Uuid::new_v4() }),
    )
    .await;
    let res = next_frame(&mut ws).await;
    assert_eq!(res["ok"], true, "connect failed: {res}");
    assert_eq!(res["payload"]["user_id"], json!(user_id));
    (ws, user_id)
}

#[tokio::test]
async fn test_health_endpoint() {
    let (_state, port) = start_test_gateway(vec![]).await;

    let resp = reqwest::get(format!("http://127.0.0.1:{port}/health")).await.unwrap();
    assert_eq!(resp.status(), 200);

    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert!(body["version"].is_string());
}

#[tokio::test]
async fn test_hello_advertises_protocol() {
    let (_state, port) = start_test_gateway(vec![]).await;

    let (mut ws, _) = connect_async(format!("ws://127.0.0.1:{port}/ws")).await.unwrap();
    let hello = next_frame(&mut ws).await;
    assert_eq!(hello["type"], "event");
    assert_eq!(hello["seq"], 0);
    assert_eq!(hello["payload"]["protocol"], 1);
    assert_eq!(hello["payload"]["auth_mode"], "none");
    let methods = hello["payload"]["features"]["methods"].as_array().unwrap();
    assert!(methods.iter().any(|m| m == "chat.send"));
}

#[tokio::test]
async fn test_method_before_connect_is_rejected() {
    let (_state, port) = start_test_gateway(vec![]).await;

    let (mut ws, _) = connect_async(format!("ws://127.0.0.1:{port}/ws")).await.unwrap();
    let _hello = next_frame(&mut ws).await;

    request(&mut ws, "r1", "chat.list", json!({})).await;
    let res = next_frame(&mut ws).await;
    assert_eq!(res["id"], "r1");
    assert_eq!(res["ok"], false);
    assert_eq!(res["error"]["code"], "invalid_argument");
}

#[tokio::test]
async fn test_send_streams_events_then_responds() {
    let (state, port) = start_test_gateway(vec![ScriptedTurn::text("Hello from the agent")]).await;
    let (mut ws, _) = connect_client(port).await;
    assert_eq!(state.connection_count().await, 1);

    request(&mut ws, "s1", "chat.send", json!({ "content": "hi" })).await;
    let (events, res) = until_response(&mut ws, "s1").await;

    assert_eq!(res["ok"], true, "send failed: {res}");
    assert_eq!(res["payload"]["status"], "completed");
    let messages = res["payload"]["chat"]["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1]["content"], "Hello from the agent");

    let deltas: String = events
        .iter()
        .filter(|e| e["type"] == "content_delta")
        .filter_map(|e| e["delta"].as_str())
        .collect();
    assert_eq!(deltas, "Hello from the agent");
    assert!(events.iter().any(|e| e["type"] == "usage"));
    assert_eq!(events.last().unwrap()["type"], "final");

    let chat_id = res["payload"]["chat"]["chat"]["id"].clone();
    request(&mut ws, "l1", "chat.list", json!({})).await;
    let (_, list) = until_response(&mut ws, "l1").await;
    assert_eq!(list["payload"]["chats"][0]["id"], chat_id);
}

#[tokio::test]
async fn test_confirmation_flow_over_socket() {
    let (_state, port) = start_test_gateway(vec![
        ScriptedTurn::tool_call("call_t", "transfer_funds", json!({ "recipient": "Alice", "amount": 25 })),
        ScriptedTurn::text("Transfer sent."),
    ])
    .await;
    let (mut ws, _) = connect_client(port).await;

    request(&mut ws, "s1", "chat.send", json!({ "content": "pay Alice 25" })).await;
    let (events, res) = until_response(&mut ws, "s1").await;
    assert_eq!(res["payload"]["status"], "awaiting_confirmation");
    assert!(
        events
            .iter()
            .any(|e| e["type"] == "status" && e["status"] == "awaiting_confirmation")
    );
    let chat_id = res["payload"]["chat"]["chat"]["id"].clone();

    request(
        &mut ws,
        "d1",
        "chat.decide",
        json!({ "chat_id": chat_id, "tool_call_id": "call_t", "approve": true }),
    )
    .await;
    let (events, res) = until_response(&mut ws, "d1").await;
    assert_eq!(res["ok"], true, "decide failed: {res}");
    assert_eq!(res["payload"]["status"], "completed");
    assert!(
        events
            .iter()
            .any(|e| e["type"] == "tool" && e["state"] == "completed" && e["tool_name"] == "transfer_funds")
    );

    // The proposal is settled; a second decision is refused.
    request(
        &mut ws,
        "d2",
        "chat.decide",
        json!({ "chat_id": chat_id, "tool_call_id": "call_t", "approve": false }),
    )
    .await;
    let (_, res) = until_response(&mut ws, "d2").await;
    assert_eq!(res["ok"], false);
    assert_eq!(res["error"]["code"], "invalid_argument");
}

#[tokio::test]
async fn test_usage_and_unknown_method() {
    let (_state, port) = start_test_gateway(vec![]).await;
    let (mut ws, _) = connect_client(port).await;

    request(&mut ws, "u1", "usage.get", json!({})).await;
    let (_, res) = until_response(&mut ws, "u1").await;
    assert_eq!(res["ok"], true);
    assert_eq!(res["payload"]["used"], 0);
    assert_eq!(res["payload"]["remaining"], res["payload"]["daily_limit"]);

    request(&mut ws, "x1", "nonexistent.method", json!({})).await;
    let (_, res) = until_response(&mut ws, "x1").await;
    assert_eq!(res["ok"], false);
    assert_eq!(res["error"]["code"], "not_found");
}

#[tokio::test]
async fn test_foreign_chat_is_forbidden() {
    let (_state, port) = start_test_gateway(vec![ScriptedTurn::text("ok")]).await;
    let (mut alice, _) = connect_client(port).await;
    let (mut bob, _) = connect_client(port).await;

    request(&mut alice, "s1", "chat.send", json!({ "content": "hello" })).await;
    let (_, res) = until_response(&mut alice, "s1").await;
    let chat_id = res["payload"]["chat"]["chat"]["id"].clone();

    request(&mut bob, "g1", "chat.get", json!({ "chat_id": chat_id })).await;
    let (_, res) = until_response(&mut bob, "g1").await;
    assert_eq!(res["ok"], false);
    assert_eq!(res["error"]["code"], "forbidden");
}

#[tokio::test]
async fn test_stop_cancels_turn_and_connection_recovers() {
    let (_state, port) = start_test_gateway(vec![
        ScriptedTurn::stalled("Thinking"),
        ScriptedTurn::text("Back again"),
    ])
    .await;
    let (mut ws, _) = connect_client(port).await;

    request(&mut ws, "s1", "chat.send", json!({ "content": "take your time" })).await;
    let chat_id = loop {
        let frame = next_frame(&mut ws).await;
        if frame["event"] == "chat.event" && frame["payload"]["type"] == "content_delta" {
            assert_eq!(frame["payload"]["delta"], "Thinking");
            break frame["payload"]["chat_id"].clone();
        }
    };

    request(&mut ws, "x1", "chat.stop", json!({})).await;
    let (mut stop_res, mut send_res) = (None, None);
    while stop_res.is_none() || send_res.is_none() {
        let frame = next_frame(&mut ws).await;
        match frame["id"].as_str() {
            Some("x1") => stop_res = Some(frame),
            Some("s1") => send_res = Some(frame),
            _ => {}
        }
    }
    let stop_res = stop_res.unwrap();
    assert_eq!(stop_res["ok"], true);
    assert_eq!(stop_res["payload"]["stopped"], true);
    let send_res = send_res.unwrap();
    assert_eq!(send_res["ok"], false);
    assert_eq!(send_res["error"]["code"], "generation_stopped");

    // Nothing is running any more, so a second stop is a no-op.
    request(&mut ws, "x2", "chat.stop", json!({})).await;
    let (_, res) = until_response(&mut ws, "x2").await;
    assert_eq!(res["payload"]["stopped"], false);

    request(&mut ws, "s2", "chat.send", json!({ "chat_id": chat_id, "content": "go on" })).await;
    let (_, res) = until_response(&mut ws, "s2").await;
    assert_eq!(res["ok"], true, "send after stop failed: {res}");
    assert_eq!(res["payload"]["status"], "completed");
    let messages = res["payload"]["chat"]["messages"].as_array().unwrap();
    assert_eq!(messages.last().unwrap()["content"], "Back again");
}

#[tokio::test]
async fn test_organization_notes_over_socket() {
    let (_state, port) = start_test_gateway(vec![
        ScriptedTurn::tool_call(
            "call_n",
            "save_organization_note",
            json!({ "content": "Office closes at 6pm" }),
        ),
        ScriptedTurn::text("Noted."),
    ])
    .await;
    let (mut ws, _) = connect_client(port).await;

    request(&mut ws, "s1", "chat.send", json!({ "content": "remember closing time" })).await;
    let (_, res) = until_response(&mut ws, "s1").await;
    assert_eq!(res["payload"]["status"], "completed");

    request(&mut ws, "o1", "org_facts.list", json!({})).await;
    let (_, res) = until_response(&mut ws, "o1").await;
    let facts = res["payload"]["facts"].as_array().unwrap();
    assert_eq!(facts.len(), 1);
    assert_eq!(facts[0]["content"], "Office closes at 6pm");

    request(&mut ws, "o2", "org_facts.delete", json!({ "fact_id": facts[0]["id"] })).await;
    let (_, res) = until_response(&mut ws, "o2").await;
    assert_eq!(res["payload"]["deleted"], true);

    request(&mut ws, "o3", "org_facts.list", json!({})).await;
    let (_, res) = until_response(&mut ws, "o3").await;
    assert!(res["payload"]["facts"].as_array().unwrap().is_empty());
}
