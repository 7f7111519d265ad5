//! WebSocket connection lifecycle: hello, identity handshake, read loop,
//! and the per-connection turn worker.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use chrono::Utc;
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use parley_agent::{AgentEvent, TurnContext};
use parley_core::config::Config;
use parley_core::error::{ParleyError, Result};
use parley_core::protocol::{
    ConnectParams, EVENTS, Features, GatewayFrame, Hello, METHODS, PROTOCOL_VERSION, SendMessageParams,
    ServerInfo, ToolDecisionParams,
};

use crate::events::{EventSequence, chat_event_frame, to_text};
use crate::methods::{dispatch_method, parse_params, respond};
use crate::state::{ConnectionState, GatewayState, Identity};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Constant-time string comparison to prevent timing attacks.
fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes().zip(b.bytes()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn auth_mode(config: &Config) -> &str {
    config
        .gateway
        .as_ref()
        .and_then(|g| g.auth.as_ref())
        .map(|a| a.effective_mode())
        .unwrap_or("none")
}

/// Check a `connect` request against the gateway's auth mode.
fn authenticate(config: &Config, params: &ConnectParams) -> Result<Identity> {
    match auth_mode(config) {
        "none" => {}
        "token" => {
            let expected = config
                .gateway
                .as_ref()
                .and_then(|g| g.auth.as_ref())
                .and_then(|a| a.resolve_token())
                .ok_or_else(|| ParleyError::internal("gateway token not configured"))?;
            match params.token.as_deref() {
                Some(token) if constant_time_eq(token, &expected) => {}
                Some(_) => return Err(ParleyError::Forbidden("invalid token".into())),
                None => return Err(ParleyError::Forbidden("token required".into())),
            }
        }
        other => return Err(ParleyError::internal(format!("unknown auth mode: {other}"))),
    }
    Ok(Identity {
        user_id: params.user_id,
        organization_id: params.organization_id,
    })
}

fn hello_frame(conn_id: &str, config: &Config) -> GatewayFrame {
    let hello = Hello {
        protocol: PROTOCOL_VERSION,
        server: ServerInfo {
            version: env!("CARGO_PKG_VERSION").to_string(),
            conn_id: conn_id.to_string(),
        },
        features: Features {
            methods: METHODS.iter().map(|m| m.to_string()).collect(),
            events: EVENTS.iter().map(|e| e.to_string()).collect(),
        },
        auth_mode: auth_mode(config).to_string(),
    };
    GatewayFrame::Event {
        event: "hello".into(),
        payload: serde_json::to_value(&hello).ok(),
        seq: Some(0),
    }
}

/// Handle a new WebSocket connection.
pub async fn handle_ws_connection(state: Arc<GatewayState>, ws: WebSocket) {
    let conn_id = Uuid::new_v4().to_string();
    info!(conn_id = %conn_id, "New WebSocket connection");

    let (mut ws_tx, mut ws_rx) = ws.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();

    state.connections.write().await.insert(
        conn_id.clone(),
        ConnectionState {
            conn_id: conn_id.clone(),
            outbound: out_tx.clone(),
            identity: None,
            connected_at: Utc::now(),
        },
    );

    let config = state.config.snapshot();
    if let Some(text) = to_text(&hello_frame(&conn_id, &config)) {
        if ws_tx.send(Message::Text(text.into())).await.is_err() {
            cleanup_connection(&state, &conn_id).await;
            return;
        }
    }

    let identity = match tokio::time::timeout(CONNECT_TIMEOUT, wait_for_connect(&config, &mut ws_rx)).await {
        Ok(Ok((request_id, identity))) => {
            let frame = GatewayFrame::ok(
                &request_id,
                json!({
                    "conn_id": conn_id,
                    "user_id": identity.user_id,
                    "organization_id": identity.organization_id,
                }),
            );
            if let Some(text) = to_text(&frame) {
                if ws_tx.send(Message::Text(text.into())).await.is_err() {
                    cleanup_connection(&state, &conn_id).await;
                    return;
                }
            }
            identity
        }
        Ok(Err((request_id, err))) => {
            warn!(conn_id = %conn_id, error = %err, "Connect rejected");
            let frame = GatewayFrame::error(&request_id, err.code(), &err.to_string());
            if let Some(text) = to_text(&frame) {
                let _ = ws_tx.send(Message::Text(text.into())).await;
            }
            let _ = ws_tx.send(Message::Close(None)).await;
            cleanup_connection(&state, &conn_id).await;
            return;
        }
        Err(_) => {
            warn!(conn_id = %conn_id, "Connect timeout");
            let _ = ws_tx.send(Message::Close(None)).await;
            cleanup_connection(&state, &conn_id).await;
            return;
        }
    };

    if let Some(conn) = state.connections.write().await.get_mut(&conn_id) {
        conn.identity = Some(identity);
    }
    info!(conn_id = %conn_id, user_id = %identity.user_id, "Client connected");

    let send_task = tokio::spawn(async move {
        while let Some(text) = out_rx.recv().await {
            if ws_tx.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let mut session = Session {
        state: state.clone(),
        identity,
        outbound: out_tx,
        seq: Arc::new(EventSequence::default()),
        turn: None,
    };

    while let Some(msg_result) = ws_rx.next().await {
        match msg_result {
            Ok(Message::Text(text)) => match serde_json::from_str::<GatewayFrame>(text.as_str()) {
                Ok(GatewayFrame::Request { id, method, params }) => {
                    session.handle_request(id, &method, params).await;
                }
                Ok(_) => debug!(conn_id = %conn_id, "Received non-request frame, ignoring"),
                Err(e) => {
                    warn!(conn_id = %conn_id, %e, "Invalid frame received");
                    session.send(&GatewayFrame::error(
                        "unknown",
                        "invalid_argument",
                        &format!("Invalid frame: {e}"),
                    ));
                }
            },
            Ok(Message::Close(_)) => {
                debug!(conn_id = %conn_id, "Client requested close");
                break;
            }
            Err(e) => {
                error!(conn_id = %conn_id, %e, "WebSocket error");
                break;
            }
            _ => {}
        }
    }

    session.stop_turn();
    send_task.abort();
    cleanup_connection(&state, &conn_id).await;
    info!(conn_id = %conn_id, "WebSocket connection closed");
}

/// Wait for the `connect` request. Errors carry the request id to answer.
async fn wait_for_connect(
    config: &Config,
    ws_rx: &mut SplitStream<WebSocket>,
) -> std::result::Result<(String, Identity), (String, ParleyError)> {
    while let Some(msg_result) = ws_rx.next().await {
        match msg_result {
            Ok(Message::Text(text)) => {
                return match serde_json::from_str::<GatewayFrame>(text.as_str()) {
                    Ok(GatewayFrame::Request { id, method, params }) if method == "connect" => {
                        let identity = parse_params::<ConnectParams>(params)
                            .and_then(|p| authenticate(config, &p));
                        match identity {
                            Ok(identity) => Ok((id, identity)),
                            Err(e) => Err((id, e)),
                        }
                    }
                    Ok(GatewayFrame::Request { id, .. }) => {
                        Err((id, ParleyError::invalid("the first request must be connect")))
                    }
                    _ => Err(("unknown".into(), ParleyError::invalid("expected a connect request"))),
                };
            }
            Ok(Message::Close(_)) => break,
            Err(e) => {
                return Err(("unknown".into(), ParleyError::internal(format!("websocket error: {e}"))));
            }
            _ => continue,
        }
    }
    Err(("unknown".into(), ParleyError::invalid("connection closed before connect")))
}

async fn cleanup_connection(state: &GatewayState, conn_id: &str) {
    state.connections.write().await.remove(conn_id);
}

/// A turn running on the connection's worker.
struct RunningTurn {
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

enum TurnRequest {
    Send(SendMessageParams),
    Decide(ToolDecisionParams),
}

/// An identified connection: at most one turn at a time, while the read
/// loop keeps serving stops and non-streaming methods.
struct Session {
    state: Arc<GatewayState>,
    identity: Identity,
    outbound: mpsc::UnboundedSender<String>,
    seq: Arc<EventSequence>,
    turn: Option<RunningTurn>,
}

impl Session {
    fn send(&self, frame: &GatewayFrame) {
        if let Some(text) = to_text(frame) {
            let _ = self.outbound.send(text);
        }
    }

    fn turn_running(&self) -> bool {
        self.turn.as_ref().is_some_and(|t| !t.handle.is_finished())
    }

    /// Cancel the running turn, if any. Returns whether one was running.
    fn stop_turn(&mut self) -> bool {
        match self.turn.take() {
            Some(turn) if !turn.handle.is_finished() => {
                turn.stop.cancel();
                true
            }
            _ => false,
        }
    }

    async fn handle_request(&mut self, id: String, method: &str, params: Option<serde_json::Value>) {
        match method {
            "chat.send" => match parse_params::<SendMessageParams>(params) {
                Ok(p) => self.start_turn(id, TurnRequest::Send(p)),
                Err(e) => self.send(&respond::<()>(&id, Err(e))),
            },
            "chat.decide" => match parse_params::<ToolDecisionParams>(params) {
                Ok(p) => self.start_turn(id, TurnRequest::Decide(p)),
                Err(e) => self.send(&respond::<()>(&id, Err(e))),
            },
            "chat.stop" => {
                let stopped = self.stop_turn();
                self.send(&GatewayFrame::ok(&id, json!({ "stopped": stopped })));
            }
            "connect" => self.send(&GatewayFrame::error(
                &id,
                "invalid_argument",
                "connection is already identified",
            )),
            _ => {
                let frame = dispatch_method(&self.state, &self.identity, &id, method, params).await;
                self.send(&frame);
            }
        }
    }

    fn start_turn(&mut self, request_id: String, request: TurnRequest) {
        if self.turn_running() {
            self.send(&GatewayFrame::error(
                &request_id,
                "invalid_argument",
                "a turn is already running on this connection",
            ));
            return;
        }

        let stop = CancellationToken::new();
        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<AgentEvent>();
        let ctx = TurnContext::new(self.identity.user_id, self.identity.organization_id, event_tx)
            .with_stop(stop.clone());
        let engine = self.state.engine.clone();
        let outbound = self.outbound.clone();
        let seq = self.seq.clone();

        let handle = tokio::spawn(async move {
            let events_out = outbound.clone();
            let forwarder = tokio::spawn(async move {
                while let Some(event) = event_rx.recv().await {
                    if let Some(text) = to_text(&chat_event_frame(&event, seq.next())) {
                        let _ = events_out.send(text);
                    }
                }
            });

            let result = match request {
                TurnRequest::Send(p) => engine.send_message(&ctx, p.chat_id, &p.content).await,
                TurnRequest::Decide(p) => {
                    engine
                        .decide_tool_call(&ctx, p.chat_id, &p.tool_call_id, p.approve)
                        .await
                }
            };
            // Closing the event channel lets the forwarder drain, so every
            // event frame precedes the response.
            drop(ctx);
            let _ = forwarder.await;

            let frame = respond(
                &request_id,
                result.map(|outcome| {
                    json!({
                        "status": outcome.status(),
                        "chat": outcome.snapshot(),
                    })
                }),
            );
            if let Some(text) = to_text(&frame) {
                let _ = outbound.send(text);
            }
        });

        self.turn = Some(RunningTurn { stop, handle });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connect_params(token: Option<&str>) -> ConnectParams {
        ConnectParams {
            user_id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            token: token.map(str::to_string),
        }
    }

    fn token_config() -> Config {
        Config::parse("{ gateway: { auth: { mode: 'token', token: 'secret-token' } } }").unwrap()
    }

    #[test]
    fn test_no_auth_accepts_identity() {
        let params = connect_params(None);
        let identity = authenticate(&Config::default(), &params).unwrap();
        assert_eq!(identity.user_id, params.user_id);
        assert_eq!(identity.organization_id, params.organization_id);
    }

    #[test]
    fn test_token_auth() {
        let config = token_config();
        assert!(authenticate(&config, &connect_params(Some("secret-token"))).is_ok());

        let err = authenticate(&config, &connect_params(Some("wrong-token"))).unwrap_err();
        assert_eq!(err.code(), "forbidden");
        let err = authenticate(&config, &connect_params(None)).unwrap_err();
        assert_eq!(err.code(), "forbidden");
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq("hello", "hello"));
        assert!(!constant_time_eq("hello", "world"));
        assert!(!constant_time_eq("hello", "hell"));
    }

    #[test]
    fn test_hello_lists_methods() {
        let frame = serde_json::to_value(hello_frame("c1", &token_config())).unwrap();
        assert_eq!(frame["event"], "hello");
        assert_eq!(frame["seq"], 0);
        assert_eq!(frame["payload"]["auth_mode"], "token");
        let methods = frame["payload"]["features"]["methods"].as_array().unwrap();
        assert!(methods.iter().any(|m| m == "chat.decide"));
    }
}
