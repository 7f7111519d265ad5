//! Non-streaming gateway methods.
//!
//! `chat.send`, `chat.decide` and `chat.stop` drive the connection's turn
//! worker and are handled in [`crate::connection`].

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::debug;

use parley_core::error::{ParleyError, Result};
use parley_core::protocol::{ChatIdParams, FactIdParams, GatewayFrame, ListChatsParams};

use crate::state::{GatewayState, Identity};

const DEFAULT_LIST_LIMIT: u32 = 50;
const MAX_LIST_LIMIT: u32 = 200;

/// Decode request params, treating absent params as `{}`.
pub fn parse_params<T: DeserializeOwned>(params: Option<serde_json::Value>) -> Result<T> {
    let value = params.unwrap_or_else(|| json!({}));
    serde_json::from_value(value).map_err(|e| ParleyError::invalid(format!("invalid params: {e}")))
}

/// The response frame for a method result.
pub fn respond<T: Serialize>(request_id: &str, result: Result<T>) -> GatewayFrame {
    match result.and_then(|value| Ok(serde_json::to_value(value)?)) {
        Ok(payload) => GatewayFrame::ok(request_id, payload),
        Err(e) => GatewayFrame::error(request_id, e.code(), &e.to_string()),
    }
}

/// Dispatch a method request and return the response frame.
pub async fn dispatch_method(
    state: &GatewayState,
    identity: &Identity,
    request_id: &str,
    method: &str,
    params: Option<serde_json::Value>,
) -> GatewayFrame {
    debug!(method, "Dispatching method");
    match method {
        "chat.get" => respond(request_id, handle_chat_get(state, identity, params).await),
        "chat.list" => respond(request_id, handle_chat_list(state, identity, params).await),
        "chat.delete" => respond(request_id, handle_chat_delete(state, identity, params).await),
        "usage.get" => respond(request_id, state.engine.usage(identity.user_id).await),
        "facts.list" => respond(
            request_id,
            state
                .engine
                .list_facts(identity.user_id)
                .await
                .map(|facts| json!({ "facts": facts })),
        ),
        "facts.delete" => respond(request_id, handle_fact_delete(state, identity, params).await),
        "org_facts.list" => respond(
            request_id,
            state
                .engine
                .list_organization_facts(identity.organization_id)
                .await
                .map(|facts| json!({ "facts": facts })),
        ),
        "org_facts.delete" => respond(request_id, handle_org_fact_delete(state, identity, params).await),
        _ => GatewayFrame::error(request_id, "not_found", &format!("Unknown method: {method}")),
    }
}

async fn handle_chat_get(
    state: &GatewayState,
    identity: &Identity,
    params: Option<serde_json::Value>,
) -> Result<serde_json::Value> {
    let params: ChatIdParams = parse_params(params)?;
    let snapshot = state
        .engine
        .get_chat(identity.user_id, identity.organization_id, params.chat_id)
        .await?;
    Ok(json!({ "chat": snapshot }))
}

async fn handle_chat_list(
    state: &GatewayState,
    identity: &Identity,
    params: Option<serde_json::Value>,
) -> Result<serde_json::Value> {
    let params: ListChatsParams = parse_params(params)?;
    let limit = params.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);
    let chats = state
        .engine
        .list_chats(identity.user_id, identity.organization_id, limit)
        .await?;
    Ok(json!({ "chats": chats }))
}

async fn handle_chat_delete(
    state: &GatewayState,
    identity: &Identity,
    params: Option<serde_json::Value>,
) -> Result<serde_json::Value> {
    let params: ChatIdParams = parse_params(params)?;
    state
        .engine
        .delete_chat(identity.user_id, identity.organization_id, params.chat_id)
        .await?;
    Ok(json!({ "deleted": true }))
}

async fn handle_fact_delete(
    state: &GatewayState,
    identity: &Identity,
    params: Option<serde_json::Value>,
) -> Result<serde_json::Value> {
    let params: FactIdParams = parse_params(params)?;
    state.engine.delete_fact(identity.user_id, params.fact_id).await?;
    Ok(json!({ "deleted": true }))
}

async fn handle_org_fact_delete(
    state: &GatewayState,
    identity: &Identity,
    params: Option<serde_json::Value>,
) -> Result<serde_json::Value> {
    let params: FactIdParams = parse_params(params)?;
    state
        .engine
        .delete_organization_fact(identity.organization_id, params.fact_id)
        .await?;
    Ok(json!({ "deleted": true }))
}
