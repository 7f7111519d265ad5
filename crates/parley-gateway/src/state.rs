//! Gateway shared state.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

use parley_agent::Engine;
use parley_core::config::ConfigHandle;

/// Shared gateway state accessible from all connections and handlers.
pub struct GatewayState {
    pub config: ConfigHandle,
    pub engine: Arc<Engine>,
    pub connections: RwLock<HashMap<String, ConnectionState>>,
}

/// The caller a connection acts for, fixed by its `connect` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub user_id: Uuid,
    pub organization_id: Uuid,
}

/// Per-connection state.
pub struct ConnectionState {
    pub conn_id: String,
    /// Serialized frames queued for the socket writer.
    pub outbound: mpsc::UnboundedSender<String>,
    pub identity: Option<Identity>,
    pub connected_at: DateTime<Utc>,
}

impl GatewayState {
    pub fn new(config: ConfigHandle, engine: Arc<Engine>) -> Self {
        Self {
            config,
            engine,
            connections: RwLock::new(HashMap::new()),
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }
}
