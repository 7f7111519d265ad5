//! Config hot-reload via filesystem watcher.
//!
//! Watches the config file, re-parses on change, swaps the live snapshot
//! and the agent registry, and broadcasts a `ConfigChange`.

use std::path::PathBuf;
use std::sync::Arc;

use notify::{EventKind, RecursiveMode, Watcher};
use serde_json::json;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use parley_agent::AgentRegistry;
use parley_core::config::{Config, ConfigHandle};

use crate::events::{CONFIG_CHANGED, broadcast_event};
use crate::state::GatewayState;

/// A config change event.
#[derive(Debug, Clone)]
pub struct ConfigChange {
    pub new_config: Arc<Config>,
}

/// Watches the config file and emits change events.
pub struct ConfigWatcher {
    change_tx: broadcast::Sender<ConfigChange>,
    _watcher: notify::RecommendedWatcher,
}

impl ConfigWatcher {
    /// Start watching the config file at `config_path`.
    ///
    /// A reload that fails to parse or validate leaves the running config
    /// untouched.
    pub fn start(
        config_path: PathBuf,
        handle: ConfigHandle,
        agents: Arc<AgentRegistry>,
    ) -> anyhow::Result<(Self, broadcast::Receiver<ConfigChange>)> {
        let (change_tx, change_rx) = broadcast::channel(16);

        let tx = change_tx.clone();
        let path = config_path.clone();
        let mut watcher = notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| {
            match res {
                Ok(event) => {
                    if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                        return;
                    }
                    if !event.paths.is_empty() && !event.paths.iter().any(|p| p.ends_with(file_name(&path))) {
                        return;
                    }
                    debug!("Config file changed, reloading");
                    if let Some(change) = reload(&path, &handle, &agents) {
                        let _ = tx.send(change);
                    }
                }
                Err(e) => error!(%e, "Config file watch error"),
            }
        })?;

        // Watch the parent directory to catch editors that rename over the file.
        let watch_path = config_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));
        watcher.watch(&watch_path, RecursiveMode::NonRecursive)?;
        info!(path = %config_path.display(), "Config file watcher started");

        Ok((
            Self {
                change_tx,
                _watcher: watcher,
            },
            change_rx,
        ))
    }

    /// Subscribe to config change events.
    pub fn subscribe(&self) -> broadcast::Receiver<ConfigChange> {
        self.change_tx.subscribe()
    }
}

fn file_name(path: &std::path::Path) -> &std::path::Path {
    path.file_name().map(std::path::Path::new).unwrap_or(path)
}

fn reload(path: &std::path::Path, handle: &ConfigHandle, agents: &AgentRegistry) -> Option<ConfigChange> {
    let config = match Config::load(path) {
        Ok(config) => config,
        Err(e) => {
            error!(%e, "Failed to reload config");
            return None;
        }
    };
    let (warnings, errors) = config.validate();
    for w in &warnings {
        warn!(warning = %w, "Config warning");
    }
    if !errors.is_empty() {
        warn!(?errors, "Reloaded config is invalid, keeping the running config");
        return None;
    }

    let definitions = config.agent_definitions();
    let new_config = handle.replace(config);
    agents.reload(definitions);
    info!("Config reloaded successfully");
    Some(ConfigChange { new_config })
}

/// Tell identified clients about each reload.
pub fn announce_changes(
    state: Arc<GatewayState>,
    mut changes: broadcast::Receiver<ConfigChange>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match changes.recv().await {
                Ok(change) => {
                    let agents: Vec<String> = change
                        .new_config
                        .agent_definitions()
                        .into_iter()
                        .map(|a| a.key)
                        .collect();
                    broadcast_event(&state, CONFIG_CHANGED, Some(json!({ "agents": agents }))).await;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Config change announcements lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
