//! Configuration loading, validation, and the hot-swappable snapshot handle.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agent::AgentDefinition;
use crate::error::{ParleyError, Result};

const DEFAULT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_DAILY_TOKEN_LIMIT: u64 = 100_000;
const DEFAULT_PORT: u16 = 18790;

/// Top-level Parley configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<DatabaseConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm: Option<LlmConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub quota: Option<QuotaConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine: Option<EngineConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub agents: Option<Vec<AgentDefinition>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<GatewayConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub acquire_timeout_secs: Option<u64>,
}

/// OpenAI-compatible completion endpoint settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Passed through as `reasoning_effort` for reasoning models.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl LlmConfig {
    /// Resolve the API key: check `api_key` field first, then `api_key_env` environment variable.
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuotaConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub daily_token_limit: Option<u64>,

    /// Per-user overrides keyed by user id.
    #[serde(default)]
    pub user_limits: HashMap<String, u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Upper bound on completion/tool iterations per turn (default: 25).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u32>,

    /// Number of most recent messages replayed to the model (default: 200).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history_limit: Option<usize>,

    /// Maximum retrieved document snippets per turn (default: 5).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rag_limit: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_agent: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<GatewayAuthConfig>,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayAuthConfig {
    /// Auth mode: "none" or "token". Default: "none".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_env: Option<String>,
}

impl GatewayAuthConfig {
    /// Resolve the auth token from direct value or env var.
    pub fn resolve_token(&self) -> Option<String> {
        resolve_secret_field(&self.token, &self.token_env)
    }

    pub fn effective_mode(&self) -> &str {
        self.mode.as_deref().unwrap_or("none")
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "parley_agent=debug").
    #[serde(default)]
    pub filters: Vec<String>,

    /// Output target: "stderr" (default) or "stdout".
    #[serde(default = "default_log_output")]
    pub output: String,
}

fn default_log_format() -> String {
    "plain".into()
}

fn default_log_output() -> String {
    "stderr".into()
}

/// Resolve a secret: check the direct value first, then the env-var reference.
pub fn resolve_secret_field(direct: &Option<String>, env_var: &Option<String>) -> Option<String> {
    if let Some(val) = direct {
        if !val.is_empty() {
            return Some(val.clone());
        }
    }
    if let Some(env) = env_var {
        if let Ok(val) = std::env::var(env) {
            if !val.is_empty() {
                return Some(val);
            }
        }
    }
    None
}

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> Result<String> {
    let re = regex::Regex::new(r"\$\{([^}]+)\}").map_err(|e| ParleyError::Config(e.to_string()))?;
    Ok(re
        .replace_all(input, |caps: &regex::Captures| {
            std::env::var(&caps[1]).unwrap_or_default()
        })
        .into_owned())
}

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    ///
    /// A missing file yields the default configuration.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let substituted = substitute_env_vars(raw)?;
        json5::from_str(&substituted).map_err(|e| ParleyError::Config(e.to_string()))
    }

    /// Default config file location.
    pub fn default_path() -> PathBuf {
        data_dir().join("config.json")
    }

    pub fn database_url(&self) -> String {
        self.database
            .as_ref()
            .and_then(|d| d.url.as_ref())
            .map(|u| shellexpand::tilde(u).into_owned())
            .unwrap_or_else(|| format!("sqlite://{}?mode=rwc", data_dir().join("parley.db").display()))
    }

    pub fn database_max_connections(&self) -> u32 {
        self.database
            .as_ref()
            .and_then(|d| d.max_connections)
            .unwrap_or(5)
    }

    pub fn database_acquire_timeout_secs(&self) -> u64 {
        self.database
            .as_ref()
            .and_then(|d| d.acquire_timeout_secs)
            .unwrap_or(30)
    }

    pub fn model(&self) -> String {
        self.llm
            .as_ref()
            .and_then(|l| l.model.clone())
            .unwrap_or_else(|| DEFAULT_MODEL.to_string())
    }

    pub fn temperature(&self) -> Option<f64> {
        self.llm.as_ref().and_then(|l| l.temperature)
    }

    pub fn max_tokens(&self) -> Option<u32> {
        self.llm.as_ref().and_then(|l| l.max_tokens)
    }

    pub fn reasoning_effort(&self) -> Option<String> {
        self.llm.as_ref().and_then(|l| l.reasoning_effort.clone())
    }

    /// Daily token limit for a user, honoring per-user overrides.
    pub fn daily_token_limit(&self, user_id: Uuid) -> u64 {
        let quota = self.quota.as_ref();
        quota
            .and_then(|q| q.user_limits.get(&user_id.to_string()).copied())
            .or_else(|| quota.and_then(|q| q.daily_token_limit))
            .unwrap_or(DEFAULT_DAILY_TOKEN_LIMIT)
    }

    pub fn max_iterations(&self) -> u32 {
        self.engine
            .as_ref()
            .and_then(|e| e.max_iterations)
            .unwrap_or(25)
    }

    pub fn history_limit(&self) -> usize {
        self.engine
            .as_ref()
            .and_then(|e| e.history_limit)
            .unwrap_or(200)
    }

    pub fn rag_limit(&self) -> usize {
        self.engine.as_ref().and_then(|e| e.rag_limit).unwrap_or(5)
    }

    pub fn default_agent_key(&self) -> String {
        self.engine
            .as_ref()
            .and_then(|e| e.default_agent.clone())
            .unwrap_or_else(|| "assistant".to_string())
    }

    /// Configured agents plus the built-in assistant unless it is overridden.
    pub fn agent_definitions(&self) -> Vec<AgentDefinition> {
        let mut defs = self.agents.clone().unwrap_or_default();
        if !defs.iter().any(|d| d.key == "assistant") {
            defs.push(AgentDefinition::default_assistant());
        }
        defs
    }

    pub fn gateway_port(&self) -> u16 {
        self.gateway.as_ref().map(|g| g.port).unwrap_or(DEFAULT_PORT)
    }

    pub fn gateway_bind(&self) -> String {
        self.gateway
            .as_ref()
            .and_then(|g| g.bind.clone())
            .unwrap_or_else(|| "127.0.0.1".to_string())
    }

    /// Get a config value by dotted path (e.g. "gateway.port", "engine.max_iterations").
    pub fn get_path(&self, path: &str) -> Option<serde_json::Value> {
        let json = serde_json::to_value(self).ok()?;
        let mut current = &json;
        for segment in path.split('.') {
            current = current.get(segment)?;
        }
        Some(current.clone())
    }

    /// Validate config, returning (warnings, errors).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        if self.llm.as_ref().and_then(|l| l.resolve_api_key()).is_none() {
            warnings.push("LLM provider has no API key configured".to_string());
        }

        if let Some(gw) = &self.gateway {
            if gw.port == 0 {
                errors.push("Gateway port cannot be 0".to_string());
            }
        }

        let defs = self.agent_definitions();
        let mut seen = HashSet::new();
        for def in &defs {
            if !seen.insert(def.key.as_str()) {
                errors.push(format!("Duplicate agent key '{}'", def.key));
            }
        }

        let default_key = self.default_agent_key();
        match defs.iter().find(|d| d.key == default_key) {
            None => errors.push(format!("Default agent '{default_key}' is not defined")),
            Some(d) if d.is_subagent => {
                errors.push(format!("Default agent '{default_key}' is a subagent"))
            }
            Some(_) => {}
        }

        (warnings, errors)
    }
}

/// Shared, hot-swappable configuration.
///
/// Readers take an immutable snapshot; a reload replaces the whole
/// snapshot at once, so a turn never sees a half-applied config.
#[derive(Debug, Clone)]
pub struct ConfigHandle {
    inner: Arc<RwLock<Arc<Config>>>,
}

impl ConfigHandle {
    pub fn new(config: Config) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(config))),
        }
    }

    /// The current snapshot.
    pub fn snapshot(&self) -> Arc<Config> {
        let guard = self.inner.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    /// Atomically replace the snapshot.
    pub fn replace(&self, config: Config) -> Arc<Config> {
        let next = Arc::new(config);
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        *guard = Arc::clone(&next);
        next
    }
}

impl Default for ConfigHandle {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

/// Base directory for Parley data: `~/.parley/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".parley")
}
