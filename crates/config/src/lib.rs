//! Configuration loading, validation, and management for loomi.
//!
//! Loads configuration from `~/.loomi/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// The root configuration structure.
///
/// Maps directly to `~/.loomi/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Model client configuration
    #[serde(default)]
    pub model: ModelConfig,

    /// Orchestration runtime knobs
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Key-value store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Gateway configuration
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Optional per-user subagent budget
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitConfig>,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_api_url")]
    pub api_url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Send per-role reasoning budgets. Only for endpoints that accept a
    /// `thinking` request parameter.
    #[serde(default)]
    pub supports_thinking: bool,
}

fn default_api_url() -> String {
    "https://api.openai.com/v1".into()
}
fn default_model() -> String {
    "gpt-4o-mini".into()
}
fn default_request_timeout() -> u64 {
    120
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            api_key: None,
            model: default_model(),
            request_timeout_secs: default_request_timeout(),
            supports_thinking: false,
        }
    }
}

impl ModelConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl std::fmt::Debug for ModelConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelConfig")
            .field("api_url", &self.api_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("model", &self.model)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("supports_thinking", &self.supports_thinking)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Semaphore capacity for subagent fan-out
    #[serde(default = "default_max_concurrent_agents")]
    pub max_concurrent_agents: usize,

    /// Orchestrator thought throttle window
    #[serde(default = "default_output_interval")]
    pub output_interval_secs: u64,

    #[serde(default = "default_true")]
    pub thought_streaming_enabled: bool,

    #[serde(default = "default_thought_min_length")]
    pub thought_min_length: usize,

    #[serde(default = "default_stop_ttl")]
    pub stop_ttl_secs: u64,

    #[serde(default = "default_token_bucket_ttl")]
    pub token_bucket_ttl_secs: u64,

    #[serde(default = "default_queue_timeout")]
    pub queue_timeout_secs: u64,

    #[serde(default = "default_cost_per_token")]
    pub cost_per_token: f64,

    /// Chunks between cooperative stop checks
    #[serde(default = "default_stop_check_interval")]
    pub stop_check_interval: usize,

    /// In-process session context untouched this long is evicted
    #[serde(default = "default_session_idle")]
    pub session_idle_secs: u64,

    /// How often the gateway sweeps idle sessions
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

fn default_max_concurrent_agents() -> usize {
    8
}
fn default_output_interval() -> u64 {
    10
}
fn default_thought_min_length() -> usize {
    10
}
fn default_stop_ttl() -> u64 {
    30
}
fn default_token_bucket_ttl() -> u64 {
    24 * 60 * 60
}
fn default_queue_timeout() -> u64 {
    300
}
fn default_cost_per_token() -> f64 {
    0.000002
}
fn default_stop_check_interval() -> usize {
    10
}
fn default_session_idle() -> u64 {
    60 * 60
}
fn default_sweep_interval() -> u64 {
    60
}
fn default_true() -> bool {
    true
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_concurrent_agents: default_max_concurrent_agents(),
            output_interval_secs: default_output_interval(),
            thought_streaming_enabled: true,
            thought_min_length: default_thought_min_length(),
            stop_ttl_secs: default_stop_ttl(),
            token_bucket_ttl_secs: default_token_bucket_ttl(),
            queue_timeout_secs: default_queue_timeout(),
            cost_per_token: default_cost_per_token(),
            stop_check_interval: default_stop_check_interval(),
            session_idle_secs: default_session_idle(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl RuntimeConfig {
    pub fn output_interval(&self) -> Duration {
        Duration::from_secs(self.output_interval_secs)
    }

    pub fn stop_ttl(&self) -> Duration {
        Duration::from_secs(self.stop_ttl_secs)
    }

    pub fn token_bucket_ttl(&self) -> Duration {
        Duration::from_secs(self.token_bucket_ttl_secs)
    }

    pub fn queue_timeout(&self) -> Duration {
        Duration::from_secs(self.queue_timeout_secs)
    }

    pub fn session_idle(&self) -> Duration {
        Duration::from_secs(self.session_idle_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// "memory" or "none"
    #[serde(default = "default_store_backend")]
    pub backend: String,

    #[serde(default)]
    pub pool_size: PoolSizeConfig,

    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_ms: u64,
}

fn default_store_backend() -> String {
    "memory".into()
}
fn default_acquire_timeout() -> u64 {
    250
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            pool_size: PoolSizeConfig::default(),
            acquire_timeout_ms: default_acquire_timeout(),
        }
    }
}

impl StoreConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

/// Per-priority-class pool capacities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSizeConfig {
    #[serde(default = "default_high_priority_pool")]
    pub high_priority: usize,

    #[serde(default = "default_normal_pool")]
    pub normal: usize,

    #[serde(default = "default_background_pool")]
    pub background: usize,
}

fn default_high_priority_pool() -> usize {
    200
}
fn default_normal_pool() -> usize {
    100
}
fn default_background_pool() -> usize {
    50
}

impl Default for PoolSizeConfig {
    fn default() -> Self {
        Self {
            high_priority: default_high_priority_pool(),
            normal: default_normal_pool(),
            background: default_background_pool(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_host")]
    pub host: String,
}

fn default_port() -> u16 {
    8787
}
fn default_host() -> String {
    "127.0.0.1".into()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
        }
    }
}

/// Sliding-window budget on subagent fan-out per user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub max_subagents: u64,

    #[serde(default = "default_rate_window")]
    pub window_secs: u64,
}

fn default_rate_window() -> u64 {
    60
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.loomi/config.toml).
    ///
    /// Environment overrides:
    /// - `LOOMI_API_KEY` (highest priority), then `OPENAI_API_KEY`
    /// - `LOOMI_API_URL`
    /// - `LOOMI_MODEL`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Some(key) = std::env::var("LOOMI_API_KEY")
            .ok()
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
        {
            self.model.api_key = Some(key);
        }

        if let Ok(url) = std::env::var("LOOMI_API_URL") {
            self.model.api_url = url;
        }

        if let Ok(model) = std::env::var("LOOMI_MODEL") {
            self.model.model = model;
        }
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".loomi")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let rt = &self.runtime;
        if rt.max_concurrent_agents == 0 {
            return Err(ConfigError::ValidationError(
                "runtime.max_concurrent_agents must be at least 1".into(),
            ));
        }

        if rt.stop_check_interval == 0 {
            return Err(ConfigError::ValidationError(
                "runtime.stop_check_interval must be at least 1".into(),
            ));
        }

        if rt.cost_per_token.is_nan() || rt.cost_per_token < 0.0 {
            return Err(ConfigError::ValidationError(
                "runtime.cost_per_token must be >= 0".into(),
            ));
        }

        let pools = &self.store.pool_size;
        if pools.high_priority == 0 || pools.normal == 0 || pools.background == 0 {
            return Err(ConfigError::ValidationError(
                "store.pool_size entries must be at least 1".into(),
            ));
        }

        if !matches!(self.store.backend.as_str(), "memory" | "none") {
            return Err(ConfigError::ValidationError(format!(
                "unknown store.backend '{}' (expected 'memory' or 'none')",
                self.store.backend
            )));
        }

        if let Some(limit) = &self.rate_limit {
            if limit.max_subagents == 0 || limit.window_secs == 0 {
                return Err(ConfigError::ValidationError(
                    "rate_limit.max_subagents and rate_limit.window_secs must be > 0".into(),
                ));
            }
        }

        Ok(())
    }

    /// Whether an API key is available (from config or environment).
    pub fn has_api_key(&self) -> bool {
        self.model.api_key.is_some()
    }

    /// Generate a default config TOML string.
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_runtime_contract() {
        let config = AppConfig::default();
        assert_eq!(config.runtime.max_concurrent_agents, 8);
        assert_eq!(config.runtime.output_interval(), Duration::from_secs(10));
        assert!(config.runtime.thought_streaming_enabled);
        assert_eq!(config.runtime.thought_min_length, 10);
        assert_eq!(config.runtime.stop_ttl(), Duration::from_secs(30));
        assert_eq!(config.runtime.token_bucket_ttl(), Duration::from_secs(86_400));
        assert_eq!(config.runtime.queue_timeout(), Duration::from_secs(300));
        assert!((config.runtime.cost_per_token - 2e-6).abs() < f64::EPSILON);
        assert_eq!(config.store.pool_size.high_priority, 200);
        assert_eq!(config.store.pool_size.normal, 100);
        assert_eq!(config.store.pool_size.background, 50);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn config_roundtrip_toml() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: AppConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.gateway.port, config.gateway.port);
        assert_eq!(parsed.model.model, config.model.model);
    }

    #[test]
    fn zero_concurrency_rejected() {
        let mut config = AppConfig::default();
        config.runtime.max_concurrent_agents = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn unknown_backend_rejected() {
        let mut config = AppConfig::default();
        config.store.backend = "etcd".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_config_file_returns_defaults() {
        let config = AppConfig::load_from(Path::new("/nonexistent/config.toml")).unwrap();
        assert_eq!(config.runtime.max_concurrent_agents, 8);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[runtime]
max_concurrent_agents = 3
thought_min_length = 4

[rate_limit]
max_subagents = 20
"#,
        )
        .unwrap();

        let config = AppConfig::load_from(&path).unwrap();
        assert_eq!(config.runtime.max_concurrent_agents, 3);
        assert_eq!(config.runtime.thought_min_length, 4);
        assert_eq!(config.runtime.stop_ttl_secs, 30);
        let limit = config.rate_limit.unwrap();
        assert_eq!(limit.max_subagents, 20);
        assert_eq!(limit.window(), Duration::from_secs(60));
    }

    #[test]
    fn invalid_file_reports_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "runtime = [").unwrap();
        assert!(matches!(
            AppConfig::load_from(&path),
            Err(ConfigError::ParseError { .. })
        ));
    }

    #[test]
    fn api_key_redacted_in_debug() {
        let mut config = AppConfig::default();
        config.model.api_key = Some("sk-secret".into());
        let debug = format!("{config:?}");
        assert!(!debug.contains("sk-secret"));
        assert!(debug.contains("REDACTED"));
    }

    #[test]
    fn default_toml_generation() {
        let toml_str = AppConfig::default_toml();
        assert!(toml_str.contains("max_concurrent_agents = 8"));
        assert!(toml_str.contains("8787"));
    }
}
