// =============================================================================
// Service configuration — JSON file + environment overrides
// =============================================================================
//
// Every field carries `#[serde(default)]` so that adding new fields never
// breaks loading an older config file. Environment overrides are applied
// after the file is parsed; `validate()` collects every problem so startup
// can report all of them at once and exit with code 2.
// =============================================================================

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_mode() -> String {
    "production".to_string()
}

fn default_rw_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    300
}

fn default_shutdown_timeout_secs() -> u64 {
    10
}

fn default_bus_url() -> String {
    "mem://".to_string()
}

fn default_reconnect_attempts() -> u32 {
    10
}

fn default_reconnect_wait_ms() -> u64 {
    500
}

fn default_subjects() -> Vec<String> {
    vec![
        "market.>".to_string(),
        "orders.updates.>".to_string(),
        "positions.>".to_string(),
        "account.>".to_string(),
        "strategies.>".to_string(),
        "risk.emergency.>".to_string(),
    ]
}

fn default_pool_size() -> u32 {
    8
}

fn default_prices_ttl_ms() -> u64 {
    100
}

fn default_policies_ttl_ms() -> u64 {
    1_000
}

fn default_fast_interval_ms() -> u64 {
    100
}

fn default_slow_interval_ms() -> u64 {
    250
}

fn default_send_queue_capacity() -> usize {
    64
}

fn default_ping_interval_secs() -> u64 {
    30
}

fn default_pong_timeout_secs() -> u64 {
    60
}

fn default_write_timeout_secs() -> u64 {
    10
}

fn default_account_id() -> String {
    "primary".to_string()
}

fn default_monitor_interval_secs() -> u64 {
    5
}

fn default_max_leverage() -> f64 {
    10.0
}

fn default_max_drawdown_percent() -> f64 {
    20.0
}

fn default_emergency_threshold() -> f64 {
    25.0
}

fn default_alert_window_secs() -> u64 {
    60
}

fn default_circuit_breaker_window_secs() -> u64 {
    30
}

fn default_circuit_breaker_threshold() -> u32 {
    5
}

fn default_account_monitor_url() -> String {
    "http://127.0.0.1:9093".to_string()
}

fn default_request_timeout_ms() -> u64 {
    1_500
}

fn default_bypass_paths() -> Vec<String> {
    vec!["/api/v1/health".to_string(), "/ws".to_string()]
}

// =============================================================================
// Sections
// =============================================================================

/// HTTP/WebSocket listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// "production" or "development". Development relaxes log formatting.
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default = "default_rw_timeout_secs")]
    pub read_timeout_secs: u64,
    #[serde(default = "default_rw_timeout_secs")]
    pub write_timeout_secs: u64,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults deserialise")
    }
}

/// Message bus connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// `mem://` selects the in-process bus; anything else is treated as a
    /// WebSocket bus endpoint.
    #[serde(default = "default_bus_url")]
    pub url: String,
    /// Number of backoff doublings before the reconnect wait plateaus.
    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: u32,
    #[serde(default = "default_reconnect_wait_ms")]
    pub reconnect_wait_ms: u64,
    /// Subject patterns consumed by the ingestor.
    #[serde(default = "default_subjects")]
    pub subjects: Vec<String>,
}

impl BusConfig {
    pub fn reconnect_wait(&self) -> Duration {
        Duration::from_millis(self.reconnect_wait_ms)
    }

    pub fn is_in_process(&self) -> bool {
        self.url.starts_with("mem://")
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults deserialise")
    }
}

/// Shared key/value cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Redis URL. Empty selects the in-memory store (tests, single node).
    #[serde(default)]
    pub address: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
    #[serde(default = "default_prices_ttl_ms")]
    pub prices_ttl_ms: u64,
    #[serde(default = "default_policies_ttl_ms")]
    pub policies_ttl_ms: u64,
}

impl CacheConfig {
    pub fn prices_ttl(&self) -> Duration {
        Duration::from_millis(self.prices_ttl_ms)
    }

    pub fn policies_ttl(&self) -> Duration {
        Duration::from_millis(self.policies_ttl_ms)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults deserialise")
    }
}

/// Fan-out scheduler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcasterConfig {
    #[serde(default = "default_fast_interval_ms")]
    pub fast_interval_ms: u64,
    #[serde(default = "default_slow_interval_ms")]
    pub slow_interval_ms: u64,
    #[serde(default = "default_send_queue_capacity")]
    pub send_queue_capacity: usize,
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
    #[serde(default = "default_pong_timeout_secs")]
    pub pong_timeout_secs: u64,
    #[serde(default = "default_write_timeout_secs")]
    pub write_timeout_secs: u64,
}

impl BroadcasterConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn pong_timeout(&self) -> Duration {
        Duration::from_secs(self.pong_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }
}

impl Default for BroadcasterConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults deserialise")
    }
}

/// Risk gate settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Primary account under management; used when a check omits account_id
    /// and by the periodic risk-metrics monitor.
    #[serde(default = "default_account_id")]
    pub account_id: String,
    #[serde(default = "default_monitor_interval_secs")]
    pub monitor_interval_secs: u64,
    #[serde(default = "default_max_leverage")]
    pub max_leverage: f64,
    /// Hard drawdown limit, in percent of peak equity.
    #[serde(default = "default_max_drawdown_percent")]
    pub max_drawdown_percent: f64,
    /// Emergency drawdown limit, in percent of peak equity.
    #[serde(default = "default_emergency_threshold")]
    pub emergency_threshold: f64,
    #[serde(default = "default_alert_window_secs")]
    pub alert_window_secs: u64,
    #[serde(default = "default_circuit_breaker_window_secs")]
    pub circuit_breaker_window_secs: u64,
    #[serde(default = "default_circuit_breaker_threshold")]
    pub circuit_breaker_threshold: u32,
}

impl RiskConfig {
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs)
    }

    pub fn circuit_breaker_window(&self) -> Duration {
        Duration::from_secs(self.circuit_breaker_window_secs)
    }
}

impl Default for RiskConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults deserialise")
    }
}

/// Upstream RPC dependencies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_account_monitor_url")]
    pub account_monitor_url: String,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl UpstreamConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults deserialise")
    }
}

/// API authentication. Fail-secure: enabled with an empty key rejects every
/// request rather than allowing them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_bypass_paths")]
    pub bypass_paths: Vec<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults deserialise")
    }
}

// =============================================================================
// Top-level config
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub broadcaster: BroadcasterConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

impl Config {
    /// Load configuration from a JSON file at `path`.
    ///
    /// A missing file is an error so the caller can fall back to defaults
    /// with a warning; a present-but-invalid file must abort startup.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        info!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Apply `MERIDIAN_*` environment overrides on top of the file values.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("MERIDIAN_HOST") {
            self.server.host = host;
        }
        if let Ok(port) = std::env::var("MERIDIAN_PORT") {
            if let Ok(port) = port.parse() {
                self.server.port = port;
            }
        }
        if let Ok(url) = std::env::var("MERIDIAN_BUS_URL") {
            self.bus.url = url;
        }
        if let Ok(addr) = std::env::var("MERIDIAN_CACHE_ADDR") {
            self.cache.address = addr;
        }
        if let Ok(key) = std::env::var("MERIDIAN_API_KEY") {
            self.auth.api_key = key;
            self.auth.enabled = true;
        }
    }

    /// Collect every configuration problem. Empty means valid.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if self.server.port == 0 {
            problems.push("server.port must be non-zero".to_string());
        }
        if self.server.mode != "production" && self.server.mode != "development" {
            problems.push(format!(
                "server.mode must be \"production\" or \"development\", got {:?}",
                self.server.mode
            ));
        }
        if self.bus.url.is_empty() {
            problems.push("bus.url must not be empty (use mem:// for in-process)".to_string());
        }
        if self.bus.reconnect_wait_ms == 0 {
            problems.push("bus.reconnect_wait_ms must be positive".to_string());
        }
        if self.bus.subjects.is_empty() {
            problems.push("bus.subjects must list at least one pattern".to_string());
        }
        if self.broadcaster.fast_interval_ms == 0 || self.broadcaster.slow_interval_ms == 0 {
            problems.push("broadcaster intervals must be positive".to_string());
        }
        if self.broadcaster.send_queue_capacity == 0 {
            problems.push("broadcaster.send_queue_capacity must be positive".to_string());
        }
        if self.broadcaster.pong_timeout_secs <= self.broadcaster.ping_interval_secs {
            problems.push("broadcaster.pong_timeout_secs must exceed ping_interval_secs".to_string());
        }
        if self.risk.max_leverage <= 0.0 {
            problems.push("risk.max_leverage must be positive".to_string());
        }
        if self.risk.max_drawdown_percent <= 0.0 || self.risk.max_drawdown_percent >= 100.0 {
            problems.push("risk.max_drawdown_percent must be in (0, 100)".to_string());
        }
        if self.risk.emergency_threshold < self.risk.max_drawdown_percent {
            problems.push(
                "risk.emergency_threshold must not be below risk.max_drawdown_percent".to_string(),
            );
        }
        if self.risk.circuit_breaker_threshold == 0 {
            problems.push("risk.circuit_breaker_threshold must be positive".to_string());
        }
        if self.upstream.account_monitor_url.is_empty() {
            problems.push("upstream.account_monitor_url must not be empty".to_string());
        }

        problems
    }
}

// =============================================================================
// Tests
// =============================================================================
