//! Core Configuration
//!
//! Settings for the parser, routing engine, prober and statistics, loaded
//! from TOML or JSON.
//!
//! # Example
//!
//! ```toml
//! group_id = "group.com.example.xtun"
//! http_proxy_port = 10809
//! log_level = "warning"
//! global_mode = false
//!
//! [[router]]
//! method = "block"
//! type = "domain"
//! content = "ads.example.com"
//!
//! [ping]
//! timeout_ms = 3000
//! max_concurrency = 16
//!
//! [stats]
//! reset_day = 1
//! ```

use crate::pinger::PingerConfig;
use crate::stats::MAX_RESET_DAY;
use crate::transport::EngineType;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;
use xtun_link::{DEFAULT_HTTP_PROXY_PORT, LinkParser, LogLevel};
use xtun_router::{RoutingEngine, RoutingRule, StatsPolicy};

/// Configuration errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Unsupported config format: {0}")]
    UnsupportedFormat(String),

    #[error("Invalid HTTP proxy port")]
    InvalidPort,

    #[error("Group identifier must not be empty")]
    EmptyGroupId,

    #[error("Invalid ping settings: {0}")]
    InvalidPing(&'static str),
}

/// Latency probe settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PingSettings {
    pub timeout_ms: u64,
    pub max_concurrency: usize,
}

impl Default for PingSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 3000,
            max_concurrency: 16,
        }
    }
}

impl PingSettings {
    pub fn pinger_config(&self) -> PingerConfig {
        PingerConfig {
            timeout: Duration::from_millis(self.timeout_ms),
            max_concurrency: self.max_concurrency,
        }
    }
}

/// Statistics settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsSettings {
    /// Day of month the monthly counters reset (1..=28)
    pub reset_day: u32,
    /// Count direct traffic too
    pub count_direct: bool,
}

impl Default for StatsSettings {
    fn default() -> Self {
        Self {
            reset_day: 1,
            count_direct: false,
        }
    }
}

/// Core configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Shared namespace for persisted state
    pub group_id: String,
    pub http_proxy_port: u16,
    pub log_level: LogLevel,
    pub global_mode: bool,
    pub engine_type: EngineType,
    pub router: Vec<RoutingRule>,
    pub ping: PingSettings,
    pub stats: StatsSettings,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            group_id: "group.xtun".to_string(),
            http_proxy_port: DEFAULT_HTTP_PROXY_PORT,
            log_level: LogLevel::default(),
            global_mode: false,
            engine_type: EngineType::default(),
            router: Vec::new(),
            ping: PingSettings::default(),
            stats: StatsSettings::default(),
        }
    }
}

impl CoreConfig {
    /// Load from a file, choosing the format by extension
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;

        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();

        let config = match extension.as_str() {
            "toml" => Self::from_toml(&content)?,
            "json" => Self::from_json(&content)?,
            other => return Err(ConfigError::UnsupportedFormat(other.to_string())),
        };
        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Load from TOML string
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Load from JSON string
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Export as TOML
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.http_proxy_port == 0 {
            return Err(ConfigError::InvalidPort);
        }
        if self.group_id.trim().is_empty() {
            return Err(ConfigError::EmptyGroupId);
        }
        if self.ping.timeout_ms == 0 {
            return Err(ConfigError::InvalidPing("timeout must be positive"));
        }
        if self.ping.max_concurrency == 0 {
            return Err(ConfigError::InvalidPing("concurrency must be positive"));
        }
        Ok(())
    }

    /// Reset day clamped into range
    pub fn reset_day(&self) -> u32 {
        self.stats.reset_day.clamp(1, MAX_RESET_DAY)
    }

    /// Push parser and routing settings into the shared components
    pub fn apply(&self, parser: &LinkParser, router: &RoutingEngine) {
        parser.set_http_proxy_port(self.http_proxy_port);
        parser.set_log_level(self.log_level);
        router.set_global_mode(self.global_mode);
        if !self.router.is_empty() {
            router.set_router_configuration(&self.router);
        }
        router.set_stats_policy(StatsPolicy {
            count_proxy: true,
            count_direct: self.stats.count_direct,
        });
    }
}
