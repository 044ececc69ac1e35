//! Tunnel Transport
//!
//! The platform side of the tunnel: a provider profile that is loaded or
//! registered, then activated with a composed [`TunnelConfig`]. The
//! session manager drives it; the statistics aggregator samples its
//! per-outbound counters.
//!
//! # Usage
//!
//! ```rust,ignore
//! let config = TunnelConfig::compose(url, node, &parser, &router, EngineType::default());
//! transport.activate(&config).await?;
//! let sample = transport.sample_counters().await?;
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use xtun_link::{LinkParser, ProxyNode, XrayConfig};
use xtun_router::{RouteAction, RoutingEngine, RoutingRule};

/// Transport errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Profile missing or revoked by the system
    #[error("Provider unavailable: {0}")]
    Unavailable(String),

    /// The user or the system refused permanently
    #[error("Provider denied: {0}")]
    Denied(String),

    /// Activation rejected this time, e.g. a transient system error
    #[error("Activation refused: {0}")]
    Refused(String),

    /// Operation not implemented by this transport
    #[error("Operation not supported by this transport")]
    Unsupported,

    /// Counters or teardown requested with no tunnel
    #[error("Tunnel not running")]
    NotRunning,
}

impl TransportError {
    /// Retrying will not help
    pub fn is_permanent(&self) -> bool {
        matches!(self, TransportError::Denied(_) | TransportError::Unsupported)
    }
}

/// Opaque provider profile reference
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileHandle {
    pub id: String,
    pub description: String,
}

impl ProfileHandle {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
        }
    }
}

/// Engine selector passed through to the tunnel process
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EngineType(pub u32);

impl fmt::Display for EngineType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Byte counters for one outbound
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficCounter {
    pub downlink: u64,
    pub uplink: u64,
}

impl TrafficCounter {
    pub fn new(downlink: u64, uplink: u64) -> Self {
        Self { downlink, uplink }
    }

    fn saturating_add(self, other: TrafficCounter) -> Self {
        Self {
            downlink: self.downlink.saturating_add(other.downlink),
            uplink: self.uplink.saturating_add(other.uplink),
        }
    }

    fn checked_sub(self, earlier: TrafficCounter) -> Option<Self> {
        Some(Self {
            downlink: self.downlink.checked_sub(earlier.downlink)?,
            uplink: self.uplink.checked_sub(earlier.uplink)?,
        })
    }
}

/// Counters for every outbound, read in a single call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSample {
    pub proxy: TrafficCounter,
    pub direct: TrafficCounter,
    pub block: TrafficCounter,
}

impl CounterSample {
    pub fn outbound(&self, action: RouteAction) -> TrafficCounter {
        match action {
            RouteAction::Proxy => self.proxy,
            RouteAction::Direct => self.direct,
            RouteAction::Block => self.block,
        }
    }

    /// Per-outbound growth since `earlier`
    ///
    /// `None` when any counter went backwards, i.e. the samples come from
    /// different tunnel runs.
    pub fn since(&self, earlier: &CounterSample) -> Option<CounterSample> {
        Some(CounterSample {
            proxy: self.proxy.checked_sub(earlier.proxy)?,
            direct: self.direct.checked_sub(earlier.direct)?,
            block: self.block.checked_sub(earlier.block)?,
        })
    }

    /// Sum of the outbounds `include` accepts
    pub fn sum_where(&self, include: impl Fn(RouteAction) -> bool) -> TrafficCounter {
        [RouteAction::Proxy, RouteAction::Direct, RouteAction::Block]
            .into_iter()
            .filter(|a| include(*a))
            .fold(TrafficCounter::default(), |acc, a| {
                acc.saturating_add(self.outbound(a))
            })
    }
}

/// Everything the tunnel process needs to run a session
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Share-link the node was parsed from
    pub url: String,
    pub node: Arc<ProxyNode>,
    /// Routing records at composition time
    pub rules: Vec<RoutingRule>,
    pub global_mode: bool,
    pub engine_type: EngineType,
    /// Complete engine document
    pub engine: XrayConfig,
}

impl TunnelConfig {
    /// Compose from the node, the current routing table and the stats policy
    pub fn compose(
        url: impl Into<String>,
        node: Arc<ProxyNode>,
        parser: &LinkParser,
        router: &RoutingEngine,
        engine_type: EngineType,
    ) -> Self {
        let mut engine = parser.client_config_for(&node);
        engine.routing = Some(router.xray_routing());
        engine.policy = Some(router.stats_policy().to_xray_policy());
        engine.stats = Some(serde_json::json!({}));

        Self {
            url: url.into(),
            node,
            rules: router.router_configuration(),
            global_mode: router.is_global_mode(),
            engine_type,
            engine,
        }
    }
}

/// Platform tunnel provider
#[async_trait]
pub trait TunnelTransport: Send + Sync {
    /// Load the existing provider profile
    async fn load_profile(&self) -> Result<ProfileHandle, TransportError>;

    /// Register (or re-register) the provider profile
    async fn register_profile(&self) -> Result<ProfileHandle, TransportError>;

    async fn activate(&self, config: &TunnelConfig) -> Result<(), TransportError>;

    /// Whether [`TunnelTransport::reconfigure`] can swap a running config
    fn supports_reconfigure(&self) -> bool {
        false
    }

    async fn reconfigure(&self, _config: &TunnelConfig) -> Result<(), TransportError> {
        Err(TransportError::Unsupported)
    }

    async fn deactivate(&self) -> Result<(), TransportError>;

    /// Read all outbound counters at once
    async fn sample_counters(&self) -> Result<CounterSample, TransportError>;
}
