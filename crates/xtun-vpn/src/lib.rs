//! xtun VPN - Session Control Core
//!
//! Drives the tunnel lifecycle for a proxy client:
//!
//! - **Session**: connect / disconnect / update state machine, persisted
//!   per group identifier so a second process can follow along
//! - **Pinger**: bounded, cancellable latency probes
//! - **Stats**: per-outbound counters folded into cumulative and monthly
//!   totals
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐   parse    ┌────────────┐
//! │ SessionMgr  │──────────► │ LinkParser │
//! │             │   rules    ├────────────┤
//! │             │──────────► │ RoutingEng │◄──── StatsAggregator
//! │             │            └────────────┘            │
//! │             │  activate  ┌─────────────────┐       │ sample
//! │             │──────────► │ TunnelTransport │◄──────┘
//! │             │            └─────────────────┘
//! │             │  persist   ┌─────────┐
//! │             │──────────► │ Storage │
//! └─────────────┘            └─────────┘
//! ```

pub mod config;
pub mod pinger;
pub mod session;
pub mod stats;
pub mod storage;
pub mod transport;

pub use config::{ConfigError, CoreConfig, PingSettings, StatsSettings};
pub use pinger::{
    NetworkProbe, PingResult, PingStream, Pinger, PingerConfig, Probe, ProbeError, ProbeKind,
    ProbeTarget,
};
pub use session::{SessionError, SessionInfo, SessionManager, VpnStatus};
pub use stats::{StatsAggregator, StatsError, StatsSnapshot, cycle_start};
pub use storage::{MemoryStorage, Storage, StorageError, StorageKey};
pub use transport::{
    CounterSample, EngineType, ProfileHandle, TrafficCounter, TransportError, TunnelConfig,
    TunnelTransport,
};
