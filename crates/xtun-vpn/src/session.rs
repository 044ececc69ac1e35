//! Session Manager
//!
//! Drives the tunnel through connect, disconnect and link updates for one
//! group identifier, persisting every session field through [`Storage`]
//! so the other process can observe it.
//!
//! # States
//!
//! ```text
//! Idle ──► Connecting ──► Connected ──► Disconnecting ──► Disconnected
//!              ▲  │                                           │
//!              │  └──────────── (parse/activation failure) ──►│
//!              └──────────────────────────────────────────────┘
//! ```
//!
//! `connect`, `disconnect` and `update_url` are mutually exclusive. A call
//! made while another is in flight fails with [`SessionError::Busy`]
//! instead of queueing.
//!
//! # Usage
//!
//! ```rust,ignore
//! let session = SessionManager::new("group.app", storage, transport, parser, router);
//! session.initialize().await;
//!
//! let mut status = session.subscribe();
//! session.connect("vless://...").await?;
//! assert_eq!(*status.borrow_and_update(), VpnStatus::Connected);
//!
//! session.disconnect().await?;
//! ```

use crate::storage::{Storage, StorageKey, load_json, store_json, store_string};
use crate::transport::{EngineType, ProfileHandle, TransportError, TunnelConfig, TunnelTransport};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, watch};
use tracing::{debug, error, info, warn};
use xtun_link::{LinkParser, ParseError, ProxyNode};
use xtun_router::{RoutingEngine, RoutingRule};

/// Registration attempts made by [`SessionManager::reenable_manager`]
const REGISTER_ATTEMPTS: u32 = 3;
/// Base delay between registration attempts, doubled each retry
const REGISTER_BACKOFF: Duration = Duration::from_millis(500);

/// Session status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VpnStatus {
    /// No session has been started for this group
    #[default]
    Idle,
    /// Link parsed or being parsed, tunnel starting
    Connecting,
    /// Tunnel running with the stored node
    Connected,
    /// Tunnel being stopped
    Disconnecting,
    /// Stopped by the user or after a failure
    Disconnected,
}

impl VpnStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VpnStatus::Idle => "idle",
            VpnStatus::Connecting => "connecting",
            VpnStatus::Connected => "connected",
            VpnStatus::Disconnecting => "disconnecting",
            VpnStatus::Disconnected => "disconnected",
        }
    }

    /// Connecting, Connected or Disconnecting
    pub fn is_live(&self) -> bool {
        !matches!(self, VpnStatus::Idle | VpnStatus::Disconnected)
    }

    pub fn is_transitioning(&self) -> bool {
        matches!(self, VpnStatus::Connecting | VpnStatus::Disconnecting)
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, VpnStatus::Connected)
    }
}

impl fmt::Display for VpnStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VpnStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "idle" => Ok(VpnStatus::Idle),
            "connecting" => Ok(VpnStatus::Connecting),
            "connected" => Ok(VpnStatus::Connected),
            "disconnecting" => Ok(VpnStatus::Disconnecting),
            "disconnected" => Ok(VpnStatus::Disconnected),
            other => Err(format!("unknown status '{}'", other)),
        }
    }
}

/// Session errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SessionError {
    /// Another connect, disconnect or update is running
    #[error("Another session transition is in progress")]
    Busy,

    /// Update requested with no live session
    #[error("No active session")]
    NotActive,

    /// Share-link rejected by the parser
    #[error("Invalid link: {0}")]
    Parse(#[from] ParseError),

    /// No usable tunnel profile
    #[error("Tunnel provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// Transport refused to start the tunnel
    #[error("Tunnel activation failed: {0}")]
    ActivationFailed(String),
}

impl From<TransportError> for SessionError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Unavailable(reason) | TransportError::Denied(reason) => {
                SessionError::ProviderUnavailable(reason)
            }
            other => SessionError::ActivationFailed(other.to_string()),
        }
    }
}

/// Fields describing the current session
#[derive(Debug, Clone, Default)]
pub struct SessionInfo {
    pub status: VpnStatus,
    pub url: Option<String>,
    pub node: Option<Arc<ProxyNode>>,
    pub connected_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Session manager for one group identifier
pub struct SessionManager {
    group_id: String,
    storage: Arc<dyn Storage>,
    transport: Arc<dyn TunnelTransport>,
    parser: Arc<LinkParser>,
    router: Arc<RoutingEngine>,
    /// Current session fields
    info: RwLock<SessionInfo>,
    status_tx: watch::Sender<VpnStatus>,
    /// Bumped each time the transport starts a fresh tunnel
    connections_tx: watch::Sender<u64>,
    /// Held for the duration of a transition
    transition: Mutex<()>,
    profile: RwLock<Option<ProfileHandle>>,
    engine_type: AtomicU32,
}

impl SessionManager {
    /// Create a manager, restoring persisted fields for `group_id`
    ///
    /// Stored routing records and global mode are pushed into `router`.
    /// A stored transitional status left behind by a process that is gone
    /// is restored as `Disconnected`.
    pub fn new(
        group_id: impl Into<String>,
        storage: Arc<dyn Storage>,
        transport: Arc<dyn TunnelTransport>,
        parser: Arc<LinkParser>,
        router: Arc<RoutingEngine>,
    ) -> Self {
        let group_id = group_id.into();
        let key = |k: StorageKey| k.namespaced(&group_id);

        if let Some(records) = load_json::<Vec<RoutingRule>>(storage.as_ref(), &key(StorageKey::Router)) {
            router.set_router_configuration(&records);
        }
        if let Some(global) = load_json::<bool>(storage.as_ref(), &key(StorageKey::GlobalMode)) {
            router.set_global_mode(global);
        }
        let engine_type = load_json::<EngineType>(storage.as_ref(), &key(StorageKey::EngineType))
            .unwrap_or_default();

        let mut info = read_info(storage.as_ref(), &group_id, &parser);
        if info.status.is_transitioning() {
            warn!("Discarding stale '{}' status for {}", info.status, group_id);
            info.status = VpnStatus::Disconnected;
        }
        debug!("Restored session for {}: {}", group_id, info.status);

        let (status_tx, _) = watch::channel(info.status);
        let (connections_tx, _) = watch::channel(0);

        Self {
            group_id,
            storage,
            transport,
            parser,
            router,
            info: RwLock::new(info),
            status_tx,
            connections_tx,
            transition: Mutex::new(()),
            profile: RwLock::new(None),
            engine_type: AtomicU32::new(engine_type.0),
        }
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    fn key(&self, key: StorageKey) -> String {
        key.namespaced(&self.group_id)
    }

    /// Load the existing provider profile
    pub async fn initialize(&self) -> Option<ProfileHandle> {
        match self.transport.load_profile().await {
            Ok(handle) => {
                info!("Loaded tunnel profile {}", handle.id);
                *self.profile.write().await = Some(handle.clone());
                Some(handle)
            }
            Err(e) => {
                warn!("No tunnel profile loaded: {}", e);
                None
            }
        }
    }

    pub async fn profile(&self) -> Option<ProfileHandle> {
        self.profile.read().await.clone()
    }

    /// Re-register a revoked provider profile
    ///
    /// Transient failures are retried with backoff; a permanent failure
    /// returns `None` at once. The session status is left untouched.
    pub async fn reenable_manager(&self) -> Option<ProfileHandle> {
        let mut delay = REGISTER_BACKOFF;

        for attempt in 1..=REGISTER_ATTEMPTS {
            match self.transport.register_profile().await {
                Ok(handle) => {
                    info!("Re-registered tunnel profile {}", handle.id);
                    *self.profile.write().await = Some(handle.clone());
                    return Some(handle);
                }
                Err(e) if e.is_permanent() => {
                    error!("Profile registration failed permanently: {}", e);
                    return None;
                }
                Err(e) => {
                    warn!(
                        "Profile registration attempt {}/{} failed: {}",
                        attempt, REGISTER_ATTEMPTS, e
                    );
                    if attempt < REGISTER_ATTEMPTS {
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    }
                }
            }
        }

        error!("Giving up on profile registration");
        None
    }

    /// Current status
    pub async fn status(&self) -> VpnStatus {
        self.info.read().await.status
    }

    /// Watch status changes
    pub fn subscribe(&self) -> watch::Receiver<VpnStatus> {
        self.status_tx.subscribe()
    }

    /// Watch fresh tunnel activations
    ///
    /// The value changes whenever the transport starts a new tunnel, whose
    /// counters start from zero. An in-place reconfigure keeps the running
    /// tunnel and does not count.
    pub fn subscribe_connections(&self) -> watch::Receiver<u64> {
        self.connections_tx.subscribe()
    }

    pub async fn info(&self) -> SessionInfo {
        self.info.read().await.clone()
    }

    pub async fn connected_node(&self) -> Option<Arc<ProxyNode>> {
        self.info.read().await.node.clone()
    }

    pub async fn connected_at(&self) -> Option<DateTime<Utc>> {
        self.info.read().await.connected_at
    }

    /// Reason of the last failed transition
    pub async fn last_error(&self) -> Option<String> {
        self.info.read().await.last_error.clone()
    }

    /// Connect to the node described by `url`
    ///
    /// From `Connected`, the running tunnel is torn down first.
    pub async fn connect(&self, url: &str) -> Result<(), SessionError> {
        let _guard = self.transition.try_lock().map_err(|_| SessionError::Busy)?;

        let current = self.status().await;
        if current.is_transitioning() {
            debug!("Rejecting connect while {}", current);
            return Err(SessionError::Busy);
        }

        if current.is_connected() {
            info!("Reconnecting {} with a new link", self.group_id);
            self.teardown(VpnStatus::Connecting).await;
        } else {
            self.set_status(VpnStatus::Connecting).await;
        }

        self.establish(url).await
    }

    /// Tear down the tunnel; a no-op when not connected
    pub async fn disconnect(&self) -> Result<(), SessionError> {
        let _guard = self.transition.try_lock().map_err(|_| SessionError::Busy)?;

        match self.status().await {
            VpnStatus::Idle | VpnStatus::Disconnected => {
                debug!("Disconnect ignored, no session");
                Ok(())
            }
            VpnStatus::Disconnecting => Err(SessionError::Busy),
            VpnStatus::Connecting | VpnStatus::Connected => {
                self.teardown(VpnStatus::Disconnected).await;
                info!("Disconnected {}", self.group_id);
                Ok(())
            }
        }
    }

    /// Switch the live session to another link
    ///
    /// Hot-swaps the configuration when the transport can reconfigure in
    /// place; otherwise performs a full disconnect and connect. A link that
    /// fails to parse leaves the running session untouched.
    pub async fn update_url(&self, url: &str) -> Result<(), SessionError> {
        let _guard = self.transition.try_lock().map_err(|_| SessionError::Busy)?;

        let current = self.status().await;
        if !matches!(current, VpnStatus::Connected | VpnStatus::Connecting) {
            return Err(SessionError::NotActive);
        }

        let node = Arc::new(self.parser.parse(url, None)?);

        if self.transport.supports_reconfigure() {
            let config = self.compose(url, node.clone());
            match self.transport.reconfigure(&config).await {
                Ok(()) => {
                    info!("Reconfigured tunnel to {}", node);
                    self.mark_connected(url, node).await;
                    return Ok(());
                }
                Err(e) => {
                    warn!("In-place reconfigure failed ({}), restarting tunnel", e);
                }
            }
        }

        self.teardown(VpnStatus::Connecting).await;
        self.activate(url, node).await
    }

    /// Replace all six routing lists and persist them
    pub fn set_router_configuration(&self, records: &[RoutingRule]) {
        self.router.set_router_configuration(records);
        store_json(
            self.storage.as_ref(),
            &self.key(StorageKey::Router),
            &self.router.router_configuration(),
        );
    }

    pub fn router_configuration(&self) -> Vec<RoutingRule> {
        self.router.router_configuration()
    }

    /// Takes effect on the next connect or update
    pub fn set_global_mode(&self, enabled: bool) {
        self.router.set_global_mode(enabled);
        store_json(self.storage.as_ref(), &self.key(StorageKey::GlobalMode), &enabled);
    }

    pub fn is_global_mode(&self) -> bool {
        self.router.is_global_mode()
    }

    /// Takes effect on the next connect or update
    pub fn set_engine_type(&self, engine_type: EngineType) {
        self.engine_type.store(engine_type.0, Ordering::Relaxed);
        store_json(self.storage.as_ref(), &self.key(StorageKey::EngineType), &engine_type);
    }

    pub fn engine_type(&self) -> EngineType {
        EngineType(self.engine_type.load(Ordering::Relaxed))
    }

    /// Adopt session fields written by the other process
    ///
    /// Skipped while a local transition is running, since local state is
    /// authoritative then.
    pub async fn refresh_from_storage(&self) -> VpnStatus {
        let Ok(_guard) = self.transition.try_lock() else {
            return self.status().await;
        };

        let stored = read_info(self.storage.as_ref(), &self.group_id, &self.parser);
        let status = stored.status;
        let changed = {
            let mut info = self.info.write().await;
            let changed = info.status != status;
            *info = stored;
            changed
        };

        if changed {
            debug!("Observed external status change to {}", status);
            self.status_tx.send_replace(status);
        }
        status
    }

    fn compose(&self, url: &str, node: Arc<ProxyNode>) -> TunnelConfig {
        TunnelConfig::compose(url, node, &self.parser, &self.router, self.engine_type())
    }

    async fn ensure_profile(&self) -> Result<(), SessionError> {
        if self.profile.read().await.is_some() {
            return Ok(());
        }
        let handle = self.transport.load_profile().await?;
        *self.profile.write().await = Some(handle);
        Ok(())
    }

    /// Parse, compose and activate; expects status `Connecting`
    async fn establish(&self, url: &str) -> Result<(), SessionError> {
        match self.parser.parse(url, None) {
            Ok(node) => self.activate(url, Arc::new(node)).await,
            Err(e) => {
                self.fail(e.to_string()).await;
                Err(e.into())
            }
        }
    }

    async fn activate(&self, url: &str, node: Arc<ProxyNode>) -> Result<(), SessionError> {
        if let Err(e) = self.ensure_profile().await {
            self.fail(e.to_string()).await;
            return Err(e);
        }

        let config = self.compose(url, node.clone());
        match self.transport.activate(&config).await {
            Ok(()) => {
                info!("Connected to {}", node);
                self.connections_tx.send_modify(|n| *n = n.wrapping_add(1));
                self.mark_connected(url, node).await;
                Ok(())
            }
            Err(e) => {
                let err = SessionError::from(e);
                self.fail(err.to_string()).await;
                Err(err)
            }
        }
    }

    async fn set_status(&self, status: VpnStatus) {
        self.info.write().await.status = status;
        store_string(self.storage.as_ref(), &self.key(StorageKey::Status), status.as_str());
        self.status_tx.send_replace(status);
        debug!("Session {} is {}", self.group_id, status);
    }

    async fn mark_connected(&self, url: &str, node: Arc<ProxyNode>) {
        let now = Utc::now();
        {
            let mut info = self.info.write().await;
            info.url = Some(url.to_string());
            info.node = Some(node);
            info.connected_at = Some(now);
            info.last_error = None;
        }

        let storage = self.storage.as_ref();
        store_string(storage, &self.key(StorageKey::ConnectedUrl), url);
        store_string(storage, &self.key(StorageKey::ConnectedAt), &now.to_rfc3339());
        storage.remove(&self.key(StorageKey::LastError));
        self.set_status(VpnStatus::Connected).await;
    }

    async fn clear_connection(&self) {
        {
            let mut info = self.info.write().await;
            info.url = None;
            info.node = None;
            info.connected_at = None;
        }
        self.storage.remove(&self.key(StorageKey::ConnectedUrl));
        self.storage.remove(&self.key(StorageKey::ConnectedAt));
    }

    async fn fail(&self, reason: String) {
        error!("Session {} failed: {}", self.group_id, reason);
        self.clear_connection().await;
        store_string(self.storage.as_ref(), &self.key(StorageKey::LastError), &reason);
        self.info.write().await.last_error = Some(reason);
        self.set_status(VpnStatus::Disconnected).await;
    }

    /// Deactivate the transport and settle on `then`
    async fn teardown(&self, then: VpnStatus) {
        self.set_status(VpnStatus::Disconnecting).await;
        if let Err(e) = self.transport.deactivate().await {
            warn!("Tunnel deactivation reported: {}", e);
        }
        self.clear_connection().await;
        self.set_status(then).await;
    }
}

/// Read persisted session fields
fn read_info(storage: &dyn Storage, group_id: &str, parser: &LinkParser) -> SessionInfo {
    let key = |k: StorageKey| k.namespaced(group_id);

    let status = storage
        .get_string(&key(StorageKey::Status))
        .and_then(|s| s.parse::<VpnStatus>().ok())
        .unwrap_or_default();
    let url = storage.get_string(&key(StorageKey::ConnectedUrl));
    let node = url
        .as_deref()
        .and_then(|u| parser.parse(u, None).ok())
        .map(Arc::new);
    let connected_at = storage
        .get_string(&key(StorageKey::ConnectedAt))
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|t| t.with_timezone(&Utc));
    let last_error = storage.get_string(&key(StorageKey::LastError));

    SessionInfo {
        status,
        url,
        node,
        connected_at,
        last_error,
    }
}
