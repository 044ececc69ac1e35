//! Session state machine against an in-memory store and a scripted transport

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use xtun_link::{LinkParser, ParseError, ProtocolKind};
use xtun_router::{MatchType, RouteAction, RoutingEngine, RoutingRule};
use xtun_vpn::{
    CounterSample, EngineType, MemoryStorage, ProfileHandle, SessionError, SessionManager,
    StatsAggregator, Storage, StorageError, StorageKey, TrafficCounter, TransportError,
    TunnelConfig, TunnelTransport, VpnStatus,
};

const VLESS: &str = "vless://b831381d-6324-4d53-ad4f-8cda48b30811@vless.example.com:443?security=tls&type=ws&path=%2Fws#Main";
const TROJAN: &str = "trojan://secret@trojan.example.com:443#Backup";
const GROUP: &str = "group.test";

#[derive(Default)]
struct FakeTransport {
    reconfigurable: bool,
    hold_activation: AtomicBool,
    entered: Notify,
    release: Notify,
    activate_error: Mutex<Option<TransportError>>,
    register_results: Mutex<VecDeque<Result<ProfileHandle, TransportError>>>,
    last_config: Mutex<Option<TunnelConfig>>,
    activations: AtomicUsize,
    deactivations: AtomicUsize,
    reconfigures: AtomicUsize,
    registrations: AtomicUsize,
}

impl FakeTransport {
    fn reconfigurable() -> Self {
        Self {
            reconfigurable: true,
            ..Self::default()
        }
    }

    fn fail_next_activation(&self, error: TransportError) {
        *self.activate_error.lock().unwrap() = Some(error);
    }

    fn last_url(&self) -> Option<String> {
        self.last_config.lock().unwrap().as_ref().map(|c| c.url.clone())
    }
}

#[async_trait]
impl TunnelTransport for FakeTransport {
    async fn load_profile(&self) -> Result<ProfileHandle, TransportError> {
        Ok(ProfileHandle::new("profile-1", "fake"))
    }

    async fn register_profile(&self) -> Result<ProfileHandle, TransportError> {
        let n = self.registrations.fetch_add(1, Ordering::SeqCst) + 1;
        self.register_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(ProfileHandle::new(format!("profile-{}", n + 1), "fake")))
    }

    async fn activate(&self, config: &TunnelConfig) -> Result<(), TransportError> {
        self.activations.fetch_add(1, Ordering::SeqCst);
        if self.hold_activation.load(Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }
        if let Some(error) = self.activate_error.lock().unwrap().take() {
            return Err(error);
        }
        *self.last_config.lock().unwrap() = Some(config.clone());
        Ok(())
    }

    fn supports_reconfigure(&self) -> bool {
        self.reconfigurable
    }

    async fn reconfigure(&self, config: &TunnelConfig) -> Result<(), TransportError> {
        self.reconfigures.fetch_add(1, Ordering::SeqCst);
        *self.last_config.lock().unwrap() = Some(config.clone());
        Ok(())
    }

    async fn deactivate(&self) -> Result<(), TransportError> {
        self.deactivations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn sample_counters(&self) -> Result<CounterSample, TransportError> {
        Ok(CounterSample {
            proxy: TrafficCounter::new(2048, 512),
            ..CounterSample::default()
        })
    }
}

/// Memory storage that records every status write
#[derive(Default)]
struct RecordingStorage {
    inner: MemoryStorage,
    statuses: Mutex<Vec<String>>,
}

impl RecordingStorage {
    fn statuses(&self) -> Vec<String> {
        self.statuses.lock().unwrap().clone()
    }

    fn clear_statuses(&self) {
        self.statuses.lock().unwrap().clear();
    }
}

impl Storage for RecordingStorage {
    fn set_string(&self, key: &str, value: &str) -> Result<(), StorageError> {
        if key.ends_with(".vpn.status") {
            self.statuses.lock().unwrap().push(value.to_string());
        }
        self.inner.set_string(key, value)
    }

    fn get_string(&self, key: &str) -> Option<String> {
        self.inner.get_string(key)
    }

    fn set_value(&self, key: &str, value: &serde_json::Value) -> Result<(), StorageError> {
        self.inner.set_value(key, value)
    }

    fn get_value(&self, key: &str) -> Option<serde_json::Value> {
        self.inner.get_value(key)
    }

    fn remove(&self, key: &str) {
        self.inner.remove(key)
    }
}

fn manager_for(
    group: &str,
    storage: &Arc<RecordingStorage>,
    transport: &Arc<FakeTransport>,
) -> SessionManager {
    SessionManager::new(
        group,
        storage.clone(),
        transport.clone(),
        Arc::new(LinkParser::new()),
        Arc::new(RoutingEngine::new()),
    )
}

fn setup(transport: FakeTransport) -> (SessionManager, Arc<RecordingStorage>, Arc<FakeTransport>) {
    let storage = Arc::new(RecordingStorage::default());
    let transport = Arc::new(transport);
    (manager_for(GROUP, &storage, &transport), storage, transport)
}

#[tokio::test]
async fn test_connect_persists_session_fields() {
    let (session, storage, transport) = setup(FakeTransport::default());
    assert_eq!(session.status().await, VpnStatus::Idle);

    session.connect(VLESS).await.unwrap();

    assert_eq!(session.status().await, VpnStatus::Connected);
    assert_eq!(storage.statuses(), vec!["connecting", "connected"]);

    let key = |k: StorageKey| k.namespaced(GROUP);
    assert_eq!(storage.get_string(&key(StorageKey::ConnectedUrl)).as_deref(), Some(VLESS));
    let stamp = storage.get_string(&key(StorageKey::ConnectedAt)).unwrap();
    assert!(chrono::DateTime::parse_from_rfc3339(&stamp).is_ok());
    assert!(session.connected_at().await.is_some());

    let node = session.connected_node().await.unwrap();
    assert_eq!(node.kind(), ProtocolKind::Vless);
    assert_eq!(node.name(), "Main");
    assert_eq!(transport.activations.load(Ordering::SeqCst), 1);
    assert_eq!(session.profile().await.map(|p| p.id), Some("profile-1".into()));
}

#[tokio::test]
async fn test_parse_failure_never_reaches_connected() {
    let (session, storage, transport) = setup(FakeTransport::default());

    let result = session.connect("socks://user@host:1080").await;
    assert_eq!(
        result,
        Err(SessionError::Parse(ParseError::UnsupportedProtocol("socks".into())))
    );

    assert_eq!(session.status().await, VpnStatus::Disconnected);
    assert_eq!(storage.statuses(), vec!["connecting", "disconnected"]);
    assert!(session.last_error().await.is_some());
    assert_eq!(transport.activations.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_activation_failure_retains_reason() {
    let (session, _, transport) = setup(FakeTransport::default());
    transport.fail_next_activation(TransportError::Refused("quota exceeded".into()));

    let result = session.connect(VLESS).await;
    assert!(matches!(result, Err(SessionError::ActivationFailed(_))));
    assert_eq!(session.status().await, VpnStatus::Disconnected);
    assert!(session.last_error().await.unwrap().contains("quota exceeded"));
    assert!(session.connected_node().await.is_none());
    assert_eq!(transport.activations.load(Ordering::SeqCst), 1);

    // a later connect clears the failure
    session.connect(VLESS).await.unwrap();
    assert!(session.last_error().await.is_none());
}

#[tokio::test]
async fn test_revoked_provider_is_reported_as_unavailable() {
    let (session, _, transport) = setup(FakeTransport::default());
    transport.fail_next_activation(TransportError::Unavailable("profile removed".into()));

    let result = session.connect(TROJAN).await;
    assert_eq!(
        result,
        Err(SessionError::ProviderUnavailable("profile removed".into()))
    );
    assert_eq!(session.status().await, VpnStatus::Disconnected);
}

#[tokio::test]
async fn test_transition_in_flight_rejects_with_busy() {
    let (session, storage, transport) = setup(FakeTransport::default());
    transport.hold_activation.store(true, Ordering::SeqCst);
    let session = Arc::new(session);

    let pending = {
        let session = session.clone();
        tokio::spawn(async move { session.connect(VLESS).await })
    };
    transport.entered.notified().await;

    assert_eq!(session.status().await, VpnStatus::Connecting);
    assert_eq!(session.connect(TROJAN).await, Err(SessionError::Busy));
    assert_eq!(session.disconnect().await, Err(SessionError::Busy));
    assert_eq!(session.update_url(TROJAN).await, Err(SessionError::Busy));
    assert_eq!(session.status().await, VpnStatus::Connecting);

    // statistics never wait on a transition
    let stats = StatsAggregator::new(transport.clone(), Arc::new(RoutingEngine::new()), 1);
    let snapshot = stats.fetch_statistics().await.unwrap();
    assert_eq!((snapshot.download, snapshot.upload), (2048, 512));

    transport.release.notify_one();
    pending.await.unwrap().unwrap();
    assert_eq!(session.status().await, VpnStatus::Connected);
    assert_eq!(storage.statuses(), vec!["connecting", "connected"]);
}

#[tokio::test]
async fn test_disconnect_when_idle_is_noop() {
    let (session, storage, transport) = setup(FakeTransport::default());

    session.disconnect().await.unwrap();
    session.disconnect().await.unwrap();

    assert_eq!(session.status().await, VpnStatus::Idle);
    assert!(storage.statuses().is_empty());
    assert_eq!(transport.deactivations.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_disconnect_tears_down() {
    let (session, storage, transport) = setup(FakeTransport::default());
    session.connect(VLESS).await.unwrap();
    storage.clear_statuses();

    session.disconnect().await.unwrap();

    assert_eq!(session.status().await, VpnStatus::Disconnected);
    assert_eq!(storage.statuses(), vec!["disconnecting", "disconnected"]);
    assert_eq!(transport.deactivations.load(Ordering::SeqCst), 1);
    assert!(session.connected_node().await.is_none());
    assert!(storage.get_string(&StorageKey::ConnectedUrl.namespaced(GROUP)).is_none());

    session.disconnect().await.unwrap();
    assert_eq!(transport.deactivations.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_connect_while_connected_replaces_tunnel() {
    let (session, storage, transport) = setup(FakeTransport::default());
    session.connect(VLESS).await.unwrap();
    storage.clear_statuses();

    session.connect(TROJAN).await.unwrap();

    assert_eq!(storage.statuses(), vec!["disconnecting", "connecting", "connected"]);
    assert_eq!(transport.deactivations.load(Ordering::SeqCst), 1);
    assert_eq!(transport.last_url().as_deref(), Some(TROJAN));
}

#[tokio::test]
async fn test_update_url_requires_live_session() {
    let (session, _, _) = setup(FakeTransport::default());
    assert_eq!(session.update_url(VLESS).await, Err(SessionError::NotActive));
    assert_eq!(session.status().await, VpnStatus::Idle);
}

#[tokio::test]
async fn test_update_url_hot_swaps_when_supported() {
    let (session, storage, transport) = setup(FakeTransport::reconfigurable());
    session.connect(VLESS).await.unwrap();
    storage.clear_statuses();

    session.update_url(TROJAN).await.unwrap();

    assert_eq!(transport.reconfigures.load(Ordering::SeqCst), 1);
    assert_eq!(transport.deactivations.load(Ordering::SeqCst), 0);
    assert!(!storage.statuses().contains(&"disconnecting".to_string()));
    assert_eq!(session.status().await, VpnStatus::Connected);
    assert_eq!(session.connected_node().await.unwrap().kind(), ProtocolKind::Trojan);
    assert_eq!(transport.last_url().as_deref(), Some(TROJAN));
}

#[tokio::test]
async fn test_update_url_restarts_without_reconfigure() {
    let (session, storage, transport) = setup(FakeTransport::default());
    session.connect(VLESS).await.unwrap();
    storage.clear_statuses();

    session.update_url(TROJAN).await.unwrap();

    assert_eq!(storage.statuses(), vec!["disconnecting", "connecting", "connected"]);
    assert_eq!(transport.activations.load(Ordering::SeqCst), 2);
    assert_eq!(session.connected_node().await.unwrap().name(), "Backup");
}

#[tokio::test]
async fn test_update_url_with_bad_link_keeps_session() {
    let (session, _, transport) = setup(FakeTransport::reconfigurable());
    session.connect(VLESS).await.unwrap();

    let result = session.update_url("vless://not-a-uuid@host:443").await;
    assert!(matches!(result, Err(SessionError::Parse(_))));

    assert_eq!(session.status().await, VpnStatus::Connected);
    assert_eq!(session.connected_node().await.unwrap().kind(), ProtocolKind::Vless);
    assert_eq!(transport.reconfigures.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_settings_apply_on_next_connect() {
    let (session, _, transport) = setup(FakeTransport::default());
    session.set_global_mode(true);
    session.set_engine_type(EngineType(3));
    session.set_router_configuration(&[RoutingRule::new(
        RouteAction::Block,
        MatchType::Domain,
        "ads.example",
    )]);

    session.connect(VLESS).await.unwrap();

    let config = transport.last_config.lock().unwrap().clone().unwrap();
    assert!(config.global_mode);
    assert_eq!(config.engine_type, EngineType(3));
    assert_eq!(config.rules.len(), 1);
    let routing = config.engine.routing.unwrap();
    let last = routing["rules"].as_array().unwrap().last().unwrap().clone();
    assert_eq!(last["outboundTag"], "proxy");
}

#[tokio::test]
async fn test_second_process_restores_state() {
    let storage = Arc::new(RecordingStorage::default());
    let transport = Arc::new(FakeTransport::default());

    let controller = manager_for(GROUP, &storage, &transport);
    controller.set_global_mode(true);
    controller.set_engine_type(EngineType(1));
    controller.set_router_configuration(&[RoutingRule::new(
        RouteAction::Direct,
        MatchType::Ip,
        "10.0.0.0/8",
    )]);
    controller.connect(TROJAN).await.unwrap();

    let tunnel = manager_for(GROUP, &storage, &transport);
    assert_eq!(tunnel.status().await, VpnStatus::Connected);
    assert!(tunnel.is_global_mode());
    assert_eq!(tunnel.engine_type(), EngineType(1));
    assert_eq!(tunnel.router_configuration(), controller.router_configuration());
    assert_eq!(tunnel.connected_node().await.unwrap().name(), "Backup");
    assert_eq!(tunnel.connected_at().await, controller.connected_at().await);
}

#[tokio::test]
async fn test_refresh_observes_other_process() {
    let storage = Arc::new(RecordingStorage::default());
    let transport = Arc::new(FakeTransport::default());

    let observer = manager_for(GROUP, &storage, &transport);
    let mut status = observer.subscribe();
    let tunnel = manager_for(GROUP, &storage, &transport);

    tunnel.connect(VLESS).await.unwrap();
    // stale until refreshed
    assert_eq!(observer.status().await, VpnStatus::Idle);

    assert_eq!(observer.refresh_from_storage().await, VpnStatus::Connected);
    assert!(status.has_changed().unwrap());
    assert_eq!(*status.borrow_and_update(), VpnStatus::Connected);
    assert_eq!(observer.connected_node().await.unwrap().name(), "Main");
}

#[tokio::test]
async fn test_groups_are_isolated() {
    let storage = Arc::new(RecordingStorage::default());
    let transport = Arc::new(FakeTransport::default());

    let a = manager_for("group.a", &storage, &transport);
    a.connect(VLESS).await.unwrap();

    let b = manager_for("group.b", &storage, &transport);
    assert_eq!(b.status().await, VpnStatus::Idle);
    assert!(b.connected_node().await.is_none());
}

#[tokio::test]
async fn test_stale_transition_is_not_restored() {
    let storage = Arc::new(RecordingStorage::default());
    storage
        .set_string(&StorageKey::Status.namespaced(GROUP), "connecting")
        .unwrap();
    let transport = Arc::new(FakeTransport::default());

    let session = manager_for(GROUP, &storage, &transport);
    assert_eq!(session.status().await, VpnStatus::Disconnected);
    session.connect(VLESS).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_reenable_retries_transient_failures() {
    let (session, _, transport) = setup(FakeTransport::default());
    {
        let mut results = transport.register_results.lock().unwrap();
        results.push_back(Err(TransportError::Refused("busy".into())));
        results.push_back(Err(TransportError::Unavailable("not ready".into())));
    }

    let handle = session.reenable_manager().await;

    assert!(handle.is_some());
    assert_eq!(transport.registrations.load(Ordering::SeqCst), 3);
    assert_eq!(session.profile().await, handle);
    assert_eq!(session.status().await, VpnStatus::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_reenable_gives_up_on_permanent_failure() {
    let (session, _, transport) = setup(FakeTransport::default());
    transport
        .register_results
        .lock()
        .unwrap()
        .push_back(Err(TransportError::Denied("user declined".into())));

    assert!(session.reenable_manager().await.is_none());
    assert_eq!(transport.registrations.load(Ordering::SeqCst), 1);
    assert_eq!(session.status().await, VpnStatus::Idle);
}

#[tokio::test]
async fn test_connection_counter_tracks_fresh_tunnels() {
    let (session, _, _) = setup(FakeTransport::reconfigurable());
    let mut connections = session.subscribe_connections();

    session.connect(VLESS).await.unwrap();
    assert!(connections.has_changed().unwrap());
    assert_eq!(*connections.borrow_and_update(), 1);

    // an in-place reconfigure keeps the running tunnel
    session.update_url(TROJAN).await.unwrap();
    assert!(!connections.has_changed().unwrap());

    session.connect(VLESS).await.unwrap();
    assert_eq!(*connections.borrow_and_update(), 2);
}
