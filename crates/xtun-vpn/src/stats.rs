//! Traffic Statistics
//!
//! Samples the transport's per-outbound counters and folds the categories
//! selected by the routing stats policy into cumulative and monthly totals.
//!
//! The transport reports all counters in one [`CounterSample`], and the
//! monthly ledger is updated under a single lock, so download and upload
//! always come from the same instant and roll over together.
//!
//! Monthly totals grow by the per-outbound difference between consecutive
//! samples, so changing the stats policy only affects traffic from then on.
//! A fresh tunnel restarts the transport counters; the aggregator learns
//! about it from [`StatsAggregator::begin_connection`] or by following
//! [`SessionManager::subscribe_connections`](crate::SessionManager::subscribe_connections).

use crate::storage::{Storage, StorageKey, load_json, store_json};
use crate::transport::{CounterSample, TransportError, TunnelTransport};
use chrono::{DateTime, Datelike, Months, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tracing::{debug, info};
use xtun_router::{RoutingEngine, StatsPolicy};

/// Latest reset day; every month has it
pub const MAX_RESET_DAY: u32 = 28;

/// Statistics errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StatsError {
    #[error("Counters unavailable: {0}")]
    Transport(#[from] TransportError),
}

/// Point-in-time traffic totals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Bytes received in the current connection
    pub download: u64,
    /// Bytes sent in the current connection
    pub upload: u64,
    pub monthly_download: u64,
    pub monthly_upload: u64,
    pub sampled_at: DateTime<Utc>,
}

impl StatsSnapshot {
    /// Format as human-readable string
    pub fn format(&self) -> String {
        format!(
            "Down: {:.2}MB, Up: {:.2}MB (month: {:.2}MB / {:.2}MB)",
            self.download as f64 / (1024.0 * 1024.0),
            self.upload as f64 / (1024.0 * 1024.0),
            self.monthly_download as f64 / (1024.0 * 1024.0),
            self.monthly_upload as f64 / (1024.0 * 1024.0),
        )
    }
}

/// Persisted monthly totals
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
struct MonthlyLedger {
    /// First day of the current cycle
    cycle: Option<NaiveDate>,
    download: u64,
    upload: u64,
    /// Raw counters at the previous sample of the running tunnel
    last: CounterSample,
}

impl MonthlyLedger {
    /// Fold a sample in, returning the monthly pair
    fn record(&mut self, sample: CounterSample, policy: &StatsPolicy, cycle: NaiveDate) -> (u64, u64) {
        if self.cycle != Some(cycle) {
            if self.cycle.is_some() {
                info!("Statistics cycle rolled over to {}", cycle);
            }
            self.cycle = Some(cycle);
            self.download = 0;
            self.upload = 0;
        }

        let grown = sample.since(&self.last).unwrap_or_else(|| {
            debug!("Counters went backwards, treating as a new connection");
            sample
        });
        let delta = grown.sum_where(|action| policy.counts(action));

        self.download = self.download.saturating_add(delta.downlink);
        self.upload = self.upload.saturating_add(delta.uplink);
        self.last = sample;
        (self.download, self.upload)
    }

    fn restart_baseline(&mut self) {
        self.last = CounterSample::default();
    }
}

/// Start of the cycle containing `now`
pub fn cycle_start(now: DateTime<Utc>, reset_day: u32) -> NaiveDate {
    let reset_day = reset_day.clamp(1, MAX_RESET_DAY);
    let today = now.date_naive();
    let this_month = today.with_day(reset_day).unwrap_or(today);
    if today.day() >= reset_day {
        this_month
    } else {
        this_month
            .checked_sub_months(Months::new(1))
            .unwrap_or(this_month)
    }
}

/// Aggregates transport counters into snapshots
pub struct StatsAggregator {
    transport: Arc<dyn TunnelTransport>,
    router: Arc<RoutingEngine>,
    storage: Option<(Arc<dyn Storage>, String)>,
    reset_day: u32,
    ledger: Mutex<MonthlyLedger>,
    connections: Mutex<Option<watch::Receiver<u64>>>,
}

impl StatsAggregator {
    /// Aggregator without persistence; monthly totals live in memory
    pub fn new(transport: Arc<dyn TunnelTransport>, router: Arc<RoutingEngine>, reset_day: u32) -> Self {
        Self {
            transport,
            router,
            storage: None,
            reset_day: reset_day.clamp(1, MAX_RESET_DAY),
            ledger: Mutex::new(MonthlyLedger::default()),
            connections: Mutex::new(None),
        }
    }

    /// Persist monthly totals for `group_id`, restoring any stored ledger
    pub fn with_storage(mut self, storage: Arc<dyn Storage>, group_id: &str) -> Self {
        let key = StorageKey::MonthlyStats.namespaced(group_id);
        if let Some(ledger) = load_json::<MonthlyLedger>(storage.as_ref(), &key) {
            debug!("Restored monthly ledger for cycle {:?}", ledger.cycle);
            *self.ledger.get_mut().unwrap_or_else(PoisonError::into_inner) = ledger;
        }
        self.storage = Some((storage, key));
        self
    }

    /// Restart the counter baseline whenever `connections` changes
    pub fn follow_connections(self, connections: watch::Receiver<u64>) -> Self {
        *self.connections.lock().unwrap_or_else(PoisonError::into_inner) = Some(connections);
        self
    }

    /// The transport started a new tunnel; its first sample counts in full
    pub fn begin_connection(&self) {
        let mut ledger = self.ledger.lock().unwrap_or_else(PoisonError::into_inner);
        ledger.restart_baseline();
        self.persist(&ledger);
    }

    pub fn reset_day(&self) -> u32 {
        self.reset_day
    }

    /// Routing policy deciding which traffic counts
    pub fn stats_policy(&self) -> StatsPolicy {
        self.router.stats_policy()
    }

    /// Sample the transport now
    pub async fn fetch_statistics(&self) -> Result<StatsSnapshot, StatsError> {
        self.fetch_statistics_at(Utc::now()).await
    }

    /// Sample the transport, attributing the sample to `now`
    pub async fn fetch_statistics_at(&self, now: DateTime<Utc>) -> Result<StatsSnapshot, StatsError> {
        if self.connection_changed() {
            debug!("New tunnel started, restarting counter baseline");
            self.begin_connection();
        }
        let sample = self.transport.sample_counters().await?;
        Ok(self.record(&sample, now))
    }

    /// Fold an already taken sample
    pub fn record(&self, sample: &CounterSample, now: DateTime<Utc>) -> StatsSnapshot {
        let policy = self.stats_policy();
        let counted = sample.sum_where(|action| policy.counts(action));
        let cycle = cycle_start(now, self.reset_day);

        let mut ledger = self.ledger.lock().unwrap_or_else(PoisonError::into_inner);
        let (monthly_download, monthly_upload) = ledger.record(*sample, &policy, cycle);
        self.persist(&ledger);

        StatsSnapshot {
            download: counted.downlink,
            upload: counted.uplink,
            monthly_download,
            monthly_upload,
            sampled_at: now,
        }
    }

    fn connection_changed(&self) -> bool {
        let mut connections = self.connections.lock().unwrap_or_else(PoisonError::into_inner);
        match connections.as_mut() {
            Some(rx) if rx.has_changed().unwrap_or(false) => {
                let _ = rx.borrow_and_update();
                true
            }
            _ => false,
        }
    }

    fn persist(&self, ledger: &MonthlyLedger) {
        if let Some((storage, key)) = &self.storage {
            store_json(storage.as_ref(), key, ledger);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use crate::transport::{ProfileHandle, TrafficCounter, TunnelConfig};
    use async_trait::async_trait;
    use chrono::TimeZone;

    struct CounterOnly(Mutex<CounterSample>);

    #[async_trait]
    impl TunnelTransport for CounterOnly {
        async fn load_profile(&self) -> Result<ProfileHandle, TransportError> {
            Err(TransportError::Unavailable("test".into()))
        }
        async fn register_profile(&self) -> Result<ProfileHandle, TransportError> {
            Err(TransportError::Unavailable("test".into()))
        }
        async fn activate(&self, _config: &TunnelConfig) -> Result<(), TransportError> {
            Ok(())
        }
        async fn deactivate(&self) -> Result<(), TransportError> {
            Ok(())
        }
        async fn sample_counters(&self) -> Result<CounterSample, TransportError> {
            Ok(*self.0.lock().unwrap())
        }
    }

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    fn proxy(down: u64, up: u64) -> CounterSample {
        CounterSample {
            proxy: TrafficCounter::new(down, up),
            direct: TrafficCounter::new(1000, 1000),
            block: TrafficCounter::new(5, 5),
        }
    }

    fn aggregator() -> StatsAggregator {
        StatsAggregator::new(
            Arc::new(CounterOnly(Mutex::new(CounterSample::default()))),
            Arc::new(RoutingEngine::new()),
            1,
        )
    }

    #[test]
    fn test_cycle_start() {
        assert_eq!(cycle_start(at(2026, 3, 15, 0), 1), NaiveDate::from_ymd_opt(2026, 3, 1).unwrap());
        assert_eq!(cycle_start(at(2026, 3, 9, 0), 10), NaiveDate::from_ymd_opt(2026, 2, 10).unwrap());
        assert_eq!(cycle_start(at(2026, 1, 2, 0), 5), NaiveDate::from_ymd_opt(2025, 12, 5).unwrap());
        assert_eq!(cycle_start(at(2026, 2, 28, 0), 31), NaiveDate::from_ymd_opt(2026, 2, 28).unwrap());
    }

    #[test]
    fn test_policy_selects_counted_outbounds() {
        let stats = aggregator();
        let snap = stats.record(&proxy(100, 10), at(2026, 5, 2, 0));
        assert_eq!((snap.download, snap.upload), (100, 10));

        stats.router.set_stats_policy(StatsPolicy {
            count_proxy: true,
            count_direct: true,
        });
        let snap = stats.record(&proxy(100, 10), at(2026, 5, 2, 1));
        assert_eq!((snap.download, snap.upload), (1100, 1010));
    }

    #[test]
    fn test_monthly_accumulates_and_survives_reconnect() {
        let stats = aggregator();
        stats.record(&proxy(100, 10), at(2026, 5, 2, 0));
        let snap = stats.record(&proxy(250, 30), at(2026, 5, 2, 1));
        assert_eq!((snap.monthly_download, snap.monthly_upload), (250, 30));

        // new connection restarts the transport counters
        let snap = stats.record(&proxy(40, 4), at(2026, 5, 3, 0));
        assert_eq!((snap.download, snap.upload), (40, 4));
        assert_eq!((snap.monthly_download, snap.monthly_upload), (290, 34));
    }

    #[test]
    fn test_policy_change_only_affects_new_traffic() {
        let stats = aggregator();
        stats.router.set_stats_policy(StatsPolicy {
            count_proxy: true,
            count_direct: true,
        });
        let snap = stats.record(&proxy(100, 10), at(2026, 5, 2, 0));
        assert_eq!((snap.monthly_download, snap.monthly_upload), (1100, 1010));

        stats.router.set_stats_policy(StatsPolicy::default());
        let snap = stats.record(&proxy(100, 10), at(2026, 5, 2, 1));
        assert_eq!((snap.download, snap.upload), (100, 10));
        assert_eq!((snap.monthly_download, snap.monthly_upload), (1100, 1010));

        let snap = stats.record(&proxy(150, 12), at(2026, 5, 2, 2));
        assert_eq!((snap.monthly_download, snap.monthly_upload), (1150, 1012));
    }

    #[test]
    fn test_new_connection_counts_first_sample_in_full() {
        let stats = aggregator();
        stats.record(&proxy(100, 10), at(2026, 5, 2, 0));

        // the next tunnel already moved past the previous counters
        stats.begin_connection();
        let snap = stats.record(&proxy(150, 15), at(2026, 5, 2, 1));
        assert_eq!((snap.monthly_download, snap.monthly_upload), (250, 25));
    }

    #[tokio::test]
    async fn test_follows_connection_changes() {
        let transport = Arc::new(CounterOnly(Mutex::new(proxy(100, 10))));
        let (connections, rx) = watch::channel(0u64);
        let stats = StatsAggregator::new(transport.clone(), Arc::new(RoutingEngine::new()), 1)
            .follow_connections(rx);

        stats.fetch_statistics_at(at(2026, 5, 2, 0)).await.unwrap();

        connections.send_replace(1);
        *transport.0.lock().unwrap() = proxy(150, 15);
        let snap = stats.fetch_statistics_at(at(2026, 5, 2, 1)).await.unwrap();
        assert_eq!((snap.monthly_download, snap.monthly_upload), (250, 25));

        // same tunnel, only the growth counts
        *transport.0.lock().unwrap() = proxy(160, 16);
        let snap = stats.fetch_statistics_at(at(2026, 5, 2, 2)).await.unwrap();
        assert_eq!((snap.monthly_download, snap.monthly_upload), (260, 26));
    }

    #[test]
    fn test_monthly_pair_resets_together() {
        let stats = aggregator();
        stats.record(&proxy(500, 50), Utc.with_ymd_and_hms(2026, 5, 31, 23, 59, 59).unwrap());
        let snap = stats.record(&proxy(520, 60), at(2026, 6, 1, 0));

        assert_eq!(snap.monthly_download, 20);
        assert_eq!(snap.monthly_upload, 10);
        assert_eq!((snap.download, snap.upload), (520, 60));
    }

    #[test]
    fn test_ledger_persists() {
        let storage = Arc::new(MemoryStorage::new());
        let transport = Arc::new(CounterOnly(Mutex::new(CounterSample::default())));
        let router = Arc::new(RoutingEngine::new());

        let first = StatsAggregator::new(transport.clone(), router.clone(), 1)
            .with_storage(storage.clone(), "g");
        first.record(&proxy(300, 30), at(2026, 7, 4, 0));

        let second = StatsAggregator::new(transport, router, 1).with_storage(storage, "g");
        let snap = second.record(&proxy(310, 35), at(2026, 7, 5, 0));
        assert_eq!((snap.monthly_download, snap.monthly_upload), (310, 35));
    }

    #[tokio::test]
    async fn test_fetch_reads_transport_and_is_monotonic() {
        let transport = Arc::new(CounterOnly(Mutex::new(proxy(10, 1))));
        let stats = StatsAggregator::new(transport.clone(), Arc::new(RoutingEngine::new()), 1);

        let a = stats.fetch_statistics().await.unwrap();
        *transport.0.lock().unwrap() = proxy(70, 9);
        let b = stats.fetch_statistics().await.unwrap();

        assert!(b.download >= a.download);
        assert!(b.upload >= a.upload);
        assert_eq!(stats.stats_policy(), StatsPolicy::default());
    }
}
