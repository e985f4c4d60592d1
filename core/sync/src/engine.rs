//! Offline engine façade: the surface other subsystems call.
//!
//! Every method returns a plain value (`bool`, `Option`) instead of an error.
//! Failures are logged here and converted, so callers can degrade gracefully
//! (for example by disabling offline mode when [`OfflineEngine::initialize`]
//! returns `false`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, info, warn};
use url::Url;

use offsync_common::{Error, MutationId, Result, TableName};
use offsync_storage::{
    Clock, EntityRecord, EntitySyncStatus, HttpMethod, LocalStore, MutationQueue,
    MutationStatus, QueuedMutation, ResponseCache, SystemClock, DEFAULT_MAX_RETRIES,
};

use crate::connectivity::{ConnectivityMonitor, ReachabilitySource};
use crate::coordinator::{CoordinatorConfig, SyncCoordinator, SyncEvent, SyncOutcome};
use crate::retry::BackoffConfig;
use crate::state::{SyncPhase, SyncState};
use crate::transport::{HttpTransport, Transport, DEFAULT_REQUEST_TIMEOUT};

/// Configuration for the offline engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OfflineConfig {
    /// SQLite file; `None` keeps everything in memory for the session.
    pub database_path: Option<PathBuf>,
    /// Base URL relative endpoints are resolved against.
    pub base_url: Option<Url>,
    /// Failed attempts before a mutation becomes permanently failed.
    pub max_retries: u32,
    /// Time budget of each remote call.
    pub request_timeout: Duration,
    /// Backoff schedule for pass-level failures.
    pub pass_backoff: BackoffConfig,
    /// Entity-mirror tables created on initialize.
    pub entity_tables: Vec<TableName>,
    /// Run a pass right after initialize when the device is online.
    pub sync_on_start: bool,
    /// Buffer size of the event channel.
    pub event_capacity: usize,
}

impl OfflineConfig {
    /// Persist to a database file.
    pub fn with_database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.database_path = Some(path.into());
        self
    }

    pub fn with_base_url(mut self, url: Url) -> Self {
        self.base_url = Some(url);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_pass_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.pass_backoff = backoff;
        self
    }

    pub fn with_entity_tables(mut self, tables: Vec<TableName>) -> Self {
        self.entity_tables = tables;
        self
    }

    pub fn with_sync_on_start(mut self, sync_on_start: bool) -> Self {
        self.sync_on_start = sync_on_start;
        self
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_retries == 0 {
            return Err(Error::InvalidInput(
                "max_retries must be at least 1".to_string(),
            ));
        }
        if self.request_timeout.is_zero() {
            return Err(Error::InvalidInput(
                "request_timeout must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            base_url: None,
            max_retries: DEFAULT_MAX_RETRIES,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            pass_backoff: BackoffConfig::default(),
            entity_tables: Vec::new(),
            sync_on_start: true,
            event_capacity: 256,
        }
    }
}

/// Read-only snapshot for dashboards and diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OfflineStats {
    pub pending_mutations: u64,
    pub failed_mutations: u64,
    pub cached_responses: u64,
    /// Row count per entity-mirror table.
    pub entity_rows: BTreeMap<String, u64>,
    pub is_online: bool,
    /// `Syncing` while a pass holds the queue.
    pub phase: SyncPhase,
    pub last_successful_sync: Option<DateTime<Utc>>,
    /// Passes started since initialize.
    pub sync_passes: u64,
}

/// Everything that exists only between `initialize` and `cleanup`.
struct Components {
    store: LocalStore,
    queue: MutationQueue,
    cache: ResponseCache,
    coordinator: Arc<SyncCoordinator>,
    monitor: ConnectivityMonitor,
}

/// One engine per app session.
pub struct OfflineEngine {
    config: OfflineConfig,
    transport: Arc<dyn Transport>,
    reachability: Arc<dyn ReachabilitySource>,
    clock: Arc<dyn Clock>,
    state: Arc<SyncState>,
    events: broadcast::Sender<SyncEvent>,
    components: RwLock<Option<Arc<Components>>>,
}

/// Log a failed operation and turn it into `None`.
fn logged<T>(operation: &str, result: Result<T>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            error!("{} failed: {}", operation, e);
            None
        }
    }
}

fn table_name(table: &str) -> Option<TableName> {
    logged("Table name validation", TableName::new(table))
}

impl OfflineEngine {
    /// Create an engine. Nothing is opened until [`OfflineEngine::initialize`].
    pub fn new(
        config: OfflineConfig,
        transport: Arc<dyn Transport>,
        reachability: Arc<dyn ReachabilitySource>,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            config,
            transport,
            reachability,
            clock: Arc::new(SystemClock),
            state: Arc::new(SyncState::default()),
            events,
            components: RwLock::new(None),
        }
    }

    /// Create an engine that replays mutations over HTTP.
    pub fn with_http(
        config: OfflineConfig,
        reachability: Arc<dyn ReachabilitySource>,
    ) -> Result<Self> {
        let transport = HttpTransport::new(config.base_url.clone(), config.request_timeout)?;
        Ok(Self::new(config, Arc::new(transport), reachability))
    }

    /// Replace the time source (before `initialize`).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &OfflineConfig {
        &self.config
    }

    /// Open the store and start the connectivity monitor.
    ///
    /// Idempotent. Returns `false` if the configuration is invalid or the
    /// store cannot be opened; the engine then stays uninitialized and every
    /// other call is a logged no-op.
    pub async fn initialize(&self) -> bool {
        let mut components = self.components.write().await;
        if components.is_some() {
            debug!("Offline engine already initialized");
            return true;
        }

        match self.open_components().await {
            Ok(opened) => {
                let opened = Arc::new(opened);
                if self.config.sync_on_start && self.state.is_online() {
                    let coordinator = opened.coordinator.clone();
                    tokio::spawn(async move { coordinator.trigger().await });
                }
                *components = Some(opened);
                info!("Offline engine initialized (online: {})", self.state.is_online());
                true
            }
            Err(e) => {
                error!("Offline engine failed to initialize: {}", e);
                false
            }
        }
    }

    async fn open_components(&self) -> Result<Components> {
        self.config.validate()?;

        let store = match &self.config.database_path {
            Some(path) => LocalStore::open(path, self.clock.clone()).await?,
            None => LocalStore::in_memory(self.clock.clone()).await?,
        };
        for table in &self.config.entity_tables {
            store.ensure_entity_table(table).await?;
        }

        let queue = MutationQueue::new(store.clone(), self.config.max_retries);
        let cache = ResponseCache::new(store.clone());
        let coordinator = Arc::new(SyncCoordinator::new(
            queue.clone(),
            cache.clone(),
            self.transport.clone(),
            self.state.clone(),
            self.clock.clone(),
            CoordinatorConfig {
                request_timeout: self.config.request_timeout,
                backoff: self.config.pass_backoff.clone(),
            },
            self.events.clone(),
        ));
        let monitor = ConnectivityMonitor::start(
            self.reachability.as_ref(),
            self.state.clone(),
            coordinator.clone(),
        );

        Ok(Components {
            store,
            queue,
            cache,
            coordinator,
            monitor,
        })
    }

    async fn components(&self) -> Option<Arc<Components>> {
        let components = self.components.read().await.clone();
        if components.is_none() {
            warn!("Offline engine used while not initialized");
        }
        components
    }

    pub async fn is_initialized(&self) -> bool {
        self.components.read().await.is_some()
    }

    /// Mirror a record locally (full replace, status reset to pending).
    pub async fn store_data(&self, table: &str, id: &str, payload: serde_json::Value) -> bool {
        let (Some(c), Some(table)) = (self.components().await, table_name(table)) else {
            return false;
        };
        logged("store_data", c.store.upsert(&table, id, &payload).await).is_some()
    }

    /// One mirrored record, `None` if absent.
    pub async fn get_data(&self, table: &str, id: &str) -> Option<EntityRecord> {
        let c = self.components().await?;
        let table = table_name(table)?;
        logged("get_data", c.store.get(&table, id).await).flatten()
    }

    /// Every mirrored record of a table, newest first.
    pub async fn get_all_data(&self, table: &str) -> Option<Vec<EntityRecord>> {
        let c = self.components().await?;
        let table = table_name(table)?;
        logged("get_all_data", c.store.list(&table).await)
    }

    /// Delete a mirrored record. Returns whether it existed.
    pub async fn remove_data(&self, table: &str, id: &str) -> bool {
        let (Some(c), Some(table)) = (self.components().await, table_name(table)) else {
            return false;
        };
        logged("remove_data", c.store.delete(&table, id).await).unwrap_or(false)
    }

    /// Record the remote verdict for a mirrored record.
    pub async fn mark_data_status(&self, table: &str, id: &str, status: EntitySyncStatus) -> bool {
        let (Some(c), Some(table)) = (self.components().await, table_name(table)) else {
            return false;
        };
        logged("mark_data_status", c.store.set_status(&table, id, status).await).unwrap_or(false)
    }

    /// Queue a remote-bound write. Works offline.
    pub async fn queue_action(
        &self,
        endpoint: &str,
        method: HttpMethod,
        payload: serde_json::Value,
    ) -> Option<QueuedMutation> {
        let c = self.components().await?;
        logged("queue_action", c.queue.enqueue(endpoint, method, payload).await)
    }

    /// Ask for a sync pass. Redundant calls while a pass runs are ignored.
    ///
    /// Returns `None` only for a pass-level failure (a backoff retry is then
    /// scheduled).
    pub async fn sync_data(&self) -> Option<SyncOutcome> {
        let c = self.components().await?;
        logged("sync_data", c.coordinator.sync().await)
    }

    /// Mutations waiting to be sent, oldest first.
    pub async fn pending_actions(&self) -> Option<Vec<QueuedMutation>> {
        let c = self.components().await?;
        logged("pending_actions", c.queue.list_pending().await)
    }

    /// Mutations that exhausted their retries.
    pub async fn failed_actions(&self) -> Option<Vec<QueuedMutation>> {
        let c = self.components().await?;
        logged("failed_actions", c.queue.list_failed().await)
    }

    /// Give a permanently failed mutation a fresh retry budget.
    pub async fn retry_failed_action(&self, id: &MutationId) -> bool {
        let Some(c) = self.components().await else {
            return false;
        };
        logged("retry_failed_action", c.queue.retry_failed(id).await).unwrap_or(false)
    }

    /// Drop synced mutations from the queue table.
    pub async fn purge_synced_actions(&self) -> Option<usize> {
        let c = self.components().await?;
        logged("purge_synced_actions", c.queue.purge_synced().await)
    }

    /// Cache a response for `ttl_minutes`.
    pub async fn cache_response(&self, key: &str, value: &serde_json::Value, ttl_minutes: u32) -> bool {
        let Some(c) = self.components().await else {
            return false;
        };
        logged("cache_response", c.cache.put(key, value, ttl_minutes).await).is_some()
    }

    /// A fresh cached response, `None` on miss or expiry.
    pub async fn get_cached_response(&self, key: &str) -> Option<serde_json::Value> {
        let c = self.components().await?;
        logged("get_cached_response", c.cache.get(key).await).flatten()
    }

    pub async fn invalidate_cached_response(&self, key: &str) -> bool {
        let Some(c) = self.components().await else {
            return false;
        };
        logged("invalidate_cached_response", c.cache.invalidate(key).await).unwrap_or(false)
    }

    /// Delete expired cache rows. Returns how many were removed.
    pub async fn clear_expired_cache(&self) -> Option<usize> {
        let c = self.components().await?;
        logged("clear_expired_cache", c.cache.clear_expired().await)
    }

    /// Aggregate counters and flags.
    pub async fn get_offline_stats(&self) -> Option<OfflineStats> {
        let c = self.components().await?;
        logged("get_offline_stats", self.collect_stats(&c).await)
    }

    async fn collect_stats(&self, c: &Components) -> Result<OfflineStats> {
        let counts = c.queue.count_by_status().await?;
        Ok(OfflineStats {
            pending_mutations: counts.get(&MutationStatus::Pending).copied().unwrap_or(0),
            failed_mutations: counts
                .get(&MutationStatus::FailedPermanently)
                .copied()
                .unwrap_or(0),
            cached_responses: c.cache.len().await?,
            entity_rows: c.store.entity_row_counts().await?,
            is_online: self.state.is_online(),
            phase: self.state.phase(),
            last_successful_sync: self.state.last_successful_sync(),
            sync_passes: c.coordinator.passes_started(),
        })
    }

    /// Subscribe to pass completions and permanent failures.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn is_online(&self) -> bool {
        self.state.is_online()
    }

    pub fn is_syncing(&self) -> bool {
        self.state.is_syncing()
    }

    /// Stop listening for connectivity, cancel retries and close the store.
    ///
    /// Safe to call more than once. The engine can be initialized again later.
    pub async fn cleanup(&self) {
        let Some(c) = self.components.write().await.take() else {
            debug!("Offline engine already cleaned up");
            return;
        };

        c.monitor.stop();
        c.coordinator.shutdown();
        if let Err(e) = c.store.close().await {
            error!("Failed to close local store: {}", e);
        }
        info!("Offline engine cleaned up");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectivity::ManualReachability;
    use crate::transport::{MockReply, MockTransport};
    use chrono::Duration as ChronoDuration;
    use offsync_storage::ManualClock;
    use serde_json::json;
    use tempfile::tempdir;

    struct Fixture {
        engine: OfflineEngine,
        transport: Arc<MockTransport>,
        reachability: Arc<ManualReachability>,
        clock: Arc<ManualClock>,
    }

    fn fixture(config: OfflineConfig, online: bool) -> Fixture {
        let transport = Arc::new(MockTransport::new());
        let reachability = Arc::new(ManualReachability::new(online));
        let clock = Arc::new(ManualClock::default());
        let engine = OfflineEngine::new(
            config.with_sync_on_start(false),
            transport.clone(),
            reachability.clone(),
        )
        .with_clock(clock.clone());

        Fixture {
            engine,
            transport,
            reachability,
            clock,
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let f = fixture(OfflineConfig::default(), true);
        assert!(!f.engine.is_initialized().await);

        assert!(f.engine.initialize().await);
        assert!(f.engine.initialize().await);
        assert!(f.engine.is_initialized().await);
        assert_eq!(f.reachability.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_initialize_reports_storage_failure() {
        let temp_dir = tempdir().unwrap();
        let blocker = temp_dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"x").unwrap();

        let config = OfflineConfig::default().with_database_path(blocker.join("offline.db"));
        let f = fixture(config, true);

        assert!(!f.engine.initialize().await);
        assert!(!f.engine.is_initialized().await);
        assert!(f.engine.queue_action("/a", HttpMethod::Post, json!({})).await.is_none());
    }

    #[tokio::test]
    async fn test_initialize_rejects_zero_retry_budget() {
        let f = fixture(OfflineConfig::default().with_max_retries(0), true);

        assert!(!f.engine.initialize().await);
        assert!(!f.engine.is_initialized().await);
        assert_eq!(f.reachability.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_calls_before_initialize_degrade() {
        let f = fixture(OfflineConfig::default(), true);

        assert!(!f.engine.store_data("drivers", "d-1", json!({})).await);
        assert!(f.engine.get_data("drivers", "d-1").await.is_none());
        assert!(f.engine.sync_data().await.is_none());
        assert!(!f.engine.cache_response("k", &json!(1), 1).await);
        assert!(f.engine.get_offline_stats().await.is_none());
        f.engine.cleanup().await;
    }

    #[tokio::test]
    async fn test_entity_passthrough() {
        let config = OfflineConfig::default()
            .with_entity_tables(vec![TableName::new("notifications").unwrap()]);
        let f = fixture(config, true);
        assert!(f.engine.initialize().await);

        assert!(f.engine.store_data("drivers", "d-1", json!({"name": "Ana"})).await);
        assert!(f.engine.store_data("drivers", "d-2", json!({"name": "Ben"})).await);
        assert!(!f.engine.store_data("bad table", "x", json!({})).await);

        let record = f.engine.get_data("drivers", "d-1").await.unwrap();
        assert_eq!(record.payload, json!({"name": "Ana"}));
        assert!(f.engine.get_data("drivers", "nope").await.is_none());
        assert_eq!(f.engine.get_all_data("drivers").await.unwrap().len(), 2);

        assert!(
            f.engine
                .mark_data_status("drivers", "d-1", EntitySyncStatus::Synced)
                .await
        );
        assert!(f.engine.remove_data("drivers", "d-2").await);

        let stats = f.engine.get_offline_stats().await.unwrap();
        assert_eq!(stats.entity_rows.get("drivers"), Some(&1));
        assert_eq!(stats.entity_rows.get("notifications"), Some(&0));
    }

    #[tokio::test]
    async fn test_queue_survives_restart() {
        let temp_dir = tempdir().unwrap();
        let config = OfflineConfig::default()
            .with_database_path(temp_dir.path().join("offline.db"))
            .with_max_retries(1);

        let first = fixture(config.clone(), true);
        assert!(first.engine.initialize().await);
        first.transport.set_reply("/rejected", MockReply::Status(422));
        first.engine.queue_action("/rejected", HttpMethod::Put, json!({"n": 0})).await.unwrap();
        first.engine.sync_data().await.unwrap();

        first.reachability.set_connected(false);
        wait_until(|| !first.engine.is_online()).await;
        first.engine.queue_action("/a", HttpMethod::Post, json!({"n": 1})).await.unwrap();
        first.engine.queue_action("/b", HttpMethod::Patch, json!({"n": 2})).await.unwrap();
        assert_eq!(first.engine.sync_data().await, Some(SyncOutcome::Offline));

        let pending_before = first.engine.pending_actions().await.unwrap();
        let failed_before = first.engine.failed_actions().await.unwrap();
        first.engine.cleanup().await;

        let second = fixture(config, false);
        assert!(second.engine.initialize().await);
        let pending_after = second.engine.pending_actions().await.unwrap();
        let failed_after = second.engine.failed_actions().await.unwrap();

        assert_eq!(pending_after, pending_before);
        assert_eq!(pending_after.len(), 2);
        assert!(pending_after.iter().all(|m| m.retry_count == 0 && m.is_pending()));

        assert_eq!(failed_after, failed_before);
        assert_eq!(failed_after.len(), 1);
        assert_eq!(failed_after[0].status, MutationStatus::FailedPermanently);
        assert_eq!(failed_after[0].retry_count, 1);
    }

    #[tokio::test]
    async fn test_connectivity_edges_trigger_one_pass() {
        let f = fixture(OfflineConfig::default(), true);
        assert!(f.engine.initialize().await);
        f.engine.queue_action("/a", HttpMethod::Post, json!({})).await.unwrap();

        f.reachability.set_connected(true);
        f.reachability.set_connected(true);
        f.reachability.set_connected(false);
        wait_until(|| !f.engine.is_online()).await;
        f.reachability.set_connected(true);

        wait_until(|| f.transport.call_count() == 1).await;
        wait_until(|| !f.engine.is_syncing()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let stats = f.engine.get_offline_stats().await.unwrap();
        assert_eq!(stats.sync_passes, 1);
        assert_eq!(stats.pending_mutations, 0);
        assert!(stats.is_online);
    }

    #[tokio::test]
    async fn test_offline_queue_then_reconnect_drains() {
        let f = fixture(OfflineConfig::default(), false);
        assert!(f.engine.initialize().await);
        assert!(!f.engine.is_online());

        for endpoint in ["/a", "/b", "/c"] {
            f.engine.queue_action(endpoint, HttpMethod::Post, json!({})).await.unwrap();
        }
        assert_eq!(f.engine.sync_data().await, Some(SyncOutcome::Offline));
        assert_eq!(f.transport.call_count(), 0);

        f.reachability.set_connected(true);
        wait_until(|| f.transport.call_count() == 3).await;
        assert_eq!(f.transport.calls(), vec!["/a", "/b", "/c"]);
    }

    #[tokio::test]
    async fn test_sync_data_is_mutually_exclusive() {
        let f = fixture(OfflineConfig::default(), true);
        assert!(f.engine.initialize().await);
        f.engine.queue_action("/slow", HttpMethod::Put, json!({})).await.unwrap();
        f.transport.set_delay(Duration::from_millis(100));

        let (first, second) = tokio::join!(f.engine.sync_data(), f.engine.sync_data());
        let outcomes = [first.unwrap(), second.unwrap()];

        assert!(outcomes.contains(&SyncOutcome::AlreadyRunning));
        assert_eq!(f.transport.call_count(), 1);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_surfaced() {
        let f = fixture(OfflineConfig::default().with_max_retries(2), true);
        assert!(f.engine.initialize().await);
        let mut events = f.engine.subscribe();
        f.transport.set_default_reply(MockReply::Status(422));

        let m = f.engine.queue_action("/reject", HttpMethod::Post, json!({})).await.unwrap();
        f.engine.sync_data().await.unwrap();
        f.engine.sync_data().await.unwrap();

        let failed = f.engine.failed_actions().await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].retry_count, 2);

        let mut surfaced = false;
        while let Ok(event) = events.try_recv() {
            if let SyncEvent::MutationFailedPermanently(mutation) = event {
                surfaced = mutation.id == m.id;
            }
        }
        assert!(surfaced);

        // Manual retry after the endpoint recovers.
        f.transport.set_default_reply(MockReply::Status(201));
        assert!(f.engine.retry_failed_action(&m.id).await);
        f.engine.sync_data().await.unwrap();
        assert!(f.engine.failed_actions().await.unwrap().is_empty());
        assert_eq!(f.engine.purge_synced_actions().await, Some(1));
    }

    #[tokio::test]
    async fn test_cache_passthrough_respects_ttl() {
        let f = fixture(OfflineConfig::default(), true);
        assert!(f.engine.initialize().await);

        assert!(f.engine.cache_response("report:q1", &json!({"rows": 3}), 1).await);
        assert!(f.engine.cache_response("report:q2", &json!({"rows": 4}), 10).await);
        assert_eq!(
            f.engine.get_cached_response("report:q1").await,
            Some(json!({"rows": 3}))
        );

        f.clock.advance(ChronoDuration::minutes(1));
        assert!(f.engine.get_cached_response("report:q1").await.is_none());
        assert_eq!(f.engine.clear_expired_cache().await, Some(1));
        assert!(f.engine.get_cached_response("report:q2").await.is_some());

        assert!(f.engine.invalidate_cached_response("report:q2").await);
        assert_eq!(f.engine.get_offline_stats().await.unwrap().cached_responses, 0);
    }

    #[tokio::test]
    async fn test_stats_snapshot() {
        let f = fixture(OfflineConfig::default(), true);
        assert!(f.engine.initialize().await);
        f.transport.set_reply("/bad", MockReply::Status(500));

        f.engine.queue_action("/ok", HttpMethod::Post, json!({})).await.unwrap();
        f.engine.queue_action("/bad", HttpMethod::Post, json!({})).await.unwrap();
        f.engine.sync_data().await.unwrap();

        let stats = f.engine.get_offline_stats().await.unwrap();
        assert_eq!(stats.pending_mutations, 1);
        assert_eq!(stats.failed_mutations, 0);
        assert_eq!(stats.phase, SyncPhase::Idle);
        assert_eq!(stats.last_successful_sync, Some(f.clock.now()));
        assert_eq!(stats.sync_passes, 1);
    }

    #[tokio::test]
    async fn test_cleanup_releases_resources() {
        let f = fixture(OfflineConfig::default(), true);
        assert!(f.engine.initialize().await);
        assert_eq!(f.reachability.subscriber_count(), 1);

        f.engine.cleanup().await;
        f.engine.cleanup().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(!f.engine.is_initialized().await);
        assert_eq!(f.reachability.subscriber_count(), 0);
        assert!(f.engine.queue_action("/a", HttpMethod::Post, json!({})).await.is_none());

        // A fresh session can start again.
        assert!(f.engine.initialize().await);
    }

    #[tokio::test]
    async fn test_sync_on_start_drains_backlog() {
        let temp_dir = tempdir().unwrap();
        let config = OfflineConfig::default().with_database_path(temp_dir.path().join("offline.db"));

        let offline = fixture(config.clone(), false);
        assert!(offline.engine.initialize().await);
        offline.engine.queue_action("/a", HttpMethod::Post, json!({})).await.unwrap();
        offline.engine.cleanup().await;

        let transport = Arc::new(MockTransport::new());
        let engine = OfflineEngine::new(
            config.with_sync_on_start(true),
            transport.clone(),
            Arc::new(ManualReachability::new(true)),
        );
        assert!(engine.initialize().await);

        wait_until(|| transport.call_count() == 1).await;
        wait_until(|| !engine.is_syncing()).await;
        assert!(engine.pending_actions().await.unwrap().is_empty());
    }
}
