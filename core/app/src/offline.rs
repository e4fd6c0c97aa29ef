//! Application facade over the cache, queue and sync engine.

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use offsync_cache::{CacheStats, CacheStore, CachedValue};
use offsync_common::{
    ActionId, Clock, Error, HttpMethod, Priority, Result, Subscription, SystemClock,
};
use offsync_storage::StorageBackend;
use offsync_sync::{
    ActionQueue, ApplyOutcome, BackoffStrategy, DeliveryResult, HttpTransport, NetworkMonitor,
    NewAction, OptimisticUpdateCoordinator, QueuedAction, SyncEngine, SyncOutcome, SyncScheduler,
    SyncStatus, SyncTrigger, Transport,
};

use crate::config::CoreConfig;

/// Builder for [`OfflineCore`].
pub struct OfflineCoreBuilder {
    config: CoreConfig,
    transport: Option<Arc<dyn Transport>>,
    backend: Option<Arc<dyn StorageBackend>>,
    clock: Arc<dyn Clock>,
    backoff: Option<Arc<dyn BackoffStrategy>>,
    online: bool,
}

impl OfflineCoreBuilder {
    fn new(config: CoreConfig) -> Self {
        Self {
            config,
            transport: None,
            backend: None,
            clock: Arc::new(SystemClock),
            backoff: None,
            online: true,
        }
    }

    /// Use this transport instead of building one from `transport.base_url`.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Use this backend instead of resolving `storage.backend`.
    pub fn backend(mut self, backend: Arc<dyn StorageBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Override the backoff built from `sync.retry`.
    pub fn backoff<B: BackoffStrategy + 'static>(mut self, backoff: B) -> Self {
        self.backoff = Some(Arc::new(backoff));
        self
    }

    /// Connectivity assumed until the platform reports otherwise.
    pub fn online(mut self, online: bool) -> Self {
        self.online = online;
        self
    }

    /// Open storage, load persisted state and start the sync scheduler.
    ///
    /// Must be called inside a tokio runtime.
    ///
    /// # Errors
    /// - Invalid configuration
    /// - No transport given and no `transport.base_url` configured
    /// - Storage backend cannot be opened
    pub async fn init(self) -> Result<OfflineCore> {
        let config = self.config;
        config.validate()?;

        let transport = match self.transport {
            Some(transport) => transport,
            None => {
                let base_url = config.transport.base_url.clone().ok_or_else(|| {
                    Error::Config("No transport configured, set transport.base_url".to_string())
                })?;
                Arc::new(HttpTransport::new(base_url, config.sync.request_timeout)?)
            }
        };

        let backend = match self.backend {
            Some(backend) => backend,
            None => config.open_backend()?,
        };

        let queue = Arc::new(ActionQueue::open(backend.clone(), self.clock.clone()).await?);
        let cache = if config.cache.persist {
            CacheStore::open(backend.clone(), self.clock.clone()).await?
        } else {
            CacheStore::in_memory(self.clock.clone())
        };
        let network = Arc::new(NetworkMonitor::with_initial(self.online));

        let mut engine = SyncEngine::new(
            queue,
            Arc::new(cache),
            network.clone(),
            transport.clone(),
            config.sync.clone(),
        )
        .with_clock(self.clock);
        if let Some(backoff) = self.backoff {
            engine = engine.with_backoff(move |attempt: u32| backoff.delay_for_attempt(attempt));
        }
        let engine = Arc::new(engine);
        engine.refresh_status().await;

        let optimistic =
            OptimisticUpdateCoordinator::new(engine.clone(), config.cache.optimistic_ttl);

        let (scheduler, handle) = SyncScheduler::new();
        let network_watch = scheduler.watch_network(&network);
        let scheduler_task = tokio::spawn(handle.run_engine(engine.clone()));

        info!(
            "Offline core ready ({} storage, {} transport, {} pending)",
            backend.name(),
            transport.name(),
            engine.status().queue_length
        );

        Ok(OfflineCore {
            config,
            engine,
            optimistic,
            scheduler,
            scheduler_task: Some(scheduler_task),
            _network_watch: network_watch,
        })
    }
}

/// Offline-first data layer for an application.
///
/// Reads go through the cache, writes go through the queue, and queued writes
/// are delivered when connectivity returns, when the app comes to the
/// foreground, or on request.
pub struct OfflineCore {
    config: CoreConfig,
    engine: Arc<SyncEngine>,
    optimistic: OptimisticUpdateCoordinator,
    scheduler: SyncScheduler,
    scheduler_task: Option<JoinHandle<()>>,
    _network_watch: Subscription,
}

impl OfflineCore {
    /// Start configuring a core.
    pub fn builder(config: CoreConfig) -> OfflineCoreBuilder {
        OfflineCoreBuilder::new(config)
    }

    /// Initialize with an explicit transport and default everything else.
    pub async fn init(config: CoreConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        Self::builder(config).transport(transport).init().await
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// The underlying sync engine.
    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    fn cache(&self) -> &Arc<CacheStore> {
        self.engine.cache()
    }

    // Network

    pub fn network_status(&self) -> bool {
        self.engine.network().is_online()
    }

    #[must_use = "dropping the subscription unsubscribes the listener"]
    pub fn on_network_change<F>(&self, listener: F) -> Subscription
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        self.engine.network().subscribe(listener)
    }

    /// Feed the platform connectivity signal. Coming online schedules a drain.
    pub fn set_network_status(&self, online: bool) -> bool {
        self.engine.network().set_online(online)
    }

    /// Feed a best-effort signal; `None` counts as online.
    pub fn report_network(&self, signal: Option<bool>) -> bool {
        self.engine.network().report(signal)
    }

    // Queue and sync

    /// Queue a mutation for delivery.
    pub async fn queue(
        &self,
        action_name: impl Into<String>,
        endpoint: impl Into<String>,
        method: HttpMethod,
        payload: Value,
        priority: Priority,
    ) -> Result<ActionId> {
        let action = NewAction::new(action_name, method, endpoint, payload).with_priority(priority);
        self.queue_action(action).await
    }

    /// Queue a fully described mutation.
    pub async fn queue_action(&self, action: NewAction) -> Result<ActionId> {
        self.engine.queue_action(action).await
    }

    /// Pending mutations in delivery order.
    pub async fn pending_actions(&self) -> Vec<QueuedAction> {
        self.engine.queue().pending().await
    }

    /// Drain the queue now. `None` if a drain was already running.
    pub async fn sync_all(&self) -> Option<SyncOutcome> {
        self.engine.sync_all().await
    }

    /// Ask the scheduler for a drain and wait for it.
    pub async fn request_sync(&self) -> Result<Option<SyncOutcome>> {
        self.scheduler.request_sync().await
    }

    pub fn sync_status(&self) -> SyncStatus {
        self.engine.status()
    }

    #[must_use = "dropping the subscription unsubscribes the listener"]
    pub fn on_sync_status_change<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&SyncStatus) + Send + Sync + 'static,
    {
        self.engine.subscribe(listener)
    }

    // Cache

    /// Cached value for `key` if younger than `max_age`.
    pub async fn get_cache(&self, key: &str, max_age: Duration) -> Option<Value> {
        self.cache().get(key, max_age).await
    }

    /// Typed variant of [`get_cache`](Self::get_cache).
    pub async fn get_cache_as<T: DeserializeOwned>(&self, key: &str, max_age: Duration) -> Option<T> {
        self.cache().get_as(key, max_age).await
    }

    /// Cached value regardless of age, flagged stale past its ttl.
    pub async fn get_cache_entry(&self, key: &str) -> Option<CachedValue> {
        self.cache().get_entry(key).await
    }

    /// Store a value. `ttl` defaults to `cache.default_ttl`.
    pub async fn save_cache(
        &self,
        key: impl Into<String>,
        value: Value,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let ttl = ttl.unwrap_or(self.config.cache.default_ttl);
        self.cache().set(key, value, ttl).await
    }

    pub async fn remove_cache(&self, key: &str) -> Result<bool> {
        self.cache().remove(key).await
    }

    pub async fn clear_all_cache(&self) -> Result<()> {
        self.cache().clear().await
    }

    pub async fn cache_stats(&self) -> CacheStats {
        self.cache().stats().await
    }

    /// Drop entries older than `max_age`.
    pub async fn purge_cache(&self, max_age: Duration) -> Result<usize> {
        self.cache().purge_expired(max_age).await
    }

    /// Optimistically update `cache_key`; see [`OptimisticUpdateCoordinator::apply`].
    pub async fn apply_optimistic<U, R, Fut>(
        &self,
        cache_key: &str,
        updater: U,
        remote_call: R,
        queue_spec: NewAction,
    ) -> Result<ApplyOutcome>
    where
        U: FnOnce(Option<&Value>) -> Value,
        R: FnOnce() -> Fut,
        Fut: Future<Output = DeliveryResult<Option<Value>>>,
    {
        self.optimistic
            .apply(cache_key, updater, remote_call, queue_spec)
            .await
    }

    // Lifecycle

    /// The app moved to the background.
    pub fn on_background(&self) {
        debug!("App moved to background");
        self.engine.reset_status();
    }

    /// The app returned to the foreground; schedules a drain.
    pub fn on_foreground(&self) {
        debug!("App returned to foreground");
        self.engine.reset_status();
        if !self.scheduler.notify(SyncTrigger::Foreground) {
            warn!("Sync scheduler is not running");
        }
    }

    /// Stop the scheduler, waiting for a drain in flight to finish.
    ///
    /// Persisted state stays on the backend for the next `init`.
    pub async fn dispose(mut self) {
        self.scheduler.shutdown();
        if let Some(task) = self.scheduler_task.take() {
            if let Err(e) = task.await {
                warn!("Sync scheduler task failed: {}", e);
            }
        }
        info!("Offline core disposed");
    }
}
