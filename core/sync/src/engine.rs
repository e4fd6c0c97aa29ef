//! Queue drain state machine.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use offsync_cache::CacheStore;
use offsync_common::types::duration_ms;
use offsync_common::{ActionId, Clock, DeliveryError, EventBus, Result, Subscription, SystemClock};

use crate::network::NetworkMonitor;
use crate::queue::{ActionQueue, NewAction, QueuedAction};
use crate::retry::{BackoffStrategy, RetryConfig};
use crate::status::{FailedAction, FailureReason, SyncOutcome, SyncPhase, SyncStatus};
use crate::transport::{ActionRequest, Transport};

/// Configuration for the sync engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Delivery attempts before a transiently failing action is dropped.
    pub max_attempts: u32,
    /// Upper bound on a single transport call.
    #[serde(with = "duration_ms", rename = "request_timeout_ms")]
    pub request_timeout: Duration,
    /// Backoff between drain cycles.
    pub retry: RetryConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            request_timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
        }
    }
}

/// Delivers queued actions to the server.
///
/// Phases move `idle -> syncing -> {idle, error}`. At most one drain runs at
/// a time; a [`sync_all`](Self::sync_all) issued while another is in flight
/// returns `None` immediately instead of starting a second drain.
pub struct SyncEngine {
    queue: Arc<ActionQueue>,
    cache: Arc<CacheStore>,
    network: Arc<NetworkMonitor>,
    transport: Arc<dyn Transport>,
    backoff: Arc<dyn BackoffStrategy>,
    clock: Arc<dyn Clock>,
    config: SyncConfig,
    status: RwLock<SyncStatus>,
    draining: AtomicBool,
    events: EventBus<SyncStatus>,
}

impl SyncEngine {
    /// Create an engine. Backoff follows `config.retry`.
    pub fn new(
        queue: Arc<ActionQueue>,
        cache: Arc<CacheStore>,
        network: Arc<NetworkMonitor>,
        transport: Arc<dyn Transport>,
        config: SyncConfig,
    ) -> Self {
        let backoff: Arc<dyn BackoffStrategy> = Arc::new(config.retry.clone());
        Self {
            queue,
            cache,
            network,
            transport,
            backoff,
            clock: Arc::new(SystemClock),
            config,
            status: RwLock::new(SyncStatus::default()),
            draining: AtomicBool::new(false),
            events: EventBus::new(),
        }
    }

    /// Replace the backoff strategy.
    pub fn with_backoff<B: BackoffStrategy + 'static>(mut self, backoff: B) -> Self {
        self.backoff = Arc::new(backoff);
        self
    }

    /// Replace the time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn queue(&self) -> &Arc<ActionQueue> {
        &self.queue
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    pub fn network(&self) -> &Arc<NetworkMonitor> {
        &self.network
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Current status snapshot.
    pub fn status(&self) -> SyncStatus {
        self.status.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Whether a drain is in flight.
    pub fn is_syncing(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Listen for status changes.
    #[must_use = "dropping the subscription unsubscribes the listener"]
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&SyncStatus) + Send + Sync + 'static,
    {
        self.events.subscribe(listener)
    }

    /// Enqueue an action and publish the new queue length.
    ///
    /// Delivery is not attempted here; it happens on the next drain.
    pub async fn queue_action(&self, action: NewAction) -> Result<ActionId> {
        let id = self.queue.enqueue_action(action).await?;
        self.refresh_status().await;
        Ok(id)
    }

    /// Re-read the queue length and publish it.
    pub async fn refresh_status(&self) {
        let queue_length = self.queue.size().await;
        self.update_status(|status| status.queue_length = queue_length);
    }

    /// Return to idle after an app lifecycle transition. The queue is untouched.
    ///
    /// A drain in flight keeps its `syncing` phase.
    pub fn reset_status(&self) {
        if self.is_syncing() {
            debug!("Drain in progress, keeping sync phase");
            return;
        }
        self.update_status(|status| status.phase = SyncPhase::Idle);
    }

    /// Drain the queue once.
    ///
    /// Returns `None` when another drain was already running. Never fails:
    /// delivery and persistence problems are recorded in the outcome and in
    /// [`SyncStatus::last_result`].
    pub async fn sync_all(&self) -> Option<SyncOutcome> {
        if self
            .draining
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Sync already in progress, coalescing request");
            return None;
        }
        let _guard = DrainGuard { engine: self };

        Some(self.drain().await)
    }

    async fn drain(&self) -> SyncOutcome {
        let started = Instant::now();
        let mut outcome = SyncOutcome::default();
        // Each action is attempted at most once per drain.
        let mut attempted: HashSet<ActionId> = HashSet::new();

        self.update_status(|status| status.phase = SyncPhase::Syncing);
        let pending = self.queue.size().await;
        info!("Starting sync ({} pending)", pending);

        loop {
            let Some(action) = self.queue.next_ready(self.clock.now(), &attempted).await else {
                break;
            };

            if !self.network.is_online() {
                info!("Network lost, aborting sync");
                outcome.aborted_offline = true;
                break;
            }

            attempted.insert(action.id.clone());
            self.deliver(&action, &mut outcome).await;

            let queue_length = self.queue.size().await;
            self.update_status(|status| status.queue_length = queue_length);
        }

        outcome.remaining = self.queue.size().await;
        outcome.duration = started.elapsed();

        let phase = if outcome.failed > 0 || outcome.retried > 0 {
            SyncPhase::Error
        } else {
            SyncPhase::Idle
        };

        info!(
            "Sync finished: {} delivered, {} failed, {} retrying, {} remaining",
            outcome.succeeded, outcome.failed, outcome.retried, outcome.remaining
        );

        let now = self.clock.now();
        let result = outcome.clone();
        self.update_status(move |status| {
            status.phase = phase;
            status.queue_length = result.remaining;
            status.last_sync_at = Some(now);
            status.last_result = Some(result);
        });

        outcome
    }

    async fn deliver(&self, action: &QueuedAction, outcome: &mut SyncOutcome) {
        let request = ActionRequest::from(action);
        debug!("Delivering {} ({} {})", action.id, request.method, request.endpoint);

        let result = match tokio::time::timeout(
            self.config.request_timeout,
            self.transport.send(&request),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(DeliveryError::Timeout(
                self.config.request_timeout.as_millis() as u64,
            )),
        };

        match result {
            Ok(_) => self.on_delivered(action, outcome).await,
            Err(e) if e.is_retryable() => self.on_transient_failure(action, e, outcome).await,
            Err(e) => {
                warn!("Action {} rejected: {}", action.id, e);
                let reason = FailureReason::Rejected {
                    message: e.to_string(),
                };
                self.drop_action(action, reason, outcome).await;
            }
        }
    }

    async fn on_delivered(&self, action: &QueuedAction, outcome: &mut SyncOutcome) {
        match self.queue.remove(&action.id).await {
            Ok(_) => {
                outcome.succeeded += 1;
                debug!("Delivered {}", action.id);
            }
            Err(e) => {
                // The server has the action; it will be delivered again after restart.
                error!("Delivered {} but could not remove it from the queue: {}", action.id, e);
                record_failure(outcome, action, FailureReason::Storage {
                    message: e.to_string(),
                });
                return;
            }
        }

        if !action.invalidates.is_empty() {
            if let Err(e) = self.cache.invalidate(action.invalidates.as_slice()).await {
                warn!("Failed to invalidate cache after {}: {}", action.id, e);
            }
        }
    }

    async fn on_transient_failure(
        &self,
        action: &QueuedAction,
        failure: DeliveryError,
        outcome: &mut SyncOutcome,
    ) {
        let message = failure.to_string();
        let retry_after = self.backoff.delay_for_attempt(action.attempts + 1);

        let attempts = match self
            .queue
            .increment_attempt(&action.id, message.clone(), retry_after)
            .await
        {
            Ok(attempts) => attempts,
            Err(e) => {
                error!("Failed to record attempt for {}: {}", action.id, e);
                record_failure(outcome, action, FailureReason::Storage {
                    message: e.to_string(),
                });
                return;
            }
        };

        if attempts < self.config.max_attempts {
            warn!(
                "Delivery of {} failed (attempt {}/{}), retrying in {:?}: {}",
                action.id, attempts, self.config.max_attempts, retry_after, message
            );
            outcome.retried += 1;
            return;
        }

        warn!("Giving up on {} after {} attempts: {}", action.id, attempts, message);
        let reason = FailureReason::Exhausted {
            attempts,
            last_error: message,
        };
        self.drop_action(action, reason, outcome).await;
    }

    /// Remove an action that will never be delivered and revert its optimistic write.
    ///
    /// When the removal cannot be persisted the action stays queued and the
    /// cache is left alone, so the two keep agreeing.
    async fn drop_action(&self, action: &QueuedAction, reason: FailureReason, outcome: &mut SyncOutcome) {
        if let Err(e) = self.queue.remove(&action.id).await {
            error!("Failed to drop {} ({}) from the queue: {}", action.id, reason, e);
            record_failure(outcome, action, FailureReason::Storage {
                message: e.to_string(),
            });
            return;
        }
        record_failure(outcome, action, reason);

        let Some(snapshot) = action.rollback.clone() else {
            return;
        };
        // A later queued write to the same key owns the optimistic value now.
        if self.queue.has_rollback_for(snapshot.key()).await {
            debug!("Keeping cache entry {}, another write is pending", snapshot.key());
            return;
        }
        let key = snapshot.key().to_string();
        match self.cache.restore(snapshot).await {
            Ok(()) => info!("Reverted cache entry {} after dropping {}", key, action.id),
            Err(e) => warn!("Failed to revert cache entry {}: {}", key, e),
        }
    }

    fn update_status<F: FnOnce(&mut SyncStatus)>(&self, change: F) {
        let snapshot = {
            let mut status = self.status.write().unwrap_or_else(|e| e.into_inner());
            change(&mut status);
            status.clone()
        };
        self.events.publish(&snapshot);
    }
}

fn record_failure(outcome: &mut SyncOutcome, action: &QueuedAction, reason: FailureReason) {
    outcome.failed += 1;
    outcome.failures.push(FailedAction {
        id: action.id.clone(),
        action_name: action.action_name.clone(),
        endpoint: action.endpoint.clone(),
        reason,
    });
}

/// Releases the single-flight flag, also when the drain future is dropped.
struct DrainGuard<'a> {
    engine: &'a SyncEngine,
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        let cancelled = self.engine.status().phase == SyncPhase::Syncing;
        if cancelled {
            warn!("Sync was cancelled before it finished");
            self.engine.update_status(|status| status.phase = SyncPhase::Idle);
        }
        self.engine.draining.store(false, Ordering::SeqCst);
    }
}
