//! Optimistic writes: update the cache first, confirm with the server after.

use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use offsync_cache::CacheSnapshot;
use offsync_common::{ActionId, DeliveryError, Error, Result};

use crate::engine::SyncEngine;
use crate::queue::NewAction;
use crate::transport::DeliveryResult;

/// What happened to an optimistic write.
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    /// The server accepted the change.
    Confirmed { response: Option<Value> },
    /// The device is offline; the change is queued and may still fail later.
    Pending { action_id: ActionId },
}

impl ApplyOutcome {
    pub fn is_confirmed(&self) -> bool {
        matches!(self, ApplyOutcome::Confirmed { .. })
    }
}

/// Applies a change locally before the server has confirmed it.
pub struct OptimisticUpdateCoordinator {
    engine: Arc<SyncEngine>,
    ttl: Duration,
}

impl OptimisticUpdateCoordinator {
    /// Create a coordinator writing optimistic values with `ttl`.
    pub fn new(engine: Arc<SyncEngine>, ttl: Duration) -> Self {
        Self { engine, ttl }
    }

    /// Update `cache_key` immediately and reconcile with the server.
    ///
    /// `updater` receives the current cached value (regardless of freshness)
    /// and returns the optimistic one. Online, `remote_call` runs under the
    /// engine's request timeout; a server response replaces the optimistic
    /// value. Offline, `queue_spec` is enqueued with the previous value
    /// attached, so dropping the action later reverts the cache.
    ///
    /// # Errors
    /// - `Error::Delivery` when the online call fails; the cache is reverted first
    /// - Queue or cache persistence failures; the cache is reverted first
    pub async fn apply<U, R, Fut>(
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
        let cache = self.engine.cache();
        let previous = cache.snapshot(cache_key).await;
        let optimistic = updater(previous.value());
        cache.set(cache_key, optimistic, self.ttl).await?;

        if !self.engine.network().is_online() {
            let action = queue_spec.with_rollback(previous.clone());
            return match self.engine.queue_action(action).await {
                Ok(action_id) => {
                    info!("Offline, queued {} as {}", cache_key, action_id);
                    Ok(ApplyOutcome::Pending { action_id })
                }
                Err(e) => {
                    self.revert(previous).await;
                    Err(e)
                }
            };
        }

        let timeout = self.engine.config().request_timeout;
        let result = match tokio::time::timeout(timeout, remote_call()).await {
            Ok(result) => result,
            Err(_) => Err(DeliveryError::Timeout(timeout.as_millis() as u64)),
        };

        match result {
            Ok(response) => {
                if let Some(value) = &response {
                    if let Err(e) = cache.set(cache_key, value.clone(), self.ttl).await {
                        warn!("Failed to cache server response for {}: {}", cache_key, e);
                    }
                }
                debug!("Confirmed optimistic write to {}", cache_key);
                Ok(ApplyOutcome::Confirmed { response })
            }
            Err(e) => {
                warn!("Optimistic write to {} failed, reverting: {}", cache_key, e);
                self.revert(previous).await;
                Err(Error::Delivery(e))
            }
        }
    }

    async fn revert(&self, previous: CacheSnapshot) {
        let key = previous.key().to_string();
        if let Err(e) = self.engine.cache().restore(previous).await {
            error!("Failed to revert cache entry {}: {}", key, e);
        }
    }
}
