//! Durable queue of mutations awaiting delivery.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use offsync_cache::CacheSnapshot;
use offsync_common::{ActionId, Clock, Error, HttpMethod, Priority, Result};
use offsync_storage::{store_json, StorageBackend};

/// Name of the persisted queue blob.
pub const ACTION_QUEUE_KEY: &str = "actionQueue";

/// Where an unreadable queue blob is moved aside on open.
pub const CORRUPT_QUEUE_KEY: &str = "actionQueue-corrupt";

/// A mutation waiting to be delivered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedAction {
    /// Unique ID for this action.
    pub id: ActionId,
    /// Insertion counter, breaks ties between equal timestamps.
    pub sequence: u64,
    /// Caller-supplied label (e.g. "create-sale").
    pub action_name: String,
    pub endpoint: String,
    pub method: HttpMethod,
    /// Forwarded verbatim to the transport.
    pub payload: Value,
    pub priority: Priority,
    /// Failed delivery attempts so far.
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Not eligible for delivery before this instant.
    #[serde(default)]
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// Cache keys invalidated once the server accepts the action.
    #[serde(default)]
    pub invalidates: Vec<String>,
    /// Cache state to put back if the action is dropped undelivered.
    #[serde(default)]
    pub rollback: Option<CacheSnapshot>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl QueuedAction {
    /// Delivery order: priority band, then enqueue time, then insertion order.
    pub fn order_key(&self) -> (u8, DateTime<Utc>, u64) {
        (self.priority.rank(), self.enqueued_at, self.sequence)
    }

    /// Whether the backoff window has passed.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at.is_none_or(|at| at <= now)
    }
}

/// Description of a mutation to enqueue.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAction {
    pub action_name: String,
    pub endpoint: String,
    pub method: HttpMethod,
    pub payload: Value,
    pub priority: Priority,
    pub invalidates: Vec<String>,
    pub rollback: Option<CacheSnapshot>,
}

impl NewAction {
    /// Create a medium-priority action.
    pub fn new(
        action_name: impl Into<String>,
        method: HttpMethod,
        endpoint: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            action_name: action_name.into(),
            endpoint: endpoint.into(),
            method,
            payload,
            priority: Priority::default(),
            invalidates: Vec::new(),
            rollback: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Cache keys to invalidate after successful delivery.
    pub fn invalidating<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.invalidates.extend(keys.into_iter().map(Into::into));
        self
    }

    /// Cache state to restore if the action is dropped undelivered.
    pub fn with_rollback(mut self, snapshot: CacheSnapshot) -> Self {
        self.rollback = Some(snapshot);
        self
    }
}

struct QueueState {
    /// Always sorted by `QueuedAction::order_key`.
    actions: Vec<QueuedAction>,
    next_sequence: u64,
}

/// Persistent, priority-ordered queue of pending mutations.
///
/// Every mutation is written to the backend before the call returns, so an
/// acknowledged enqueue survives a process restart. Actions leave the queue
/// only through [`remove`](Self::remove).
pub struct ActionQueue {
    state: RwLock<QueueState>,
    backend: Arc<dyn StorageBackend>,
    clock: Arc<dyn Clock>,
}

impl ActionQueue {
    /// Open the queue, loading any actions persisted by a previous run.
    ///
    /// An unreadable blob is moved aside to [`CORRUPT_QUEUE_KEY`] and the
    /// queue starts empty.
    pub async fn open(backend: Arc<dyn StorageBackend>, clock: Arc<dyn Clock>) -> Result<Self> {
        let mut actions: Vec<QueuedAction> = match backend.load(ACTION_QUEUE_KEY).await? {
            Some(bytes) => match serde_json::from_slice(&bytes) {
                Ok(actions) => actions,
                Err(e) => {
                    error!("Action queue is unreadable, moving it aside: {}", e);
                    backend.store(CORRUPT_QUEUE_KEY, bytes).await?;
                    Vec::new()
                }
            },
            None => Vec::new(),
        };
        actions.sort_by_key(QueuedAction::order_key);

        let next_sequence = actions.iter().map(|a| a.sequence + 1).max().unwrap_or(0);

        info!(
            "Opened action queue with {} pending actions ({} backend)",
            actions.len(),
            backend.name()
        );

        Ok(Self {
            state: RwLock::new(QueueState {
                actions,
                next_sequence,
            }),
            backend,
            clock,
        })
    }

    /// Append an action and persist it before returning its ID.
    pub async fn enqueue(
        &self,
        action_name: impl Into<String>,
        endpoint: impl Into<String>,
        method: HttpMethod,
        payload: Value,
        priority: Priority,
    ) -> Result<ActionId> {
        let action = NewAction::new(action_name, method, endpoint, payload).with_priority(priority);
        self.enqueue_action(action).await
    }

    /// Append a fully described action and persist it before returning its ID.
    ///
    /// # Errors
    /// - Empty action name or endpoint
    /// - Persistence failure; the action is not queued in that case
    pub async fn enqueue_action(&self, new: NewAction) -> Result<ActionId> {
        if new.action_name.trim().is_empty() {
            return Err(Error::InvalidInput("Action name cannot be empty".to_string()));
        }
        if new.endpoint.trim().is_empty() {
            return Err(Error::InvalidInput("Endpoint cannot be empty".to_string()));
        }

        let mut state = self.state.write().await;
        let action = QueuedAction {
            id: ActionId::generate(),
            sequence: state.next_sequence,
            action_name: new.action_name,
            endpoint: new.endpoint,
            method: new.method,
            payload: new.payload,
            priority: new.priority,
            attempts: 0,
            enqueued_at: self.clock.now(),
            last_attempt_at: None,
            next_attempt_at: None,
            invalidates: new.invalidates,
            rollback: new.rollback,
            last_error: None,
        };
        let id = action.id.clone();

        let position = state
            .actions
            .partition_point(|a| a.order_key() <= action.order_key());
        state.actions.insert(position, action);

        if let Err(e) = self.persist(&state.actions).await {
            state.actions.remove(position);
            return Err(e);
        }
        state.next_sequence += 1;

        debug!("Queued action {} at position {}", id, position);
        Ok(id)
    }

    /// Peek at the next action in delivery order without removing it.
    pub async fn dequeue_next(&self) -> Option<QueuedAction> {
        self.state.read().await.actions.first().cloned()
    }

    /// Peek at the first action that is past its backoff window and not in `skip`.
    pub async fn next_ready(
        &self,
        now: DateTime<Utc>,
        skip: &HashSet<ActionId>,
    ) -> Option<QueuedAction> {
        self.state
            .read()
            .await
            .actions
            .iter()
            .find(|a| a.is_ready(now) && !skip.contains(&a.id))
            .cloned()
    }

    /// Get an action by ID.
    pub async fn get(&self, id: &ActionId) -> Option<QueuedAction> {
        self.state
            .read()
            .await
            .actions
            .iter()
            .find(|a| &a.id == id)
            .cloned()
    }

    /// Remove an action after delivery or when giving up on it.
    ///
    /// Returns the removed action, or `None` if it was not queued.
    pub async fn remove(&self, id: &ActionId) -> Result<Option<QueuedAction>> {
        let mut state = self.state.write().await;
        let Some(position) = state.actions.iter().position(|a| &a.id == id) else {
            return Ok(None);
        };

        let removed = state.actions.remove(position);
        if let Err(e) = self.persist(&state.actions).await {
            state.actions.insert(position, removed);
            return Err(e);
        }
        Ok(Some(removed))
    }

    /// Record a failed delivery attempt.
    ///
    /// The action becomes eligible again `retry_after` from now. Returns the
    /// new attempt count.
    pub async fn increment_attempt(
        &self,
        id: &ActionId,
        error: impl Into<String>,
        retry_after: Duration,
    ) -> Result<u32> {
        let now = self.clock.now();
        let mut state = self.state.write().await;
        let action = state
            .actions
            .iter_mut()
            .find(|a| &a.id == id)
            .ok_or_else(|| Error::NotFound(format!("Queued action not found: {}", id)))?;

        let previous = action.clone();
        action.attempts += 1;
        action.last_attempt_at = Some(now);
        let delay = chrono::Duration::from_std(retry_after).unwrap_or(chrono::Duration::MAX);
        action.next_attempt_at = Some(
            now.checked_add_signed(delay)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        );
        action.last_error = Some(error.into());
        let attempts = action.attempts;

        if let Err(e) = self.persist(&state.actions).await {
            if let Some(action) = state.actions.iter_mut().find(|a| &a.id == id) {
                *action = previous;
            }
            return Err(e);
        }
        Ok(attempts)
    }

    /// Whether any queued action carries a rollback snapshot for `key`.
    pub async fn has_rollback_for(&self, key: &str) -> bool {
        self.state
            .read()
            .await
            .actions
            .iter()
            .any(|a| a.rollback.as_ref().is_some_and(|s| s.key() == key))
    }

    /// All pending actions in delivery order.
    pub async fn pending(&self) -> Vec<QueuedAction> {
        self.state.read().await.actions.clone()
    }

    /// Number of pending actions.
    pub async fn size(&self) -> usize {
        self.state.read().await.actions.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.actions.is_empty()
    }

    /// Drop every pending action. Returns how many were dropped.
    pub async fn clear(&self) -> Result<usize> {
        let mut state = self.state.write().await;
        let count = state.actions.len();
        if count == 0 {
            return Ok(0);
        }
        let dropped = std::mem::take(&mut state.actions);
        if let Err(e) = self.persist(&[]).await {
            state.actions = dropped;
            return Err(e);
        }
        warn!("Dropped {} pending actions", count);
        Ok(count)
    }

    /// Persist the queue. Called with the write lock held.
    async fn persist(&self, actions: &[QueuedAction]) -> Result<()> {
        store_json(self.backend.as_ref(), ACTION_QUEUE_KEY, actions).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use offsync_common::ManualClock;
    use offsync_storage::{LocalBackend, MemoryBackend};
    use proptest::prelude::*;
    use serde_json::json;
    use tempfile::TempDir;

    async fn open_queue() -> (ActionQueue, ManualClock, MemoryBackend) {
        let clock = ManualClock::default();
        let backend = MemoryBackend::new();
        let queue = ActionQueue::open(Arc::new(backend.clone()), Arc::new(clock.clone()))
            .await
            .unwrap();
        (queue, clock, backend)
    }

    #[tokio::test]
    async fn test_enqueue_and_peek() {
        let (queue, _clock, _backend) = open_queue().await;
        assert!(queue.dequeue_next().await.is_none());

        let id = queue
            .enqueue("create-sale", "/sales", HttpMethod::Post, json!({"total": 10}), Priority::Medium)
            .await
            .unwrap();

        let next = queue.dequeue_next().await.unwrap();
        assert_eq!(next.id, id);
        assert_eq!(next.attempts, 0);
        assert_eq!(next.payload, json!({"total": 10}));
        // Peek does not remove.
        assert_eq!(queue.size().await, 1);
    }

    #[tokio::test]
    async fn test_high_priority_served_before_older_low() {
        let (queue, clock, _backend) = open_queue().await;

        let a = queue
            .enqueue("a", "/a", HttpMethod::Post, Value::Null, Priority::Low)
            .await
            .unwrap();
        clock.advance(Duration::from_millis(1));
        let b = queue
            .enqueue("b", "/b", HttpMethod::Post, Value::Null, Priority::High)
            .await
            .unwrap();

        assert_eq!(queue.dequeue_next().await.unwrap().id, b);
        queue.remove(&b).await.unwrap();
        assert_eq!(queue.dequeue_next().await.unwrap().id, a);
    }

    #[tokio::test]
    async fn test_fifo_within_band_with_equal_timestamps() {
        let (queue, _clock, _backend) = open_queue().await;
        let mut ids = Vec::new();
        for i in 0..5 {
            ids.push(
                queue
                    .enqueue(format!("a{}", i), "/x", HttpMethod::Put, json!(i), Priority::Medium)
                    .await
                    .unwrap(),
            );
        }

        let pending: Vec<ActionId> = queue.pending().await.into_iter().map(|a| a.id).collect();
        assert_eq!(pending, ids);
    }

    #[tokio::test]
    async fn test_rejects_empty_fields() {
        let (queue, _clock, _backend) = open_queue().await;
        let result = queue
            .enqueue("", "/x", HttpMethod::Post, Value::Null, Priority::Low)
            .await;
        assert!(matches!(result, Err(Error::InvalidInput(_))));
        let result = queue
            .enqueue("name", " ", HttpMethod::Post, Value::Null, Priority::Low)
            .await;
        assert!(matches!(result, Err(Error::InvalidInput(_))));
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_increment_attempt_sets_backoff() {
        let (queue, clock, _backend) = open_queue().await;
        let id = queue
            .enqueue("a", "/a", HttpMethod::Delete, Value::Null, Priority::High)
            .await
            .unwrap();

        let attempts = queue
            .increment_attempt(&id, "connection reset", Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(attempts, 1);

        let action = queue.get(&id).await.unwrap();
        assert_eq!(action.last_attempt_at, Some(clock.now()));
        assert_eq!(action.last_error.as_deref(), Some("connection reset"));

        let skip = HashSet::new();
        assert!(queue.next_ready(clock.now(), &skip).await.is_none());
        clock.advance(Duration::from_secs(10));
        assert_eq!(queue.next_ready(clock.now(), &skip).await.unwrap().id, id);
    }

    #[tokio::test]
    async fn test_next_ready_honours_skip_set() {
        let (queue, clock, _backend) = open_queue().await;
        let first = queue
            .enqueue("a", "/a", HttpMethod::Post, Value::Null, Priority::High)
            .await
            .unwrap();
        let second = queue
            .enqueue("b", "/b", HttpMethod::Post, Value::Null, Priority::High)
            .await
            .unwrap();

        let mut skip = HashSet::new();
        skip.insert(first);
        assert_eq!(queue.next_ready(clock.now(), &skip).await.unwrap().id, second);
    }

    #[tokio::test]
    async fn test_increment_unknown_fails() {
        let (queue, _clock, _backend) = open_queue().await;
        let id = ActionId::new("missing").unwrap();
        let result = queue.increment_attempt(&id, "x", Duration::ZERO).await;
        assert!(matches!(result, Err(Error::NotFound(_))));
        assert!(queue.remove(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let (queue, clock, backend) = open_queue().await;
        let low = queue
            .enqueue("low", "/l", HttpMethod::Post, Value::Null, Priority::Low)
            .await
            .unwrap();
        let high = queue
            .enqueue("high", "/h", HttpMethod::Post, Value::Null, Priority::High)
            .await
            .unwrap();
        drop(queue);

        let reopened = ActionQueue::open(Arc::new(backend), Arc::new(clock))
            .await
            .unwrap();
        let ids: Vec<ActionId> = reopened.pending().await.into_iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![high, low]);

        // Sequence numbers continue after reload.
        let next = reopened
            .enqueue("later", "/x", HttpMethod::Post, Value::Null, Priority::Low)
            .await
            .unwrap();
        assert_eq!(reopened.get(&next).await.unwrap().sequence, 2);
    }

    #[tokio::test]
    async fn test_local_backend_persistence() {
        let temp = TempDir::new().unwrap();
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::default());
        {
            let backend = Arc::new(LocalBackend::new(temp.path()).unwrap());
            let queue = ActionQueue::open(backend, clock.clone()).await.unwrap();
            queue
                .enqueue("create-expense", "/expenses", HttpMethod::Post, json!({"amount": 5}), Priority::Medium)
                .await
                .unwrap();
        }

        let backend = Arc::new(LocalBackend::new(temp.path()).unwrap());
        let queue = ActionQueue::open(backend, clock).await.unwrap();
        let action = queue.dequeue_next().await.unwrap();
        assert_eq!(action.action_name, "create-expense");
        assert_eq!(action.payload, json!({"amount": 5}));
    }

    #[tokio::test]
    async fn test_corrupt_blob_moved_aside() {
        let backend = MemoryBackend::new();
        backend.store(ACTION_QUEUE_KEY, b"[{oops".to_vec()).await.unwrap();

        let queue = ActionQueue::open(Arc::new(backend.clone()), Arc::new(ManualClock::default()))
            .await
            .unwrap();
        assert!(queue.is_empty().await);
        assert_eq!(
            backend.load(CORRUPT_QUEUE_KEY).await.unwrap(),
            Some(b"[{oops".to_vec())
        );
    }

    #[tokio::test]
    async fn test_clear() {
        let (queue, _clock, backend) = open_queue().await;
        queue
            .enqueue("a", "/a", HttpMethod::Post, Value::Null, Priority::Low)
            .await
            .unwrap();
        assert_eq!(queue.clear().await.unwrap(), 1);
        assert_eq!(queue.clear().await.unwrap(), 0);

        let stored: Vec<QueuedAction> =
            offsync_storage::load_json(&backend, ACTION_QUEUE_KEY).await.unwrap().unwrap();
        assert!(stored.is_empty());
    }

    fn priority_strategy() -> impl Strategy<Value = Priority> {
        prop_oneof![Just(Priority::High), Just(Priority::Medium), Just(Priority::Low)]
    }

    proptest! {
        #[test]
        fn prop_dequeue_returns_smallest_order_key(
            ops in prop::collection::vec((priority_strategy(), 0u64..50), 1..30)
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            runtime.block_on(async {
                let clock = ManualClock::default();
                let start = clock.now();
                let queue = ActionQueue::open(Arc::new(MemoryBackend::new()), Arc::new(clock.clone()))
                    .await
                    .unwrap();

                for (priority, offset_ms) in &ops {
                    clock.set(start + chrono::Duration::milliseconds(*offset_ms as i64));
                    queue
                        .enqueue("op", "/op", HttpMethod::Post, Value::Null, *priority)
                        .await
                        .unwrap();
                }

                let mut previous: Option<(u8, DateTime<Utc>, u64)> = None;
                while let Some(next) = queue.dequeue_next().await {
                    let pending = queue.pending().await;
                    let smallest = pending.iter().map(QueuedAction::order_key).min().unwrap();
                    assert_eq!(next.order_key(), smallest);
                    if let Some(prev) = previous {
                        assert!(prev < next.order_key());
                    }
                    previous = Some(next.order_key());
                    queue.remove(&next.id).await.unwrap();
                }
            });
        }
    }
}
