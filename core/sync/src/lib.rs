//! Offline sync engine
//!
//! This module provides delivery of locally recorded mutations, including:
//! - Connectivity tracking with fail-open defaults
//! - A persistent, priority-ordered action queue
//! - Single-flight queue drains with backoff between cycles
//! - Event-driven scheduling (network restored, foreground, manual)
//! - Optimistic cache updates with rollback

pub mod engine;
pub mod network;
pub mod optimistic;
pub mod queue;
pub mod retry;
pub mod scheduler;
pub mod status;
pub mod transport;

// Re-export main types
pub use engine::{SyncConfig, SyncEngine};
pub use network::NetworkMonitor;
pub use optimistic::{ApplyOutcome, OptimisticUpdateCoordinator};
pub use queue::{ActionQueue, NewAction, QueuedAction, ACTION_QUEUE_KEY, CORRUPT_QUEUE_KEY};
pub use retry::{BackoffStrategy, NoBackoff, RetryConfig};
pub use scheduler::{SyncScheduler, SyncSchedulerHandle, SyncTrigger};
pub use status::{FailedAction, FailureReason, SyncOutcome, SyncPhase, SyncStatus};
pub use transport::{
    classify_status, ActionRequest, DeliveryResult, HttpTransport, ScriptedTransport, Transport,
};
