//! Observable sync status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use offsync_common::types::duration_ms;
use offsync_common::ActionId;

/// Phase of the sync state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPhase {
    /// Not draining.
    #[default]
    Idle,
    /// A drain is in progress.
    Syncing,
    /// At least one delivery failed during the last drain, whether the
    /// action was dropped or left queued for retry.
    Error,
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncPhase::Idle => "idle",
            SyncPhase::Syncing => "syncing",
            SyncPhase::Error => "error",
        };
        f.write_str(s)
    }
}

/// Why an action was dropped from the queue undelivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// The server refused the request.
    Rejected { message: String },
    /// The attempt ceiling was reached.
    Exhausted { attempts: u32, last_error: String },
    /// The queue could not record the outcome.
    Storage { message: String },
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Rejected { message } => write!(f, "rejected: {}", message),
            FailureReason::Exhausted {
                attempts,
                last_error,
            } => write!(f, "gave up after {} attempts: {}", attempts, last_error),
            FailureReason::Storage { message } => write!(f, "storage failure: {}", message),
        }
    }
}

/// An action that failed during a drain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedAction {
    pub id: ActionId,
    pub action_name: String,
    pub endpoint: String,
    pub reason: FailureReason,
}

/// Result of one drain of the queue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncOutcome {
    /// Actions delivered and removed.
    pub succeeded: usize,
    /// Actions dropped or not recorded (see `failures`).
    pub failed: usize,
    /// Actions that failed transiently and stay queued.
    pub retried: usize,
    /// Queue length after the drain.
    pub remaining: usize,
    pub failures: Vec<FailedAction>,
    /// The drain stopped because the device went offline.
    pub aborted_offline: bool,
    #[serde(with = "duration_ms", rename = "duration_ms")]
    pub duration: Duration,
}

impl SyncOutcome {
    /// Whether every attempted action was delivered.
    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.retried == 0
    }
}

/// Process-wide sync status, published to subscribers on every change.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub phase: SyncPhase,
    /// Pending actions in the queue.
    pub queue_length: usize,
    /// When the last drain finished.
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_result: Option<SyncOutcome>,
}

impl SyncStatus {
    /// Whether actions are waiting for delivery.
    pub fn is_pending(&self) -> bool {
        self.queue_length > 0
    }

    /// Whether the last drain dropped actions.
    pub fn has_failures(&self) -> bool {
        self.last_result
            .as_ref()
            .is_some_and(|outcome| !outcome.failures.is_empty())
    }
}
