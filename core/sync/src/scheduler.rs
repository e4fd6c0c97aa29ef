//! Sync scheduling driven by events.
//!
//! Drains run when something happens (connectivity restored, app brought to
//! the foreground, explicit request), never on a timer.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use offsync_common::{Error, Result, Subscription};

use crate::engine::SyncEngine;
use crate::network::NetworkMonitor;
use crate::status::SyncOutcome;

/// Why a drain was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    /// Explicit request from the application.
    Manual,
    /// The device came back online.
    NetworkRestored,
    /// The app returned to the foreground.
    Foreground,
    /// Stop the scheduler.
    Shutdown,
}

impl fmt::Display for SyncTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncTrigger::Manual => "manual",
            SyncTrigger::NetworkRestored => "network restored",
            SyncTrigger::Foreground => "foreground",
            SyncTrigger::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

type Reply = Option<oneshot::Sender<Option<SyncOutcome>>>;

/// Sender side of the scheduler. Cheap to clone.
#[derive(Clone)]
pub struct SyncScheduler {
    /// Channel to send sync requests.
    request_tx: mpsc::Sender<(SyncTrigger, Reply)>,
    shutdown: Arc<AtomicBool>,
}

impl SyncScheduler {
    /// Create a scheduler and the handle that runs it.
    pub fn new() -> (Self, SyncSchedulerHandle) {
        let (request_tx, request_rx) = mpsc::channel(64);
        let shutdown = Arc::new(AtomicBool::new(false));

        let scheduler = Self {
            request_tx,
            shutdown: shutdown.clone(),
        };
        let handle = SyncSchedulerHandle {
            request_rx,
            shutdown,
        };

        (scheduler, handle)
    }

    /// Request a drain and wait for its outcome.
    ///
    /// Requests that arrive while a drain is pending share its outcome.
    ///
    /// # Errors
    /// - `Error::NotRunning` if the scheduler task has stopped
    pub async fn request_sync(&self) -> Result<Option<SyncOutcome>> {
        if self.is_shut_down() {
            return Err(Error::NotRunning("Sync scheduler has shut down".to_string()));
        }
        let (response_tx, response_rx) = oneshot::channel();

        self.request_tx
            .send((SyncTrigger::Manual, Some(response_tx)))
            .await
            .map_err(|_| Error::NotRunning("Sync scheduler not running".to_string()))?;

        response_rx
            .await
            .map_err(|_| Error::NotRunning("Sync scheduler stopped before replying".to_string()))
    }

    /// Fire-and-forget trigger. Returns whether it was accepted.
    ///
    /// A full channel already holds a pending drain, so dropping the trigger
    /// loses nothing.
    pub fn notify(&self, trigger: SyncTrigger) -> bool {
        if self.is_shut_down() {
            return false;
        }
        match self.request_tx.try_send((trigger, None)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("Sync already pending, dropping {} trigger", trigger);
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Trigger a drain on every offline-to-online transition.
    #[must_use = "dropping the subscription stops watching the network"]
    pub fn watch_network(&self, monitor: &NetworkMonitor) -> Subscription {
        let scheduler = self.clone();
        monitor.subscribe(move |online| {
            if online {
                scheduler.notify(SyncTrigger::NetworkRestored);
            }
        })
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Shutdown the scheduler. Triggers already queued are still served.
    ///
    /// The shutdown message only wakes an idle loop. When the channel is
    /// full the loop is busy anyway and stops on the flag after its batch.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(mpsc::error::TrySendError::Full(_)) =
            self.request_tx.try_send((SyncTrigger::Shutdown, None))
        {
            debug!("Scheduler channel full, stopping after the pending batch");
        }
    }
}

/// Handle for the scheduler background task.
pub struct SyncSchedulerHandle {
    request_rx: mpsc::Receiver<(SyncTrigger, Reply)>,
    shutdown: Arc<AtomicBool>,
}

impl SyncSchedulerHandle {
    /// Run the scheduler loop.
    ///
    /// This should be spawned in a tokio task. `sync_fn` is called once per
    /// batch of triggers that piled up while the previous drain ran.
    pub async fn run<F, Fut>(mut self, sync_fn: F)
    where
        F: Fn(SyncTrigger) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<SyncOutcome>> + Send,
    {
        info!("Sync scheduler started");

        loop {
            // After shutdown, serve what is already queued without waiting for more.
            let next = if self.shutdown.load(Ordering::SeqCst) {
                self.request_rx.try_recv().ok()
            } else {
                self.request_rx.recv().await
            };
            let Some((trigger, reply)) = next else {
                break;
            };
            if trigger == SyncTrigger::Shutdown {
                break;
            }

            let mut waiters: Vec<oneshot::Sender<Option<SyncOutcome>>> = reply.into_iter().collect();
            let mut stop = false;
            let mut coalesced = 0usize;
            while let Ok((next, reply)) = self.request_rx.try_recv() {
                if next == SyncTrigger::Shutdown {
                    stop = true;
                    continue;
                }
                coalesced += 1;
                waiters.extend(reply);
            }

            debug!("Processing {} trigger ({} coalesced)", trigger, coalesced);
            let outcome = sync_fn(trigger).await;
            for waiter in waiters {
                let _ = waiter.send(outcome.clone());
            }

            if stop {
                break;
            }
        }

        self.shutdown.store(true, Ordering::SeqCst);
        info!("Sync scheduler shutting down");
    }

    /// Run the scheduler against a sync engine.
    pub async fn run_engine(self, engine: Arc<SyncEngine>) {
        self.run(move |_trigger| {
            let engine = engine.clone();
            async move { engine.sync_all().await }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex;

    fn counting(
        count: Arc<AtomicU32>,
        seen: Arc<Mutex<Vec<SyncTrigger>>>,
    ) -> impl Fn(SyncTrigger) -> std::future::Ready<Option<SyncOutcome>> + Send + Sync + 'static {
        move |trigger| {
            count.fetch_add(1, Ordering::SeqCst);
            seen.lock().unwrap().push(trigger);
            std::future::ready(Some(SyncOutcome {
                succeeded: 1,
                ..Default::default()
            }))
        }
    }

    #[tokio::test]
    async fn test_sync_request() {
        let (scheduler, handle) = SyncScheduler::new();

        let sync_count = Arc::new(AtomicU32::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));

        // Spawn the scheduler task
        let handle_task = tokio::spawn(handle.run(counting(sync_count.clone(), seen.clone())));

        let result = scheduler.request_sync().await.unwrap();
        assert_eq!(result.unwrap().succeeded, 1);
        assert_eq!(sync_count.load(Ordering::SeqCst), 1);

        scheduler.shutdown();
        handle_task.await.unwrap();
        assert!(matches!(
            scheduler.request_sync().await,
            Err(Error::NotRunning(_))
        ));
        assert!(!scheduler.notify(SyncTrigger::Manual));
    }

    #[tokio::test]
    async fn test_pending_triggers_coalesce() {
        let (scheduler, handle) = SyncScheduler::new();
        assert!(scheduler.notify(SyncTrigger::Foreground));
        assert!(scheduler.notify(SyncTrigger::Manual));
        assert!(scheduler.notify(SyncTrigger::NetworkRestored));
        scheduler.shutdown();

        let sync_count = Arc::new(AtomicU32::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));
        handle.run(counting(sync_count.clone(), seen.clone())).await;

        assert_eq!(sync_count.load(Ordering::SeqCst), 1);
        assert_eq!(*seen.lock().unwrap(), vec![SyncTrigger::Foreground]);
    }

    #[tokio::test]
    async fn test_network_restored_triggers_sync() {
        let (scheduler, handle) = SyncScheduler::new();
        let monitor = NetworkMonitor::with_initial(false);
        let _watch = scheduler.watch_network(&monitor);

        monitor.set_online(true);
        monitor.set_online(false);
        scheduler.shutdown();

        let sync_count = Arc::new(AtomicU32::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));
        handle.run(counting(sync_count.clone(), seen.clone())).await;

        assert_eq!(*seen.lock().unwrap(), vec![SyncTrigger::NetworkRestored]);
    }

    #[tokio::test]
    async fn test_shutdown_with_nothing_pending() {
        let (scheduler, handle) = SyncScheduler::new();
        scheduler.shutdown();
        scheduler.shutdown();

        let sync_count = Arc::new(AtomicU32::new(0));
        handle
            .run(counting(sync_count.clone(), Arc::new(Mutex::new(Vec::new()))))
            .await;
        assert_eq!(sync_count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_shutdown_with_full_channel() {
        let (scheduler, handle) = SyncScheduler::new();
        for _ in 0..64 {
            assert!(scheduler.notify(SyncTrigger::Foreground));
        }
        scheduler.shutdown();

        let sync_count = Arc::new(AtomicU32::new(0));
        let run = handle.run(counting(sync_count.clone(), Arc::new(Mutex::new(Vec::new()))));
        tokio::time::timeout(std::time::Duration::from_secs(2), run)
            .await
            .expect("scheduler did not stop");

        assert_eq!(sync_count.load(Ordering::SeqCst), 1);
    }
}
