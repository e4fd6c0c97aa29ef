//! Connectivity tracking.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::{debug, info};

use offsync_common::{EventBus, Subscription};

/// Current online/offline state plus transition notifications.
///
/// The platform connectivity signal is best-effort. Until a signal arrives,
/// and whenever the platform cannot tell, the monitor reports online so that
/// delivery is never blocked forever.
#[derive(Debug)]
pub struct NetworkMonitor {
    online: AtomicBool,
    /// Held across the state change and its notification so that listeners
    /// see transitions in the order they were applied.
    transition: Mutex<()>,
    transitions: EventBus<bool>,
}

impl NetworkMonitor {
    /// Create a monitor that starts online.
    pub fn new() -> Self {
        Self::with_initial(true)
    }

    /// Create a monitor with a known initial state.
    pub fn with_initial(online: bool) -> Self {
        Self {
            online: AtomicBool::new(online),
            transition: Mutex::new(()),
            transitions: EventBus::new(),
        }
    }

    /// Last known state. Never blocks.
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Record the platform's connectivity state.
    ///
    /// Subscribers are notified once per transition; repeating the current
    /// state is silent. Returns whether the state changed. Listeners must not
    /// call back into `set_online` or `report`.
    pub fn set_online(&self, online: bool) -> bool {
        let _transition = self.transition.lock().unwrap_or_else(|e| e.into_inner());
        let previous = self.online.swap(online, Ordering::SeqCst);
        if previous == online {
            return false;
        }

        if online {
            info!("Network restored");
        } else {
            info!("Network lost, switching to offline mode");
        }
        self.transitions.publish(&online);
        true
    }

    /// Record a possibly missing platform signal. `None` counts as online.
    pub fn report(&self, signal: Option<bool>) -> bool {
        match signal {
            Some(online) => self.set_online(online),
            None => {
                debug!("No connectivity signal, assuming online");
                self.set_online(true)
            }
        }
    }

    /// Listen for transitions. The listener receives the new state.
    #[must_use = "dropping the subscription unsubscribes the listener"]
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        self.transitions.subscribe(move |online| listener(*online))
    }
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new()
    }
}
