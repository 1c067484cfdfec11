// src/network.rs

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tracing::debug;

/// Connectivity as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkStatus {
    pub online: bool,
    /// Wi-Fi or any other connection the user has not marked as metered.
    pub unmetered: bool,
}

impl NetworkStatus {
    pub const OFFLINE: NetworkStatus = NetworkStatus { online: false, unmetered: false };
    pub const METERED: NetworkStatus = NetworkStatus { online: true, unmetered: false };
    pub const UNMETERED: NetworkStatus = NetworkStatus { online: true, unmetered: true };
}

pub type NetworkListener = Arc<dyn Fn(NetworkStatus) + Send + Sync>;

/// Source of connectivity information and change notifications.
pub trait NetworkMonitor: Send + Sync {
    fn is_online(&self) -> bool;
    fn is_unmetered(&self) -> bool;
    /// Registers `listener` for connectivity changes until the returned
    /// subscription is dropped or unsubscribed.
    fn subscribe(&self, listener: NetworkListener) -> Subscription;
}

/// Keeps a registration alive; dropping it unregisters.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

type ListenerList = Mutex<Vec<(u64, NetworkListener)>>;

/// A monitor whose state is pushed in by the host, e.g. from platform
/// connectivity callbacks.
pub struct ManualNetworkMonitor {
    status: Mutex<NetworkStatus>,
    listeners: Arc<ListenerList>,
    next_id: AtomicU64,
}

impl ManualNetworkMonitor {
    pub fn new(status: NetworkStatus) -> Self {
        Self {
            status: Mutex::new(status),
            listeners: Arc::new(Mutex::new(Vec::new())),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn status(&self) -> NetworkStatus {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Updates the status and notifies listeners if it changed.
    pub fn set_status(&self, status: NetworkStatus) {
        {
            let mut current = self.status.lock().unwrap_or_else(PoisonError::into_inner);
            if *current == status {
                return;
            }
            *current = status;
        }
        debug!(online = status.online, unmetered = status.unmetered, "network status changed");
        let listeners: Vec<NetworkListener> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in listeners {
            listener(status);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl NetworkMonitor for ManualNetworkMonitor {
    fn is_online(&self) -> bool {
        self.status().online
    }

    fn is_unmetered(&self) -> bool {
        self.status().unmetered
    }

    fn subscribe(&self, listener: NetworkListener) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, listener));

        let listeners: Weak<ListenerList> = Arc::downgrade(&self.listeners);
        Subscription::new(move || {
            if let Some(listeners) = listeners.upgrade() {
                listeners
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .retain(|(other, _)| *other != id);
            }
        })
    }
}

/// Decides whether transfers may run right now.
pub struct NetworkGate {
    monitor: Arc<dyn NetworkMonitor>,
    require_unmetered: AtomicBool,
}

impl NetworkGate {
    pub fn new(monitor: Arc<dyn NetworkMonitor>, require_unmetered: bool) -> Self {
        Self {
            monitor,
            require_unmetered: AtomicBool::new(require_unmetered),
        }
    }

    /// Evaluated fresh on every call.
    pub fn may_transfer(&self) -> bool {
        if !self.monitor.is_online() {
            return false;
        }
        !self.require_unmetered() || self.monitor.is_unmetered()
    }

    pub fn require_unmetered(&self) -> bool {
        self.require_unmetered.load(Ordering::SeqCst)
    }

    pub fn set_require_unmetered(&self, required: bool) {
        self.require_unmetered.store(required, Ordering::SeqCst);
    }

    /// Change notifications are only a hint to re-check `may_transfer`.
    pub fn on_change(&self, listener: NetworkListener) -> Subscription {
        self.monitor.subscribe(listener)
    }
}
