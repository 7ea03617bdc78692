//! Connectivity state
//!
//! An explicit online/offline flag shared by the sync manager and the
//! application. The platform's network signal feeds `set_online`; the UI
//! watches it through a `watch` receiver or a callback listener.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tracing::info;

/// Handle returned by [`Connectivity::on_change`]
pub type ListenerId = u64;

type Listener = Arc<dyn Fn(bool) + Send + Sync>;

/// Shared online/offline flag; clones observe the same state
#[derive(Clone)]
pub struct Connectivity {
    inner: Arc<Inner>,
}

struct Inner {
    online: watch::Sender<bool>,
    listeners: Mutex<Vec<(ListenerId, Listener)>>,
    next_id: AtomicU64,
}

impl Connectivity {
    pub fn new(online: bool) -> Self {
        let (online, _) = watch::channel(online);
        Self {
            inner: Arc::new(Inner {
                online,
                listeners: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn is_online(&self) -> bool {
        *self.inner.online.borrow()
    }

    /// Update the flag and return the previous value
    ///
    /// Listeners run only when the value actually changes.
    pub fn set_online(&self, online: bool) -> bool {
        let previous = self.inner.online.send_replace(online);
        if previous != online {
            info!(
                "Connectivity changed: {}",
                if online { "online" } else { "offline" }
            );
            let listeners: Vec<Listener> = match self.inner.listeners.lock() {
                Ok(guard) => guard.iter().map(|(_, l)| Arc::clone(l)).collect(),
                Err(poisoned) => poisoned
                    .into_inner()
                    .iter()
                    .map(|(_, l)| Arc::clone(l))
                    .collect(),
            };
            // Called outside the lock so a listener may (un)register others
            for listener in listeners {
                listener(online);
            }
        }
        previous
    }

    /// Receiver that always holds the latest value
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.inner.online.subscribe()
    }

    /// Register a callback invoked with the new value on every change
    pub fn on_change<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut listeners) = self.inner.listeners.lock() {
            listeners.push((id, Arc::new(callback)));
        }
        id
    }

    /// Unregister a callback; returns whether it was registered
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        match self.inner.listeners.lock() {
            Ok(mut listeners) => {
                let before = listeners.len();
                listeners.retain(|(lid, _)| *lid != id);
                listeners.len() != before
            }
            Err(_) => false,
        }
    }
}

impl Default for Connectivity {
    /// Offline until the platform says otherwise
    fn default() -> Self {
        Self::new(false)
    }
}
