//! Listener registration and best-effort notification.
//!
//! Clock listeners and control listeners share one policy: every listener is
//! called, a failing listener is logged and skipped, and nothing is
//! propagated to whoever triggered the notification. The event bus uses the
//! opposite (fail-fast) policy and does not go through this module.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Handle returned when a listener is registered, used to unregister it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ListenerId(u64);

impl core::fmt::Display for ListenerId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// Error returned by a listener. Always logged, never propagated.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ListenerError {
    /// Description of the failure.
    pub message: String,
}

impl ListenerError {
    /// Create a listener error from a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Registration table for one kind of listener.
///
/// Notification iterates over a snapshot of the table, so a listener may
/// register or unregister listeners while it is being notified.
pub(crate) struct ListenerRegistry<L: ?Sized> {
    next_id: AtomicU64,
    entries: RwLock<Vec<(ListenerId, Arc<L>)>>,
}

impl<L: ?Sized> ListenerRegistry<L> {
    pub(crate) const fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: RwLock::new(Vec::new()),
        }
    }

    pub(crate) fn register(&self, listener: Arc<L>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, listener));
        id
    }

    /// Remove a listener. Returns `false` if it was not registered.
    pub(crate) fn unregister(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        entries.len() != before
    }

    pub(crate) fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn snapshot(&self) -> Vec<(ListenerId, Arc<L>)> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Call `notify` for every listener in registration order.
    ///
    /// Failures are logged with `kind` and the listener id and do not stop
    /// the remaining listeners. Returns the number of failed listeners.
    pub(crate) fn notify_each<F>(&self, kind: &'static str, notify: F) -> usize
    where
        F: Fn(&L) -> Result<(), ListenerError>,
    {
        let mut failures: usize = 0;
        for (id, listener) in self.snapshot() {
            if let Err(e) = notify(listener.as_ref()) {
                failures = failures.saturating_add(1);
                warn!(listener = %id, kind, error = %e, "listener failed, skipping");
            }
        }
        failures
    }
}

impl<L: ?Sized> core::fmt::Debug for ListenerRegistry<L> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("listeners", &self.len())
            .finish_non_exhaustive()
    }
}
