//! Synchronous publish/subscribe dispatch of simulation events.
//!
//! Processors register against one or more [`EventType`]s with a priority.
//! [`EventBus::publish`] calls every matching processor in priority order
//! (higher first, registration order on ties) on the caller's thread.
//!
//! Dispatch is fail-fast: processors mutate shared simulation state, so
//! once one fails the rest of the batch is skipped and the error goes back
//! to whoever published. Compare with the best-effort listener policy in
//! [`crate::listener`].

use std::cmp::Reverse;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use lifesim_types::{Event, EventId, EventType};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

/// Error returned by an [`EventProcessor`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ProcessorError {
    /// Description of the failure.
    pub message: String,
}

impl ProcessorError {
    /// Create a processor error from a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Errors that can occur while publishing an event.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// A processor failed; processors after it were not invoked.
    #[error("processor '{processor}' failed on {event_type} event {event_id}: {source}")]
    Processor {
        /// Name of the failing processor.
        processor: String,
        /// The event being dispatched.
        event_id: EventId,
        /// Type of the event being dispatched.
        event_type: EventType,
        /// Number of matching processors that were skipped.
        skipped: usize,
        /// The processor's error.
        source: ProcessorError,
    },
}

/// A handler for one or more event types.
///
/// Implementations are supplied by the domain modules (aging, mortality,
/// partnership, ...). The supported types and the priority are read once,
/// at registration.
pub trait EventProcessor: Send + Sync {
    /// Human-readable name used in logs and errors.
    fn name(&self) -> &str;

    /// Event types this processor wants to receive.
    fn supported_types(&self) -> Vec<EventType>;

    /// Dispatch priority; higher runs first.
    fn priority(&self) -> i32 {
        0
    }

    /// Handle one event.
    fn process(&self, event: &Event) -> Result<(), ProcessorError>;
}

/// Handle returned by [`EventBus::register_processor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProcessorId(u64);

impl core::fmt::Display for ProcessorId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "processor-{}", self.0)
    }
}

/// One row of the registration table.
struct Registration {
    /// Monotonic id, doubles as registration order.
    id: ProcessorId,
    /// Cached processor name.
    name: String,
    /// Types captured at registration.
    types: BTreeSet<EventType>,
    /// Priority captured at registration.
    priority: i32,
    /// The processor itself.
    processor: Arc<dyn EventProcessor>,
}

/// Routes events to registered processors.
///
/// Each bus owns its own registration table, so several independent
/// simulations can live in one process.
pub struct EventBus {
    next_id: AtomicU64,
    registrations: RwLock<Vec<Arc<Registration>>>,
}

impl EventBus {
    /// Create a bus with no processors.
    pub const fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            registrations: RwLock::new(Vec::new()),
        }
    }

    /// Register a processor for the types it declares.
    pub fn register_processor(&self, processor: Arc<dyn EventProcessor>) -> ProcessorId {
        let id = ProcessorId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let registration = Registration {
            id,
            name: processor.name().to_owned(),
            types: processor.supported_types().into_iter().collect(),
            priority: processor.priority(),
            processor,
        };
        debug!(
            processor = registration.name,
            id = %id,
            priority = registration.priority,
            types = ?registration.types,
            "Processor registered"
        );
        self.registrations
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(registration));
        id
    }

    /// Remove a processor. Returns `false` if it was not registered.
    pub fn unregister_processor(&self, id: ProcessorId) -> bool {
        let mut registrations = self
            .registrations
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = registrations.len();
        registrations.retain(|r| r.id != id);
        let removed = registrations.len() != before;
        if removed {
            debug!(id = %id, "Processor unregistered");
        }
        removed
    }

    /// Whether at least one processor is registered for `event_type`.
    pub fn has_processors_for_type(&self, event_type: &EventType) -> bool {
        self.registrations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|r| r.types.contains(event_type))
    }

    /// Total number of registered processors.
    pub fn processor_count(&self) -> usize {
        self.registrations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Processors for `event_type` in dispatch order, snapshotted so that
    /// processors may register or unregister during dispatch.
    fn matching(&self, event_type: &EventType) -> Vec<Arc<Registration>> {
        let mut matching: Vec<Arc<Registration>> = self
            .registrations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|r| r.types.contains(event_type))
            .cloned()
            .collect();
        // Ids grow with registration order, which breaks priority ties.
        matching.sort_by_key(|r| (Reverse(r.priority), r.id));
        matching
    }

    /// Dispatch `event` to every processor registered for its type.
    ///
    /// Returns the number of processors invoked; 0 when none are registered,
    /// which is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Processor`] for the first failing processor. The
    /// processors after it are not invoked.
    pub fn publish(&self, event: &Event) -> Result<usize, BusError> {
        let matching = self.matching(event.event_type());
        if matching.is_empty() {
            trace!(event_type = %event.event_type(), "No processors, event dropped");
            return Ok(0);
        }

        let total = matching.len();
        for (index, registration) in matching.iter().enumerate() {
            trace!(
                processor = registration.name,
                event_id = %event.id(),
                event_type = %event.event_type(),
                "Dispatching event"
            );
            if let Err(source) = registration.processor.process(event) {
                let skipped = total.saturating_sub(index).saturating_sub(1);
                warn!(
                    processor = registration.name,
                    event_id = %event.id(),
                    event_type = %event.event_type(),
                    skipped,
                    error = %source,
                    "Processor failed, aborting dispatch"
                );
                return Err(BusError::Processor {
                    processor: registration.name.clone(),
                    event_id: event.id(),
                    event_type: event.event_type().clone(),
                    skipped,
                    source,
                });
            }
        }
        Ok(total)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventBus")
            .field("processors", &self.processor_count())
            .finish_non_exhaustive()
    }
}
