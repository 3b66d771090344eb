//! Date-addressed event queue drained on every clock tick.
//!
//! Events are queued against a calendar date and released exactly when the
//! clock reaches that date: matching is by equality, not "on or after".
//! Per date the queue is FIFO.
//!
//! The scheduler installs itself as the clock's [`TickHandler`]. On every
//! tick it first publishes a [`EventType::TIME_ADVANCED`] event for the new
//! date and then drains that date's queue through the [`EventBus`]. Because
//! the clock ticks one unit at a time, no reachable date is ever skipped.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::NaiveDate;
use lifesim_types::{Event, EventId, EventType};
use tracing::{debug, warn};

use crate::bus::{BusError, EventBus};
use crate::clock::{Clock, ClockError, TickHandler, TimeChange};

/// Errors that can occur while scheduling or releasing events.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// The requested date is already in the past.
    #[error("cannot schedule event {event_id} for {date}: clock is already at {current}")]
    PastDate {
        /// The event that was rejected.
        event_id: EventId,
        /// The requested date.
        date: NaiveDate,
        /// The clock's current date.
        current: NaiveDate,
    },

    /// Publishing the per-tick `time.advanced` event failed.
    #[error("time.advanced dispatch failed for {date}: {source}")]
    TimeAdvanced {
        /// The date that was reached.
        date: NaiveDate,
        /// The underlying bus error.
        source: BusError,
    },

    /// A scheduled event failed to dispatch. The date's queue is consumed
    /// regardless; `skipped` events after the failing one were dropped.
    #[error("scheduled dispatch failed for {date} ({skipped} later events dropped): {source}")]
    Dispatch {
        /// The date being processed.
        date: NaiveDate,
        /// Number of queued events that were never published.
        skipped: usize,
        /// The underlying bus error.
        source: BusError,
    },
}

/// Holds events addressed to future dates.
pub struct Scheduler {
    clock: Arc<Clock>,
    bus: Arc<EventBus>,
    queue: Mutex<BTreeMap<NaiveDate, Vec<Event>>>,
}

impl Scheduler {
    /// Create a scheduler bound to `clock` and `bus` and install it as the
    /// clock's tick handler.
    pub fn attach(clock: Arc<Clock>, bus: Arc<EventBus>) -> Arc<Self> {
        let scheduler = Arc::new(Self {
            clock: Arc::clone(&clock),
            bus,
            queue: Mutex::new(BTreeMap::new()),
        });
        let handler: Arc<dyn TickHandler> = Arc::clone(&scheduler) as Arc<dyn TickHandler>;
        clock.set_tick_handler(&handler);
        scheduler
    }

    /// Queue `event` for release when the clock reaches `date`.
    ///
    /// Dates equal to the current date are accepted; such an event is
    /// released by the next pass over that date, which only happens if the
    /// date is still being processed (for example when a processor schedules
    /// a follow-up for "today"). Dates that the clock cannot land on with the
    /// current unit are accepted with a warning and will never be released.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::PastDate`] if `date` is strictly before the
    /// clock's current date.
    pub fn schedule_event(&self, event: Event, date: NaiveDate) -> Result<(), SchedulerError> {
        let current = self.clock.current_date();
        if date < current {
            return Err(SchedulerError::PastDate {
                event_id: event.id(),
                date,
                current,
            });
        }
        if let Err(ClockError::NotAligned { unit, .. }) = self.clock.ticks_until(date) {
            warn!(
                event_id = %event.id(),
                date = %date,
                current = %current,
                unit = %unit,
                "Scheduled date is not on a tick boundary and will not be reached"
            );
        }

        debug!(event_id = %event.id(), event_type = %event.event_type(), date = %date, "Event scheduled");
        self.lock_queue().entry(date).or_default().push(event);
        Ok(())
    }

    /// Snapshot of the events queued for `date`, in release order.
    pub fn events_for_date(&self, date: NaiveDate) -> Vec<Event> {
        self.lock_queue().get(&date).cloned().unwrap_or_default()
    }

    /// Remove a not-yet-released event. Returns `false` if it was not found.
    pub fn cancel_event(&self, id: EventId) -> bool {
        let mut queue = self.lock_queue();
        let mut emptied = None;
        let mut found = false;
        for (date, events) in queue.iter_mut() {
            if let Some(position) = events.iter().position(|e| e.id() == id) {
                events.remove(position);
                found = true;
                if events.is_empty() {
                    emptied = Some(*date);
                }
                break;
            }
        }
        if let Some(date) = emptied {
            queue.remove(&date);
        }
        if found {
            debug!(event_id = %id, "Scheduled event cancelled");
        }
        found
    }

    /// Total number of queued events across all dates.
    pub fn pending_count(&self) -> usize {
        self.lock_queue().values().map(Vec::len).sum()
    }

    /// Earliest date with queued events.
    pub fn next_scheduled_date(&self) -> Option<NaiveDate> {
        self.lock_queue().keys().next().copied()
    }

    /// Publish every event queued for `date` in FIFO order and consume the
    /// entry. Returns the number of events published.
    ///
    /// Events scheduled for `date` while it is being processed are published
    /// in the same call, after the ones already queued.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Dispatch`] on the first processor failure.
    /// Everything still queued for `date` is dropped and counted in
    /// `skipped`; it is never released later.
    pub fn process_scheduled_events(&self, date: NaiveDate) -> Result<usize, SchedulerError> {
        let mut published: usize = 0;
        loop {
            // Take the batch out so processors can schedule without deadlock.
            let Some(batch) = self.lock_queue().remove(&date) else {
                break;
            };
            let total = batch.len();
            for (index, event) in batch.iter().enumerate() {
                if let Err(source) = self.bus.publish(event) {
                    let rest_of_batch = total.saturating_sub(index).saturating_sub(1);
                    let requeued = self
                        .lock_queue()
                        .remove(&date)
                        .map_or(0, |late| late.len());
                    let skipped = rest_of_batch.saturating_add(requeued);
                    warn!(date = %date, skipped, error = %source, "Scheduled dispatch failed");
                    return Err(SchedulerError::Dispatch {
                        date,
                        skipped,
                        source,
                    });
                }
                published = published.saturating_add(1);
            }
        }
        if published > 0 {
            debug!(date = %date, published, "Scheduled events released");
        }
        Ok(published)
    }

    fn lock_queue(&self) -> std::sync::MutexGuard<'_, BTreeMap<NaiveDate, Vec<Event>>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl TickHandler for Scheduler {
    fn on_tick(&self, change: &TimeChange) -> Result<(), SchedulerError> {
        let tick_event = Event::builder(EventType::TIME_ADVANCED, change.current)
            .property("previous_date", change.previous.to_string())
            .property("time_unit", change.unit.as_str())
            .build();
        self.bus
            .publish(&tick_event)
            .map_err(|source| SchedulerError::TimeAdvanced {
                date: change.current,
                source,
            })?;
        self.process_scheduled_events(change.current)?;
        Ok(())
    }
}

impl core::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Scheduler")
            .field("pending", &self.pending_count())
            .field("next_date", &self.next_scheduled_date())
            .finish_non_exhaustive()
    }
}
