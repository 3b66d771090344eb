//! Simulated calendar clock.
//!
//! The clock is the single source of truth for simulated time. It holds the
//! start date, the current date, and the [`TimeUnit`] applied per tick, and
//! it tells everyone who cares when the date moves.
//!
//! # Design Principles
//!
//! - The current date only changes through [`Clock::advance`], one unit at a
//!   time. Multi-tick operations are loops over it, never jumps, so every
//!   intermediate date is seen by listeners and by the scheduler.
//! - Time never moves backwards. Seeking to a past date is an error.
//! - Listeners are passive observers: a failing listener is logged and the
//!   tick goes on. The tick handler (the scheduler) is not passive, and its
//!   failure aborts the operation that advanced the clock.
//! - All calendar arithmetic is checked; overflow is an error.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};

use chrono::{Datelike, NaiveDate};
use lifesim_types::TimeUnit;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::config::ClockConfig;
use crate::listener::{ListenerError, ListenerId, ListenerRegistry};
use crate::scheduler::SchedulerError;

/// Errors that can occur during clock operations.
#[derive(Debug, thiserror::Error)]
pub enum ClockError {
    /// A multi-tick advance was asked to perform zero ticks.
    #[error("tick count must be at least 1")]
    ZeroTicks,

    /// The target date lies before the current date.
    #[error("cannot move backwards from {current} to {target}")]
    Backwards {
        /// The current simulated date.
        current: NaiveDate,
        /// The requested date.
        target: NaiveDate,
    },

    /// The target date is not a whole number of ticks away.
    #[error("{target} is not a whole number of {unit} ticks after {current}")]
    NotAligned {
        /// The current simulated date.
        current: NaiveDate,
        /// The requested date.
        target: NaiveDate,
        /// The active time unit.
        unit: TimeUnit,
    },

    /// The target date is more ticks away than a single seek may perform.
    #[error("{target} is too far from {current} to reach in one seek")]
    TooFar {
        /// The current simulated date.
        current: NaiveDate,
        /// The requested date.
        target: NaiveDate,
    },

    /// Advancing would leave the supported calendar range.
    #[error("date overflow: cannot add one {unit} to {date}")]
    DateOverflow {
        /// The date that could not be advanced.
        date: NaiveDate,
        /// The active time unit.
        unit: TimeUnit,
    },

    /// A snapshot could not be restored.
    #[error("invalid clock snapshot: {reason}")]
    InvalidSnapshot {
        /// Explanation of what is wrong with the snapshot.
        reason: String,
    },

    /// The tick handler failed while processing the new date.
    #[error("tick processing failed at {date}: {source}")]
    Tick {
        /// The date the clock had reached when processing failed.
        date: NaiveDate,
        /// The underlying scheduler error.
        source: Box<SchedulerError>,
    },
}

/// One tick's worth of date change, as seen by listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeChange {
    /// The date before the tick.
    pub previous: NaiveDate,
    /// The date after the tick.
    pub current: NaiveDate,
    /// The unit that was applied.
    pub unit: TimeUnit,
}

/// Passive observer of date changes.
///
/// Errors are logged and suppressed; they never abort a tick.
pub trait ClockListener: Send + Sync {
    /// Called once per tick, after the date has moved.
    fn on_time_advanced(&self, change: &TimeChange) -> Result<(), ListenerError>;
}

impl<F> ClockListener for F
where
    F: Fn(&TimeChange) -> Result<(), ListenerError> + Send + Sync,
{
    fn on_time_advanced(&self, change: &TimeChange) -> Result<(), ListenerError> {
        self(change)
    }
}

/// Fail-fast hook run on every tick after the listeners.
///
/// The [`Scheduler`](crate::scheduler::Scheduler) installs itself here so
/// that processing errors reach whoever advanced the clock.
pub trait TickHandler: Send + Sync {
    /// Process the date the clock just reached.
    fn on_tick(&self, change: &TimeChange) -> Result<(), SchedulerError>;
}

/// Persisted clock state, read and written by the snapshot component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockSnapshot {
    /// Date the simulation started at.
    pub start_date: NaiveDate,
    /// Date the simulation has reached.
    pub current_date: NaiveDate,
    /// Increment applied per tick.
    pub time_unit: TimeUnit,
}

/// The simulated calendar clock.
///
/// Shared as `Arc<Clock>` between the scheduler and the controller. The
/// clock does not serialize concurrent advances beyond keeping each single
/// tick atomic; the [`Controller`](crate::controller::Controller) is what
/// guarantees only one caller advances at a time.
pub struct Clock {
    /// Date the simulation started at (immutable).
    start_date: NaiveDate,

    /// Current simulated date (only written by `advance`).
    current: RwLock<NaiveDate>,

    /// Increment applied per tick; subscribers see every change.
    time_unit: watch::Sender<TimeUnit>,

    /// Number of ticks performed since construction or restore.
    ticks: AtomicU64,

    /// Best-effort observers.
    listeners: ListenerRegistry<dyn ClockListener>,

    /// Fail-fast hook (weak to avoid a cycle with the scheduler).
    tick_handler: RwLock<Option<Weak<dyn TickHandler>>>,
}

impl Clock {
    /// Create a clock positioned at `start_date`.
    pub fn new(start_date: NaiveDate, time_unit: TimeUnit) -> Self {
        Self {
            start_date,
            current: RwLock::new(start_date),
            time_unit: watch::Sender::new(time_unit),
            ticks: AtomicU64::new(0),
            listeners: ListenerRegistry::new(),
            tick_handler: RwLock::new(None),
        }
    }

    /// Create a clock from the `clock` configuration section.
    pub fn from_config(config: &ClockConfig) -> Self {
        Self::new(config.start_date, config.time_unit)
    }

    /// Recreate a clock from a persisted snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`ClockError::InvalidSnapshot`] if the current date lies
    /// before the start date.
    pub fn restore(snapshot: ClockSnapshot) -> Result<Self, ClockError> {
        if snapshot.current_date < snapshot.start_date {
            return Err(ClockError::InvalidSnapshot {
                reason: format!(
                    "current date {} is before start date {}",
                    snapshot.current_date, snapshot.start_date
                ),
            });
        }
        let clock = Self::new(snapshot.start_date, snapshot.time_unit);
        *clock.current.write().unwrap_or_else(PoisonError::into_inner) = snapshot.current_date;
        Ok(clock)
    }

    /// Capture the persisted part of the clock state.
    pub fn snapshot(&self) -> ClockSnapshot {
        ClockSnapshot {
            start_date: self.start_date,
            current_date: self.current_date(),
            time_unit: self.time_unit(),
        }
    }

    /// Return the date the simulation started at.
    pub const fn start_date(&self) -> NaiveDate {
        self.start_date
    }

    /// Return the current simulated date.
    pub fn current_date(&self) -> NaiveDate {
        *self.current.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return the increment applied per tick.
    pub fn time_unit(&self) -> TimeUnit {
        *self.time_unit.borrow()
    }

    /// Change the increment applied per tick. Returns the previous unit.
    ///
    /// Takes effect from the next tick. Receivers from
    /// [`subscribe_time_unit`](Self::subscribe_time_unit) are woken, which
    /// is how a running controller re-paces its ticker.
    pub fn set_time_unit(&self, unit: TimeUnit) -> TimeUnit {
        let previous = self.time_unit.send_replace(unit);
        if previous != unit {
            debug!(previous = %previous, current = %unit, "Time unit changed");
        }
        previous
    }

    /// Watch the time unit. The returned receiver has already seen the
    /// current unit.
    pub fn subscribe_time_unit(&self) -> watch::Receiver<TimeUnit> {
        self.time_unit.subscribe()
    }

    /// Return the number of ticks performed by this clock instance.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Acquire)
    }

    /// Register a passive listener.
    pub fn register_listener(&self, listener: Arc<dyn ClockListener>) -> ListenerId {
        self.listeners.register(listener)
    }

    /// Remove a listener. Returns `false` if it was not registered.
    pub fn unregister_listener(&self, id: ListenerId) -> bool {
        self.listeners.unregister(id)
    }

    /// Install the fail-fast tick handler, replacing any previous one.
    ///
    /// Only a weak reference is kept; the caller owns the handler.
    pub fn set_tick_handler(&self, handler: &Arc<dyn TickHandler>) {
        *self
            .tick_handler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::downgrade(handler));
    }

    fn tick_handler(&self) -> Option<Arc<dyn TickHandler>> {
        self.tick_handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(Weak::upgrade)
    }

    /// Advance the clock by one tick. Returns the new date.
    ///
    /// The date moves first, then every listener is notified with
    /// `(previous, current, unit)`, then the tick handler runs.
    ///
    /// # Errors
    ///
    /// Returns [`ClockError::DateOverflow`] if the calendar range would be
    /// exceeded (the date does not move), or [`ClockError::Tick`] if the
    /// tick handler failed (the date has already moved).
    pub fn advance(&self) -> Result<NaiveDate, ClockError> {
        let unit = self.time_unit();
        let change = {
            let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
            let previous = *current;
            let next = unit
                .next_after(previous)
                .ok_or(ClockError::DateOverflow {
                    date: previous,
                    unit,
                })?;
            *current = next;
            TimeChange {
                previous,
                current: next,
                unit,
            }
        };
        self.ticks.fetch_add(1, Ordering::AcqRel);
        trace!(previous = %change.previous, current = %change.current, unit = %unit, "Clock advanced");

        self.listeners
            .notify_each("clock", |listener| listener.on_time_advanced(&change));

        if let Some(handler) = self.tick_handler() {
            handler
                .on_tick(&change)
                .map_err(|source| ClockError::Tick {
                    date: change.current,
                    source: Box::new(source),
                })?;
        }

        Ok(change.current)
    }

    /// Advance the clock by `count` ticks, one [`advance`](Self::advance)
    /// at a time. Returns the final date.
    ///
    /// # Errors
    ///
    /// Returns [`ClockError::ZeroTicks`] if `count` is 0, or the first error
    /// raised by a single tick (earlier ticks are not undone).
    pub fn advance_by(&self, count: u32) -> Result<NaiveDate, ClockError> {
        if count == 0 {
            return Err(ClockError::ZeroTicks);
        }
        let mut date = self.current_date();
        for _ in 0..count {
            date = self.advance()?;
        }
        Ok(date)
    }

    /// Advance until the clock reads `target`. Returns the number of ticks
    /// performed, which is 0 when `target` is the current date.
    ///
    /// # Errors
    ///
    /// Returns [`ClockError::Backwards`] for a past target and
    /// [`ClockError::NotAligned`] when the target is not reachable in whole
    /// ticks. In both cases the clock is left untouched.
    pub fn seek_to(&self, target: NaiveDate) -> Result<u32, ClockError> {
        let ticks = self.ticks_until(target)?;
        for _ in 0..ticks {
            self.advance()?;
        }
        Ok(ticks)
    }

    /// Number of ticks from the current date to `target` with the current
    /// unit.
    ///
    /// # Errors
    ///
    /// Same validation as [`seek_to`](Self::seek_to).
    pub fn ticks_until(&self, target: NaiveDate) -> Result<u32, ClockError> {
        ticks_between(self.current_date(), target, self.time_unit())
    }
}

impl core::fmt::Debug for Clock {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Clock")
            .field("start_date", &self.start_date)
            .field("current_date", &self.current_date())
            .field("time_unit", &self.time_unit())
            .field("ticks", &self.ticks())
            .field("listeners", &self.listeners)
            .finish_non_exhaustive()
    }
}

/// Number of whole `unit` ticks that lead from `from` to `target`.
///
/// The candidate count comes from the calendar difference and is then
/// confirmed by replaying the ticks, because month-end clamping makes
/// sequential increments differ from a single jump.
pub(crate) fn ticks_between(
    from: NaiveDate,
    target: NaiveDate,
    unit: TimeUnit,
) -> Result<u32, ClockError> {
    if target < from {
        return Err(ClockError::Backwards {
            current: from,
            target,
        });
    }
    if target == from {
        return Ok(0);
    }

    let not_aligned = || ClockError::NotAligned {
        current: from,
        target,
        unit,
    };

    let years = i64::from(target.year()).checked_sub(i64::from(from.year()));
    let months = years.and_then(|y| {
        y.checked_mul(12)?
            .checked_add(i64::from(target.month()))?
            .checked_sub(i64::from(from.month()))
    });
    let candidate = match unit {
        TimeUnit::Day => Some(target.signed_duration_since(from).num_days()),
        TimeUnit::Month => months,
        TimeUnit::Year => years,
    }
    .ok_or_else(not_aligned)?;

    let ticks = u32::try_from(candidate).map_err(|_err| ClockError::TooFar {
        current: from,
        target,
    })?;
    if ticks == 0 {
        return Err(not_aligned());
    }

    match unit.add_to(from, ticks) {
        Some(reached) if reached == target => Ok(ticks),
        _ => Err(not_aligned()),
    }
}
