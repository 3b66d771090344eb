//! Run-state machine and background ticker driving the clock.
//!
//! The controller is the only part of the kernel with background
//! concurrency. While `Running`, a single tokio task (the ticker) advances
//! the clock once per period, where the period is the configured base
//! interval for the current [`TimeUnit`] divided by the speed factor.
//! Everything else (`step`, `seek_to`) advances synchronously on the
//! caller's thread and is refused while `Running`, so two advances can never
//! race.
//!
//! # Concurrency
//!
//! - The advance lock is held for one tick, or for one whole
//!   `step`/`seek_to`. Nothing else takes it.
//! - The control lock guards the ticker handle and every status transition
//!   except pause/resume. It is only ever held for a few statements, never
//!   while the clock advances and never across an `.await`. Lock order is
//!   advance, then control.
//! - `stop` therefore never waits for a tick in flight: it flips the status,
//!   signals the ticker, and waits at most the stop timeout before aborting
//!   the task. A tick that was already running finishes on its own and
//!   then sees the shutdown.
//! - `status`, `speed`, and `current_date` are lock-free (atomics or a
//!   short read lock on the clock).
//! - `pause`/`resume` are compare-and-swap transitions. Pausing does not
//!   cancel the ticker: the ticker keeps firing and skips ticks whose status
//!   is not `Running`.
//! - The ticker watches the clock's time unit and re-paces itself when it
//!   changes, whoever changed it.
//! - Control calls are refused with [`ControlError::Reentrant`] when made
//!   from inside a tick, step, or seek on the same thread (for example by a
//!   processor), instead of deadlocking.
//!
//! # Failures
//!
//! A failing tick of the background ticker is reported as an `Error`
//! notification and logged, but the status stays `Running` and the ticker
//! keeps going, so the same failure may repeat every tick until someone
//! calls [`Controller::stop`]. A failing `step` or `seek_to` moves the
//! controller to `Error`.

use std::cell::Cell;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;

use chrono::NaiveDate;
use lifesim_types::{ControllerStatus, Event, EventType, TimeUnit};
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::bus::{BusError, EventBus};
use crate::clock::{Clock, ClockError};
use crate::config::{ControllerConfig, MAX_SPEED, MIN_SPEED, is_valid_speed};
use crate::feedback::{ControlListener, ControlNotification, ControlOperation, FeedbackSink};
use crate::listener::{ListenerId, ListenerRegistry};
use crate::scheduler::Scheduler;

/// Errors returned by controller operations.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    /// An argument was out of range. Nothing changed.
    #[error("invalid argument: {reason}")]
    InvalidArgument {
        /// Explanation of what is wrong.
        reason: String,
    },

    /// The operation is not allowed in the current status. Nothing changed.
    #[error("cannot {operation} while {status}")]
    InvalidState {
        /// The refused operation.
        operation: &'static str,
        /// The status at the time of the call.
        status: ControllerStatus,
    },

    /// The operation was called from inside a tick, step, or seek.
    #[error("cannot {operation} from inside a running tick, step, or seek")]
    Reentrant {
        /// The refused operation.
        operation: &'static str,
    },

    /// The clock refused to move or a tick failed.
    #[error("clock error: {source}")]
    Clock {
        /// The underlying clock error.
        #[from]
        source: ClockError,
    },

    /// Publishing a step or seek completion event failed.
    #[error("dispatch error: {source}")]
    Dispatch {
        /// The underlying bus error.
        #[from]
        source: BusError,
    },
}

thread_local! {
    /// Set while this thread holds the advance lock on behalf of a tick,
    /// step, or seek.
    static IN_CONTROL: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as inside a controlled section until dropped.
struct ControlScope {
    previous: bool,
}

impl ControlScope {
    fn enter() -> Self {
        Self {
            previous: IN_CONTROL.with(|flag| flag.replace(true)),
        }
    }
}

impl Drop for ControlScope {
    fn drop(&mut self) {
        IN_CONTROL.with(|flag| flag.set(self.previous));
    }
}

fn ensure_outside_control(operation: &'static str) -> Result<(), ControlError> {
    if IN_CONTROL.with(Cell::get) {
        Err(ControlError::Reentrant { operation })
    } else {
        Ok(())
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Handle on the background ticker task.
struct Ticker {
    /// Incremented for every spawned ticker, used in logs.
    generation: u64,
    /// Set to `true` to ask the task to exit.
    shutdown: watch::Sender<bool>,
    /// The task itself.
    handle: JoinHandle<()>,
}

impl Ticker {
    /// Signal the task and abort it without waiting.
    ///
    /// A tick already in flight runs to completion and then sees the
    /// shutdown flag.
    fn cancel(self) {
        self.shutdown.send_replace(true);
        self.handle.abort();
        debug!(generation = self.generation, "Ticker cancelled");
    }

    /// Signal the task, wait up to `timeout` for it to exit, then abort it.
    async fn shutdown(self, timeout: Duration) {
        let Self {
            generation,
            shutdown,
            handle,
        } = self;
        shutdown.send_replace(true);
        let abort = handle.abort_handle();
        match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(())) => debug!(generation, "Ticker stopped"),
            Ok(Err(e)) => warn!(generation, error = %e, "Ticker ended abnormally"),
            Err(_elapsed) => {
                warn!(
                    generation,
                    timeout_ms = millis(timeout),
                    "Ticker did not stop in time, aborting"
                );
                abort.abort();
            }
        }
    }
}

/// State guarded by the control lock.
#[derive(Default)]
struct ControlState {
    ticker: Option<Ticker>,
    generation: u64,
}

/// Serializable view of the controller for status displays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerReport {
    /// Current run-state.
    pub status: ControllerStatus,
    /// Current speed factor.
    pub speed: f64,
    /// Date the simulation started at.
    pub start_date: NaiveDate,
    /// Current simulated date.
    pub current_date: NaiveDate,
    /// Increment applied per tick.
    pub time_unit: TimeUnit,
    /// Ticks performed by the clock.
    pub ticks: u64,
    /// Events waiting in the scheduler.
    pub pending_events: usize,
    /// Wall-clock milliseconds between ticks at the current unit and speed.
    pub tick_period_ms: u64,
}

struct Shared {
    clock: Arc<Clock>,
    bus: Arc<EventBus>,
    scheduler: Arc<Scheduler>,
    config: ControllerConfig,
    runtime: Handle,
    status: AtomicU8,
    speed_bits: AtomicU64,
    /// Held while the clock advances.
    advance: Mutex<()>,
    /// Held for status transitions and ticker management only.
    control: Mutex<ControlState>,
    listeners: ListenerRegistry<dyn ControlListener>,
    feedback: RwLock<Option<Arc<dyn FeedbackSink>>>,
}

impl Shared {
    fn status(&self) -> ControllerStatus {
        ControllerStatus::from_u8(self.status.load(Ordering::Acquire))
            .unwrap_or(ControllerStatus::Error)
    }

    /// Store `status` and return the previous one.
    fn set_status(&self, status: ControllerStatus) -> ControllerStatus {
        let previous = self.status.swap(status.as_u8(), Ordering::AcqRel);
        if previous != status.as_u8() {
            debug!(status = %status, "Controller status changed");
        }
        ControllerStatus::from_u8(previous).unwrap_or(ControllerStatus::Error)
    }

    fn transition(&self, from: ControllerStatus, to: ControllerStatus) -> bool {
        self.status
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn speed(&self) -> f64 {
        f64::from_bits(self.speed_bits.load(Ordering::Acquire))
    }

    fn tick_period(&self) -> Duration {
        self.config.tick_period(self.clock.time_unit(), self.speed())
    }

    // Both guarded values stay consistent even if a processor panicked while
    // a lock was held, so poisoning is ignored.

    fn lock_control(&self) -> MutexGuard<'_, ControlState> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_advance(&self) -> MutexGuard<'_, ()> {
        self.advance.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Refuse `operation` while running or while a step/seek is active.
    fn ensure_idle(&self, operation: &'static str) -> Result<(), ControlError> {
        let status = self.status();
        if status == ControllerStatus::Running || status.is_busy() {
            return Err(ControlError::InvalidState { operation, status });
        }
        Ok(())
    }

    /// Refuse `operation` while a step or seek is active.
    fn ensure_not_busy(&self, operation: &'static str) -> Result<(), ControlError> {
        let status = self.status();
        if status.is_busy() {
            return Err(ControlError::InvalidState { operation, status });
        }
        Ok(())
    }

    /// Enter `busy` from an idle status. Returns the status to restore.
    fn begin(
        &self,
        operation: &'static str,
        busy: ControllerStatus,
    ) -> Result<ControllerStatus, ControlError> {
        let _control = self.lock_control();
        self.ensure_idle(operation)?;
        Ok(self.set_status(busy))
    }

    /// Leave `busy`: back to `prior` on success, `Error` on failure. A
    /// `stop` that landed meanwhile wins.
    fn end(&self, busy: ControllerStatus, prior: ControllerStatus, succeeded: bool) {
        let _control = self.lock_control();
        let after = if succeeded {
            prior
        } else {
            ControllerStatus::Error
        };
        if !self.transition(busy, after) {
            debug!(status = %self.status(), "Status changed while advancing, keeping it");
        }
    }

    fn notify(&self, notification: &ControlNotification) {
        self.listeners
            .notify_each("control", |listener| listener.on_control(notification));
        let sink = self
            .feedback
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(sink) = sink {
            sink.show(notification);
        }
    }

    /// One firing of the ticker. Returns `false` when the ticker must exit.
    fn on_tick(&self, shutdown: &watch::Receiver<bool>) -> bool {
        if self.status() != ControllerStatus::Running {
            // Paused (or stepping elsewhere): fire without advancing.
            return !*shutdown.borrow();
        }

        let outcome = {
            let _advance = self.lock_advance();
            if *shutdown.borrow() {
                return false;
            }
            if self.status() != ControllerStatus::Running {
                return true;
            }
            let _scope = ControlScope::enter();
            self.clock.advance()
        };

        // `stop` may have returned while this tick was in flight.
        let stopped = *shutdown.borrow() || self.status() != ControllerStatus::Running;
        match outcome {
            Err(e) if stopped => {
                warn!(error = %e, "Tick failed after the controller left Running");
            }
            Err(e) => {
                let date = self.clock.current_date();
                error!(date = %date, error = %e, "Tick failed, ticker keeps running");
                self.notify(&ControlNotification::Error {
                    operation: ControlOperation::Tick,
                    date,
                    message: e.to_string(),
                });
            }
            Ok(_) => {}
        }
        !*shutdown.borrow()
    }

    fn run_step(&self, ticks: u32, from: NaiveDate) -> Result<NaiveDate, ControlError> {
        let mut date = from;
        for completed in 1..=ticks {
            date = self.clock.advance()?;
            if ticks > 1 {
                self.notify(&ControlNotification::Progress {
                    operation: ControlOperation::Step,
                    completed,
                    total: ticks,
                    date,
                });
            }
        }
        let event = Event::builder(EventType::SIMULATION_STEPPED, date)
            .property("from", from.to_string())
            .property("ticks", ticks)
            .build();
        self.bus.publish(&event)?;
        Ok(date)
    }

    fn run_seek(&self, from: NaiveDate, total: u32) -> Result<NaiveDate, ControlError> {
        let chunk = self.config.seek_chunk_size.max(1);
        let mut completed: u32 = 0;
        let mut date = from;
        while completed < total {
            let this_chunk = chunk.min(total.saturating_sub(completed));
            for _ in 0..this_chunk {
                date = self.clock.advance()?;
            }
            completed = completed.saturating_add(this_chunk);
            self.notify(&ControlNotification::Progress {
                operation: ControlOperation::Seek,
                completed,
                total,
                date,
            });
        }
        let event = Event::builder(EventType::SIMULATION_SEEKED, date)
            .property("from", from.to_string())
            .property("ticks", total)
            .build();
        self.bus.publish(&event)?;
        Ok(date)
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let state = self
            .control
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(ticker) = state.ticker.take() {
            ticker.cancel();
        }
    }
}

/// Start/pause/resume/stop/step/seek/speed control over a [`Clock`].
///
/// Cloning is cheap and every clone controls the same simulation.
#[derive(Clone)]
pub struct Controller {
    shared: Arc<Shared>,
}

impl Controller {
    /// Create a controller in the `Stopped` state.
    ///
    /// `runtime` is where the ticker task is spawned; the controller itself
    /// may be driven from any thread.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::InvalidArgument`] if `config` does not
    /// validate.
    pub fn new(
        clock: Arc<Clock>,
        bus: Arc<EventBus>,
        scheduler: Arc<Scheduler>,
        config: ControllerConfig,
        runtime: Handle,
    ) -> Result<Self, ControlError> {
        config
            .validate()
            .map_err(|e| ControlError::InvalidArgument {
                reason: e.to_string(),
            })?;

        let shared = Shared {
            clock,
            bus,
            scheduler,
            status: AtomicU8::new(ControllerStatus::Initializing.as_u8()),
            speed_bits: AtomicU64::new(config.speed.to_bits()),
            config,
            runtime,
            advance: Mutex::new(()),
            control: Mutex::new(ControlState::default()),
            listeners: ListenerRegistry::new(),
            feedback: RwLock::new(None),
        };
        shared.set_status(ControllerStatus::Stopped);
        info!(
            date = %shared.clock.current_date(),
            time_unit = %shared.clock.time_unit(),
            speed = shared.speed(),
            "Controller initialized"
        );
        Ok(Self {
            shared: Arc::new(shared),
        })
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Current run-state.
    pub fn status(&self) -> ControllerStatus {
        self.shared.status()
    }

    /// Current speed factor.
    pub fn speed(&self) -> f64 {
        self.shared.speed()
    }

    /// Current simulated date.
    pub fn current_date(&self) -> NaiveDate {
        self.shared.clock.current_date()
    }

    /// Wall-clock interval between ticks at the current unit and speed.
    pub fn tick_period(&self) -> Duration {
        self.shared.tick_period()
    }

    /// Whether a ticker task currently exists (running or soft-paused).
    pub fn has_ticker(&self) -> bool {
        self.shared.lock_control().ticker.is_some()
    }

    /// The driven clock.
    pub fn clock(&self) -> &Arc<Clock> {
        &self.shared.clock
    }

    /// The event bus used for completion events.
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.shared.bus
    }

    /// The scheduler drained on every tick.
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.shared.scheduler
    }

    /// Snapshot of the controller for status displays.
    pub fn status_report(&self) -> ControllerReport {
        let shared = &self.shared;
        ControllerReport {
            status: shared.status(),
            speed: shared.speed(),
            start_date: shared.clock.start_date(),
            current_date: shared.clock.current_date(),
            time_unit: shared.clock.time_unit(),
            ticks: shared.clock.ticks(),
            pending_events: shared.scheduler.pending_count(),
            tick_period_ms: millis(shared.tick_period()),
        }
    }

    // -----------------------------------------------------------------------
    // Listeners
    // -----------------------------------------------------------------------

    /// Register a control listener.
    pub fn register_listener(&self, listener: Arc<dyn ControlListener>) -> ListenerId {
        self.shared.listeners.register(listener)
    }

    /// Remove a control listener. Returns `false` if it was not registered.
    pub fn unregister_listener(&self, id: ListenerId) -> bool {
        self.shared.listeners.unregister(id)
    }

    /// Attach (or with `None`, detach) the feedback sink.
    pub fn set_feedback_sink(&self, sink: Option<Arc<dyn FeedbackSink>>) {
        *self
            .shared
            .feedback
            .write()
            .unwrap_or_else(PoisonError::into_inner) = sink;
    }

    // -----------------------------------------------------------------------
    // Run / pause / resume / stop
    // -----------------------------------------------------------------------

    /// Move from `Stopped`, `Paused`, or `Error` to `Running`.
    ///
    /// Spawns the ticker if none exists; a soft-paused ticker is reused.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::InvalidState`] from any other status.
    pub fn start(&self) -> Result<(), ControlError> {
        ensure_outside_control("start")?;
        let shared = &self.shared;
        let date = {
            let mut state = shared.lock_control();
            let status = shared.status();
            if !status.can_start() {
                return Err(ControlError::InvalidState {
                    operation: "start",
                    status,
                });
            }
            if state.ticker.is_none() {
                self.spawn_ticker(&mut state);
            }
            shared.set_status(ControllerStatus::Running);
            shared.clock.current_date()
        };
        info!(date = %date, speed = shared.speed(), "Simulation started");
        shared.notify(&ControlNotification::Started { date });
        Ok(())
    }

    /// Move from `Running` to `Paused`. Returns `false` from any other
    /// status. The ticker keeps firing but stops advancing.
    pub fn pause(&self) -> bool {
        let shared = &self.shared;
        let paused = shared.transition(ControllerStatus::Running, ControllerStatus::Paused);
        if paused {
            let date = shared.clock.current_date();
            info!(date = %date, "Simulation paused");
            shared.notify(&ControlNotification::Paused { date });
        }
        paused
    }

    /// Move from `Paused` to `Running`. Returns `false` from any other
    /// status.
    pub fn resume(&self) -> bool {
        let shared = &self.shared;
        let resumed = shared.transition(ControllerStatus::Paused, ControllerStatus::Running);
        if resumed {
            let date = shared.clock.current_date();
            info!(date = %date, "Simulation resumed");
            shared.notify(&ControlNotification::Resumed { date });
        }
        resumed
    }

    /// Move to `Stopped` from any status and tear the ticker down.
    ///
    /// Does not wait for a tick in flight to take a lock. Waits up to the
    /// configured stop timeout for the ticker task to exit, then aborts it.
    /// Returns `false` (and notifies nobody) if the controller was already
    /// stopped.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::Reentrant`] when called from inside a tick.
    pub async fn stop(&self) -> Result<bool, ControlError> {
        ensure_outside_control("stop")?;
        let shared = &self.shared;
        let (ticker, previous) = {
            let mut state = shared.lock_control();
            let previous = shared.set_status(ControllerStatus::Stopped);
            (state.ticker.take(), previous)
        };
        if let Some(ticker) = ticker {
            ticker.shutdown(shared.config.stop_timeout()).await;
        }
        if previous == ControllerStatus::Stopped {
            return Ok(false);
        }
        let date = shared.clock.current_date();
        info!(date = %date, previous = %previous, "Simulation stopped");
        shared.notify(&ControlNotification::Stopped { date });
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Step / seek
    // -----------------------------------------------------------------------

    /// Advance `ticks` ticks synchronously and return the final date.
    ///
    /// Reports progress after every tick when `ticks > 1`, restores the
    /// previous status afterwards (`Paused` stays `Paused`), and publishes a
    /// [`EventType::SIMULATION_STEPPED`] event.
    ///
    /// # Errors
    ///
    /// [`ControlError::InvalidArgument`] for `ticks == 0`,
    /// [`ControlError::InvalidState`] while `Running` or busy; neither
    /// changes anything. A failing tick returns [`ControlError::Clock`] and
    /// leaves the controller in `Error`.
    pub fn step(&self, ticks: u32) -> Result<NaiveDate, ControlError> {
        if ticks == 0 {
            return Err(ControlError::InvalidArgument {
                reason: "step count must be at least 1".to_owned(),
            });
        }
        ensure_outside_control("step")?;
        let shared = &self.shared;
        shared.ensure_idle("step")?;

        let (from, result) = {
            let _advance = shared.lock_advance();
            let prior = shared.begin("step", ControllerStatus::Stepping)?;
            let from = shared.clock.current_date();
            let result = {
                let _scope = ControlScope::enter();
                shared.run_step(ticks, from)
            };
            shared.end(ControllerStatus::Stepping, prior, result.is_ok());
            (from, result)
        };
        self.finish(ControlOperation::Step, from, ticks, result)
    }

    /// Advance synchronously until the clock reads `target`, reporting
    /// progress every `seek_chunk_size` ticks. Returns the final date.
    ///
    /// # Errors
    ///
    /// [`ControlError::InvalidState`] while `Running` or busy,
    /// [`ControlError::InvalidArgument`] if `target` is not after the
    /// current date, [`ControlError::Clock`] with
    /// [`ClockError::NotAligned`] if it is not a whole number of ticks away;
    /// none of these change anything. A failing tick leaves the controller
    /// in `Error`.
    pub fn seek_to(&self, target: NaiveDate) -> Result<NaiveDate, ControlError> {
        ensure_outside_control("seek")?;
        let shared = &self.shared;
        shared.ensure_idle("seek")?;

        let (from, total, result) = {
            let _advance = shared.lock_advance();
            let from = shared.clock.current_date();
            if target <= from {
                return Err(ControlError::InvalidArgument {
                    reason: format!("seek target {target} must be after the current date {from}"),
                });
            }
            let total = shared.clock.ticks_until(target)?;

            let prior = shared.begin("seek", ControllerStatus::Seeking)?;
            let result = {
                let _scope = ControlScope::enter();
                shared.run_seek(from, total)
            };
            shared.end(ControllerStatus::Seeking, prior, result.is_ok());
            (from, total, result)
        };
        self.finish(ControlOperation::Seek, from, total, result)
    }

    /// Log and notify the outcome of a step or seek.
    fn finish(
        &self,
        operation: ControlOperation,
        from: NaiveDate,
        ticks: u32,
        result: Result<NaiveDate, ControlError>,
    ) -> Result<NaiveDate, ControlError> {
        let shared = &self.shared;
        match result {
            Ok(to) => {
                info!(operation = %operation, from = %from, to = %to, ticks, "Advance finished");
                let notification = match operation {
                    ControlOperation::Seek => ControlNotification::Seeked { from, to, ticks },
                    ControlOperation::Step | ControlOperation::Tick => {
                        ControlNotification::Stepped { from, to, ticks }
                    }
                };
                shared.notify(&notification);
                Ok(to)
            }
            Err(e) => {
                let date = shared.clock.current_date();
                error!(operation = %operation, date = %date, error = %e, "Advance failed");
                shared.notify(&ControlNotification::Error {
                    operation,
                    date,
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Speed / time unit
    // -----------------------------------------------------------------------

    /// Change the speed factor. Returns the previous factor.
    ///
    /// If a ticker exists it is replaced by one with the new period, so the
    /// change applies from the next tick.
    ///
    /// # Errors
    ///
    /// [`ControlError::InvalidArgument`] if `speed` is outside
    /// `[MIN_SPEED, MAX_SPEED]`, [`ControlError::InvalidState`] while a
    /// step or seek is active; nothing changes.
    pub fn set_speed(&self, speed: f64) -> Result<f64, ControlError> {
        if !is_valid_speed(speed) {
            return Err(ControlError::InvalidArgument {
                reason: format!("speed must be within [{MIN_SPEED}, {MAX_SPEED}], got {speed}"),
            });
        }
        ensure_outside_control("set speed")?;
        let shared = &self.shared;
        let previous = {
            let mut state = shared.lock_control();
            shared.ensure_not_busy("set speed")?;
            let previous =
                f64::from_bits(shared.speed_bits.swap(speed.to_bits(), Ordering::AcqRel));
            if let Some(old) = state.ticker.take() {
                old.cancel();
                self.spawn_ticker(&mut state);
            }
            previous
        };
        info!(previous, current = speed, "Speed changed");
        shared.notify(&ControlNotification::SpeedChanged {
            previous,
            current: speed,
        });
        Ok(previous)
    }

    /// Change the clock's time unit. Returns the previous unit.
    ///
    /// A live ticker re-paces itself to the new base interval.
    ///
    /// # Errors
    ///
    /// [`ControlError::InvalidState`] while a step or seek is active,
    /// [`ControlError::Reentrant`] when called from inside a tick.
    pub fn set_time_unit(&self, unit: TimeUnit) -> Result<TimeUnit, ControlError> {
        ensure_outside_control("set time unit")?;
        let shared = &self.shared;
        let previous = {
            let _state = shared.lock_control();
            shared.ensure_not_busy("set time unit")?;
            shared.clock.set_time_unit(unit)
        };
        if previous != unit {
            shared.notify(&ControlNotification::TimeUnitChanged {
                previous,
                current: unit,
            });
        }
        Ok(previous)
    }

    // -----------------------------------------------------------------------
    // Ticker management (control lock held)
    // -----------------------------------------------------------------------

    fn spawn_ticker(&self, state: &mut ControlState) {
        state.generation = state.generation.wrapping_add(1);
        let generation = state.generation;
        let (shutdown, receiver) = watch::channel(false);
        let units = self.shared.clock.subscribe_time_unit();
        let handle = self.shared.runtime.spawn(run_ticker(
            Arc::downgrade(&self.shared),
            units,
            receiver,
        ));
        debug!(
            generation,
            period_ms = millis(self.shared.tick_period()),
            "Ticker spawned"
        );
        state.ticker = Some(Ticker {
            generation,
            shutdown,
            handle,
        });
    }
}

impl core::fmt::Debug for Controller {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Controller")
            .field("status", &self.status())
            .field("speed", &self.speed())
            .field("current_date", &self.current_date())
            .finish_non_exhaustive()
    }
}

fn ticker_interval(period: Duration) -> Interval {
    let first = Instant::now().checked_add(period).unwrap_or_else(Instant::now);
    let mut interval = tokio::time::interval_at(first, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// The ticker task: fire every period until shut down or orphaned, and
/// re-pace whenever the clock's time unit changes.
async fn run_ticker(
    shared: Weak<Shared>,
    mut units: watch::Receiver<TimeUnit>,
    mut shutdown: watch::Receiver<bool>,
) {
    let Some(owner) = shared.upgrade() else {
        return;
    };
    let mut interval = ticker_interval(owner.tick_period());
    drop(owner);
    loop {
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            changed = units.changed() => {
                if changed.is_err() {
                    break;
                }
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                let period = shared.tick_period();
                debug!(period_ms = millis(period), "Time unit changed, ticker re-paced");
                interval = ticker_interval(period);
            }
            _ = interval.tick() => {
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                if !shared.on_tick(&shutdown) {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use lifesim_types::TimeUnit;

    use super::*;
    use crate::bus::{EventProcessor, ProcessorError};
    use crate::listener::ListenerError;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn controller(start: NaiveDate, unit: TimeUnit) -> Controller {
        let clock = Arc::new(Clock::new(start, unit));
        let bus = Arc::new(EventBus::new());
        let scheduler = Scheduler::attach(Arc::clone(&clock), Arc::clone(&bus));
        Controller::new(clock, bus, scheduler, ControllerConfig::default(), Handle::current()).unwrap()
    }

    /// Collects every control notification.
    fn collect(controller: &Controller) -> Arc<StdMutex<Vec<ControlNotification>>> {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        controller.register_listener(Arc::new(
            move |n: &ControlNotification| -> Result<(), ListenerError> {
                sink.lock().unwrap().push(n.clone());
                Ok(())
            },
        ));
        seen
    }

    /// Fails on every event of the given type.
    struct AlwaysFails(EventType);

    impl EventProcessor for AlwaysFails {
        fn name(&self) -> &str {
            "always-fails"
        }

        fn supported_types(&self) -> Vec<EventType> {
            vec![self.0.clone()]
        }

        fn process(&self, _event: &Event) -> Result<(), ProcessorError> {
            Err(ProcessorError::new("population invariant broken"))
        }
    }

    #[tokio::test]
    async fn new_controller_is_stopped() {
        let c = controller(date(2025, 1, 1), TimeUnit::Year);
        assert_eq!(c.status(), ControllerStatus::Stopped);
        assert!((c.speed() - 1.0).abs() < f64::EPSILON);
        assert!(!c.has_ticker());
    }

    #[tokio::test(start_paused = true)]
    async fn running_ticker_advances_once_per_period() {
        let c = controller(date(2025, 1, 1), TimeUnit::Day);
        c.start().unwrap();
        assert_eq!(c.status(), ControllerStatus::Running);

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(c.current_date(), date(2025, 1, 4));

        assert!(c.stop().await.unwrap());
        assert!(!c.has_ticker());
    }

    #[tokio::test(start_paused = true)]
    async fn pause_gates_the_ticker_without_cancelling_it() {
        let c = controller(date(2025, 1, 1), TimeUnit::Day);
        c.start().unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(c.pause());
        let paused_at = c.current_date();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(c.current_date(), paused_at);
        assert!(c.has_ticker());

        assert!(!c.pause());
        assert!(c.resume());
        assert!(!c.resume());
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(c.current_date() > paused_at);
        c.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let c = controller(date(2025, 1, 1), TimeUnit::Year);
        c.start().unwrap();
        assert!(c.stop().await.unwrap());
        assert!(!c.stop().await.unwrap());
        assert_eq!(c.status(), ControllerStatus::Stopped);
    }

    #[tokio::test]
    async fn start_while_running_is_refused() {
        let c = controller(date(2025, 1, 1), TimeUnit::Year);
        c.start().unwrap();
        assert!(matches!(
            c.start(),
            Err(ControlError::InvalidState { operation: "start", .. })
        ));
        c.stop().await.unwrap();
    }

    #[tokio::test]
    async fn step_while_running_is_refused() {
        let c = controller(date(2025, 1, 1), TimeUnit::Year);
        c.start().unwrap();
        let result = c.step(1);
        assert!(matches!(
            result,
            Err(ControlError::InvalidState {
                status: ControllerStatus::Running,
                ..
            })
        ));
        assert_eq!(c.current_date(), date(2025, 1, 1));
        c.stop().await.unwrap();
    }

    #[tokio::test]
    async fn step_zero_is_invalid() {
        let c = controller(date(2025, 1, 1), TimeUnit::Year);
        assert!(matches!(c.step(0), Err(ControlError::InvalidArgument { .. })));
    }

    #[tokio::test]
    async fn step_from_paused_restores_paused() {
        let c = controller(date(2025, 1, 1), TimeUnit::Year);
        c.start().unwrap();
        assert!(c.pause());
        let seen = collect(&c);

        assert_eq!(c.step(3).unwrap(), date(2028, 1, 1));
        assert_eq!(c.status(), ControllerStatus::Paused);

        let seen = seen.lock().unwrap();
        let progress: Vec<u32> = seen
            .iter()
            .filter_map(|n| match n {
                ControlNotification::Progress { completed, .. } => Some(*completed),
                _ => None,
            })
            .collect();
        assert_eq!(progress, vec![1, 2, 3]);
        assert!(matches!(
            seen.last(),
            Some(ControlNotification::Stepped { ticks: 3, .. })
        ));
        drop(seen);
        c.stop().await.unwrap();
    }

    #[tokio::test]
    async fn single_step_reports_no_progress() {
        let c = controller(date(2025, 1, 1), TimeUnit::Month);
        let seen = collect(&c);
        assert_eq!(c.step(1).unwrap(), date(2025, 2, 1));
        assert_eq!(c.status(), ControllerStatus::Stopped);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(matches!(seen.first(), Some(ControlNotification::Stepped { .. })));
    }

    #[tokio::test]
    async fn speed_outside_bounds_is_rejected() {
        let c = controller(date(2025, 1, 1), TimeUnit::Year);
        assert!(matches!(c.set_speed(0.05), Err(ControlError::InvalidArgument { .. })));
        assert!(matches!(c.set_speed(15.0), Err(ControlError::InvalidArgument { .. })));
        assert!(matches!(c.set_speed(f64::NAN), Err(ControlError::InvalidArgument { .. })));
        assert!((c.speed() - 1.0).abs() < f64::EPSILON);

        let previous = c.set_speed(2.0).unwrap();
        assert!((previous - 1.0).abs() < f64::EPSILON);
        assert!((c.speed() - 2.0).abs() < f64::EPSILON);
        assert_eq!(c.tick_period(), Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn speed_change_while_running_applies_immediately() {
        let c = controller(date(2025, 1, 1), TimeUnit::Day);
        c.start().unwrap();
        c.set_speed(2.0).unwrap();
        assert!(c.has_ticker());

        // 50ms period now: ticks at 50, 100, 150, 200.
        tokio::time::sleep(Duration::from_millis(220)).await;
        assert_eq!(c.current_date(), date(2025, 1, 5));
        c.stop().await.unwrap();
    }

    #[tokio::test]
    async fn seek_validates_target() {
        let c = controller(date(2025, 1, 1), TimeUnit::Year);
        assert!(matches!(
            c.seek_to(date(2024, 1, 1)),
            Err(ControlError::InvalidArgument { .. })
        ));
        assert!(matches!(
            c.seek_to(date(2025, 1, 1)),
            Err(ControlError::InvalidArgument { .. })
        ));
        assert!(matches!(
            c.seek_to(date(2027, 6, 1)),
            Err(ControlError::Clock {
                source: ClockError::NotAligned { .. }
            })
        ));
        assert_eq!(c.current_date(), date(2025, 1, 1));
        assert_eq!(c.status(), ControllerStatus::Stopped);
    }

    #[tokio::test]
    async fn seek_advances_in_chunks() {
        let c = controller(date(2025, 1, 1), TimeUnit::Year);
        let seen = collect(&c);

        assert_eq!(c.seek_to(date(2050, 1, 1)).unwrap(), date(2050, 1, 1));
        assert_eq!(c.status(), ControllerStatus::Stopped);
        assert_eq!(c.clock().ticks(), 25);

        let seen = seen.lock().unwrap();
        let progress: Vec<u32> = seen
            .iter()
            .filter_map(|n| match n {
                ControlNotification::Progress {
                    operation: ControlOperation::Seek,
                    completed,
                    ..
                } => Some(*completed),
                _ => None,
            })
            .collect();
        assert_eq!(progress, vec![10, 20, 25]);
        assert!(matches!(
            seen.last(),
            Some(ControlNotification::Seeked { ticks: 25, .. })
        ));
    }

    #[tokio::test]
    async fn seek_while_running_is_refused() {
        let c = controller(date(2025, 1, 1), TimeUnit::Year);
        c.start().unwrap();
        assert!(matches!(
            c.seek_to(date(2030, 1, 1)),
            Err(ControlError::InvalidState { .. })
        ));
        c.stop().await.unwrap();
    }

    #[tokio::test]
    async fn failing_step_enters_error_and_start_recovers() {
        let c = controller(date(2025, 1, 1), TimeUnit::Year);
        let failing = c
            .bus()
            .register_processor(Arc::new(AlwaysFails(EventType::TIME_ADVANCED)));
        let seen = collect(&c);

        let result = c.step(2);
        assert!(matches!(result, Err(ControlError::Clock { .. })));
        assert_eq!(c.status(), ControllerStatus::Error);
        // The first tick moved the date before its processing failed.
        assert_eq!(c.current_date(), date(2026, 1, 1));
        assert!(matches!(
            seen.lock().unwrap().last(),
            Some(ControlNotification::Error {
                operation: ControlOperation::Step,
                ..
            })
        ));

        // A later successful step puts back the status it found.
        assert!(c.bus().unregister_processor(failing));
        assert_eq!(c.step(1).unwrap(), date(2027, 1, 1));
        assert_eq!(c.status(), ControllerStatus::Error);

        c.start().unwrap();
        assert_eq!(c.status(), ControllerStatus::Running);
        c.stop().await.unwrap();
    }

    #[tokio::test]
    async fn successful_seek_keeps_error_status() {
        let c = controller(date(2025, 1, 1), TimeUnit::Year);
        let failing = c
            .bus()
            .register_processor(Arc::new(AlwaysFails(EventType::TIME_ADVANCED)));
        assert!(c.step(1).is_err());
        assert_eq!(c.status(), ControllerStatus::Error);

        c.bus().unregister_processor(failing);
        assert_eq!(c.seek_to(date(2030, 1, 1)).unwrap(), date(2030, 1, 1));
        assert_eq!(c.status(), ControllerStatus::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn ticker_failure_keeps_running_and_repeats() {
        let c = controller(date(2025, 1, 1), TimeUnit::Day);
        c.bus()
            .register_processor(Arc::new(AlwaysFails(EventType::TIME_ADVANCED)));
        let seen = collect(&c);

        c.start().unwrap();
        tokio::time::sleep(Duration::from_millis(350)).await;

        // Preserved behavior: the failure does not stop the ticker.
        assert_eq!(c.status(), ControllerStatus::Running);
        let errors = seen
            .lock()
            .unwrap()
            .iter()
            .filter(|n| {
                matches!(
                    n,
                    ControlNotification::Error {
                        operation: ControlOperation::Tick,
                        ..
                    }
                )
            })
            .count();
        assert_eq!(errors, 3);
        assert_eq!(c.current_date(), date(2025, 1, 4));
        c.stop().await.unwrap();
    }

    #[tokio::test]
    async fn listener_cannot_reenter_step() {
        let c = controller(date(2025, 1, 1), TimeUnit::Year);
        let outcome = Arc::new(StdMutex::new(None));
        let inner = c.clone();
        let record = Arc::clone(&outcome);
        c.register_listener(Arc::new(
            move |n: &ControlNotification| -> Result<(), ListenerError> {
                if matches!(n, ControlNotification::Progress { completed: 1, .. }) {
                    *record.lock().unwrap() = Some(inner.step(1).map_err(|e| e.to_string()));
                }
                Ok(())
            },
        ));

        assert_eq!(c.step(2).unwrap(), date(2027, 1, 1));
        let outcome = outcome.lock().unwrap().clone();
        assert!(matches!(outcome, Some(Err(ref message)) if message.contains("inside")));
    }

    #[tokio::test]
    async fn failing_control_listener_does_not_block_others() {
        let c = controller(date(2025, 1, 1), TimeUnit::Year);
        c.register_listener(Arc::new(|_: &ControlNotification| -> Result<(), ListenerError> {
            Err(ListenerError::new("console detached"))
        }));
        let seen = collect(&c);
        c.step(1).unwrap();
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn time_unit_change_updates_period() {
        let c = controller(date(2025, 1, 1), TimeUnit::Year);
        assert_eq!(c.tick_period(), Duration::from_millis(1000));
        assert_eq!(c.set_time_unit(TimeUnit::Month).unwrap(), TimeUnit::Year);
        assert_eq!(c.tick_period(), Duration::from_millis(500));
        assert_eq!(c.step(1).unwrap(), date(2025, 2, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn unit_change_repaces_running_ticker() {
        let c = controller(date(2025, 1, 1), TimeUnit::Year);
        c.start().unwrap();
        assert_eq!(c.set_time_unit(TimeUnit::Day).unwrap(), TimeUnit::Year);
        assert!(c.has_ticker());

        // 100ms period from the change on: five ticks by 550ms.
        tokio::time::sleep(Duration::from_millis(550)).await;
        assert_eq!(c.current_date(), date(2025, 1, 6));
        c.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn clock_unit_change_repaces_running_ticker() {
        let c = controller(date(2025, 1, 1), TimeUnit::Year);
        c.start().unwrap();
        c.clock().set_time_unit(TimeUnit::Day);

        tokio::time::sleep(Duration::from_millis(550)).await;
        assert_eq!(c.current_date(), date(2025, 1, 6));
        assert_eq!(c.tick_period(), Duration::from_millis(100));
        c.stop().await.unwrap();
    }

    /// Blocks every tick for `hold`, after flagging that it started.
    struct Blocking {
        hold: Duration,
        entered: Arc<std::sync::atomic::AtomicBool>,
    }

    impl EventProcessor for Blocking {
        fn name(&self) -> &str {
            "blocking"
        }

        fn supported_types(&self) -> Vec<EventType> {
            vec![EventType::TIME_ADVANCED]
        }

        fn process(&self, _event: &Event) -> Result<(), ProcessorError> {
            self.entered.store(true, Ordering::Release);
            std::thread::sleep(self.hold);
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_is_bounded_by_timeout_while_a_tick_blocks() {
        let clock = Arc::new(Clock::new(date(2025, 1, 1), TimeUnit::Day));
        let bus = Arc::new(EventBus::new());
        let scheduler = Scheduler::attach(Arc::clone(&clock), Arc::clone(&bus));
        let config = ControllerConfig {
            stop_timeout_ms: 100,
            day_interval_ms: 10,
            ..ControllerConfig::default()
        };
        let c = Controller::new(clock, bus, scheduler, config, Handle::current()).unwrap();
        let entered = Arc::new(std::sync::atomic::AtomicBool::new(false));
        c.bus().register_processor(Arc::new(Blocking {
            hold: Duration::from_millis(1500),
            entered: Arc::clone(&entered),
        }));

        c.start().unwrap();
        while !entered.load(Ordering::Acquire) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let began = std::time::Instant::now();
        assert!(c.stop().await.unwrap());
        assert!(began.elapsed() < Duration::from_secs(1));
        assert_eq!(c.status(), ControllerStatus::Stopped);
        assert!(!c.has_ticker());
    }

    /// On each tick, calls `set_speed` and `set_time_unit` from another
    /// thread and records the outcomes.
    struct ControlsFromElsewhere {
        controller: StdMutex<Option<Controller>>,
        outcomes: Arc<StdMutex<Vec<Option<ControllerStatus>>>>,
    }

    impl EventProcessor for ControlsFromElsewhere {
        fn name(&self) -> &str {
            "controls-from-elsewhere"
        }

        fn supported_types(&self) -> Vec<EventType> {
            vec![EventType::TIME_ADVANCED]
        }

        fn process(&self, _event: &Event) -> Result<(), ProcessorError> {
            let Some(controller) = self.controller.lock().unwrap().clone() else {
                return Ok(());
            };
            let outcomes = std::thread::spawn(move || {
                let refused = |result: Result<(), ControlError>| match result {
                    Err(ControlError::InvalidState { status, .. }) => Some(status),
                    _ => None,
                };
                vec![
                    refused(controller.set_speed(2.0).map(|_| ())),
                    refused(controller.set_time_unit(TimeUnit::Day).map(|_| ())),
                ]
            })
            .join()
            .unwrap();
            self.outcomes.lock().unwrap().extend(outcomes);
            Ok(())
        }
    }

    #[tokio::test]
    async fn speed_and_unit_changes_are_refused_while_stepping() {
        let c = controller(date(2025, 1, 1), TimeUnit::Year);
        let outcomes = Arc::new(StdMutex::new(Vec::new()));
        let processor = Arc::new(ControlsFromElsewhere {
            controller: StdMutex::new(Some(c.clone())),
            outcomes: Arc::clone(&outcomes),
        });
        c.bus().register_processor(Arc::clone(&processor) as Arc<dyn EventProcessor>);

        assert_eq!(c.step(1).unwrap(), date(2026, 1, 1));
        processor.controller.lock().unwrap().take();

        assert_eq!(
            *outcomes.lock().unwrap(),
            vec![Some(ControllerStatus::Stepping), Some(ControllerStatus::Stepping)]
        );
        assert!((c.speed() - 1.0).abs() < f64::EPSILON);
        assert_eq!(c.clock().time_unit(), TimeUnit::Year);
    }

    #[tokio::test]
    async fn report_reflects_state() {
        let c = controller(date(2025, 1, 1), TimeUnit::Year);
        c.step(2).unwrap();
        let report = c.status_report();
        assert_eq!(report.status, ControllerStatus::Stopped);
        assert_eq!(report.current_date, date(2027, 1, 1));
        assert_eq!(report.ticks, 2);
        assert_eq!(report.tick_period_ms, 1000);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "STOPPED");
        assert_eq!(json["time_unit"], "year");
    }
}
