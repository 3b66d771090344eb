//! One-call assembly of clock, bus, scheduler, and controller.

use std::sync::Arc;

use tokio::runtime::Handle;
use tracing::info;

use crate::bus::EventBus;
use crate::clock::{Clock, ClockError, ClockSnapshot};
use crate::config::{ConfigError, KernelConfig};
use crate::controller::{ControlError, Controller};
use crate::scheduler::Scheduler;

/// Errors that can occur while assembling a kernel.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    /// The configuration did not validate.
    #[error("config error: {source}")]
    Config {
        /// The underlying config error.
        #[from]
        source: ConfigError,
    },

    /// A clock snapshot could not be restored.
    #[error("clock error: {source}")]
    Clock {
        /// The underlying clock error.
        #[from]
        source: ClockError,
    },

    /// The controller refused its configuration.
    #[error("controller error: {source}")]
    Control {
        /// The underlying controller error.
        #[from]
        source: ControlError,
    },
}

/// The four kernel components, wired together.
///
/// The scheduler is installed as the clock's tick handler and the
/// controller drives the clock. Domain modules register processors on
/// [`bus`](Self::bus) and schedule events on
/// [`scheduler`](Self::scheduler).
#[derive(Debug, Clone)]
pub struct Kernel {
    clock: Arc<Clock>,
    bus: Arc<EventBus>,
    scheduler: Arc<Scheduler>,
    controller: Controller,
}

impl Kernel {
    /// Build a fresh kernel starting at `config.clock.start_date`.
    ///
    /// `runtime` is where the controller spawns its ticker.
    pub fn new(config: &KernelConfig, runtime: Handle) -> Result<Self, KernelError> {
        config.validate()?;
        Self::assemble(Clock::from_config(&config.clock), config, runtime)
    }

    /// Build a kernel whose clock resumes from `snapshot`.
    ///
    /// The snapshot's start date, current date, and time unit win over
    /// `config.clock`; the controller settings still come from `config`.
    pub fn restore(
        config: &KernelConfig,
        snapshot: ClockSnapshot,
        runtime: Handle,
    ) -> Result<Self, KernelError> {
        config.validate()?;
        Self::assemble(Clock::restore(snapshot)?, config, runtime)
    }

    fn assemble(clock: Clock, config: &KernelConfig, runtime: Handle) -> Result<Self, KernelError> {
        let clock = Arc::new(clock);
        let bus = Arc::new(EventBus::new());
        let scheduler = Scheduler::attach(Arc::clone(&clock), Arc::clone(&bus));
        let controller = Controller::new(
            Arc::clone(&clock),
            Arc::clone(&bus),
            Arc::clone(&scheduler),
            config.controller.clone(),
            runtime,
        )?;
        info!(
            start_date = %clock.start_date(),
            current_date = %clock.current_date(),
            time_unit = %clock.time_unit(),
            "Kernel assembled"
        );
        Ok(Self {
            clock,
            bus,
            scheduler,
            controller,
        })
    }

    /// The simulation clock.
    pub const fn clock(&self) -> &Arc<Clock> {
        &self.clock
    }

    /// The event bus.
    pub const fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// The date-addressed event queue.
    pub const fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// The run-state controller.
    pub const fn controller(&self) -> &Controller {
        &self.controller
    }

    /// Capture the clock state for a later [`restore`](Self::restore).
    ///
    /// Scheduled events are not part of the snapshot.
    pub fn snapshot(&self) -> ClockSnapshot {
        self.clock.snapshot()
    }
}
