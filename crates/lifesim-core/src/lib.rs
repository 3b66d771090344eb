//! Discrete-event kernel for the life simulation.
//!
//! This crate owns simulated time and everything that happens when it
//! moves: a calendar clock, a priority-ordered event bus, a date-addressed
//! scheduler, and the run/pause/step/seek controller that drives them.
//!
//! # Modules
//!
//! - [`clock`] -- Calendar clock advancing in day/month/year ticks, with
//!   listeners, seek validation, and snapshots.
//! - [`bus`] -- [`EventProcessor`] trait and the fail-fast [`EventBus`].
//! - [`scheduler`] -- Events queued against future dates, released on tick.
//! - [`controller`] -- Run-state machine and the background ticker task.
//! - [`feedback`] -- Control notifications, listeners, and feedback sinks.
//! - [`listener`] -- Best-effort listener registry shared by clock and
//!   controller.
//! - [`config`] -- Configuration loading from `lifesim-config.yaml` into
//!   strongly-typed structs.
//! - [`kernel`] -- Assembles the four components from a [`KernelConfig`].
//!
//! [`EventProcessor`]: bus::EventProcessor
//! [`EventBus`]: bus::EventBus
//! [`KernelConfig`]: config::KernelConfig

pub mod bus;
pub mod clock;
pub mod config;
pub mod controller;
pub mod feedback;
pub mod kernel;
pub mod listener;
pub mod scheduler;

pub use bus::{BusError, EventBus, EventProcessor, ProcessorError, ProcessorId};
pub use clock::{Clock, ClockError, ClockListener, ClockSnapshot, TimeChange};
pub use config::{ConfigError, KernelConfig};
pub use controller::{ControlError, Controller, ControllerReport};
pub use feedback::{ControlListener, ControlNotification, FeedbackSink, TracingFeedback};
pub use kernel::{Kernel, KernelError};
pub use listener::{ListenerError, ListenerId};
pub use scheduler::{Scheduler, SchedulerError};
