//! Control-level notifications and where they go.
//!
//! The controller reports every state change as a [`ControlNotification`].
//! Notifications are delivered synchronously to every registered
//! [`ControlListener`] (best effort, like clock listeners) and to at most one
//! [`FeedbackSink`], the display-side collaborator (console UI, log output).

use chrono::NaiveDate;
use lifesim_types::TimeUnit;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::listener::ListenerError;

/// The controller operation a notification refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlOperation {
    /// A tick of the background ticker.
    Tick,
    /// A synchronous `step`.
    Step,
    /// A synchronous `seek_to`.
    Seek,
}

impl core::fmt::Display for ControlOperation {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            Self::Tick => "tick",
            Self::Step => "step",
            Self::Seek => "seek",
        };
        f.write_str(name)
    }
}

/// Something the controller did, or failed to do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ControlNotification {
    /// The ticker started (or took over from a pause via `start`).
    Started {
        /// Simulated date at the time of the transition.
        date: NaiveDate,
    },
    /// The ticker keeps firing but no longer advances the clock.
    Paused {
        /// Simulated date at the time of the transition.
        date: NaiveDate,
    },
    /// Advancing resumed after a pause.
    Resumed {
        /// Simulated date at the time of the transition.
        date: NaiveDate,
    },
    /// The ticker was torn down.
    Stopped {
        /// Simulated date at the time of the transition.
        date: NaiveDate,
    },
    /// A `step` finished.
    Stepped {
        /// Date before the step.
        from: NaiveDate,
        /// Date after the step.
        to: NaiveDate,
        /// Number of ticks performed.
        ticks: u32,
    },
    /// Intermediate progress of a multi-tick `step` or a `seek_to`.
    Progress {
        /// Which operation is progressing.
        operation: ControlOperation,
        /// Ticks done so far.
        completed: u32,
        /// Ticks the operation will perform in total.
        total: u32,
        /// Simulated date reached so far.
        date: NaiveDate,
    },
    /// A `seek_to` finished.
    Seeked {
        /// Date before the seek.
        from: NaiveDate,
        /// Date after the seek.
        to: NaiveDate,
        /// Number of ticks performed.
        ticks: u32,
    },
    /// The speed factor changed.
    SpeedChanged {
        /// Previous factor.
        previous: f64,
        /// New factor.
        current: f64,
    },
    /// The time unit changed.
    TimeUnitChanged {
        /// Previous unit.
        previous: TimeUnit,
        /// New unit.
        current: TimeUnit,
    },
    /// An operation failed while advancing the clock.
    Error {
        /// The failing operation.
        operation: ControlOperation,
        /// Simulated date when the failure surfaced.
        date: NaiveDate,
        /// Rendered error.
        message: String,
    },
}

impl ControlNotification {
    /// Short name of the notification kind, used in logs.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Started { .. } => "started",
            Self::Paused { .. } => "paused",
            Self::Resumed { .. } => "resumed",
            Self::Stopped { .. } => "stopped",
            Self::Stepped { .. } => "stepped",
            Self::Progress { .. } => "progress",
            Self::Seeked { .. } => "seeked",
            Self::SpeedChanged { .. } => "speed_changed",
            Self::TimeUnitChanged { .. } => "time_unit_changed",
            Self::Error { .. } => "error",
        }
    }
}

/// Observer of control notifications.
///
/// Errors are logged and suppressed; other listeners are still notified.
pub trait ControlListener: Send + Sync {
    /// Receive one notification.
    fn on_control(&self, notification: &ControlNotification) -> Result<(), ListenerError>;
}

impl<F> ControlListener for F
where
    F: Fn(&ControlNotification) -> Result<(), ListenerError> + Send + Sync,
{
    fn on_control(&self, notification: &ControlNotification) -> Result<(), ListenerError> {
        self(notification)
    }
}

/// Display-side consumer of control notifications.
pub trait FeedbackSink: Send + Sync {
    /// Show one notification to the user.
    fn show(&self, notification: &ControlNotification);
}

/// Feedback sink that writes notifications to the `tracing` log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingFeedback;

impl FeedbackSink for TracingFeedback {
    fn show(&self, notification: &ControlNotification) {
        match notification {
            ControlNotification::Started { date }
            | ControlNotification::Paused { date }
            | ControlNotification::Resumed { date }
            | ControlNotification::Stopped { date } => {
                info!(kind = notification.kind(), date = %date, "Simulation control");
            }
            ControlNotification::Stepped { from, to, ticks }
            | ControlNotification::Seeked { from, to, ticks } => {
                info!(kind = notification.kind(), from = %from, to = %to, ticks, "Simulation control");
            }
            ControlNotification::Progress {
                operation,
                completed,
                total,
                date,
            } => {
                info!(operation = %operation, completed, total, date = %date, "Progress");
            }
            ControlNotification::SpeedChanged { previous, current } => {
                info!(previous, current, "Speed changed");
            }
            ControlNotification::TimeUnitChanged { previous, current } => {
                info!(previous = %previous, current = %current, "Time unit changed");
            }
            ControlNotification::Error {
                operation,
                date,
                message,
            } => {
                error!(operation = %operation, date = %date, error = message, "Simulation error");
            }
        }
    }
}
