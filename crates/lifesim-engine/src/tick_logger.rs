//! Built-in processor that logs every simulated tick.

use std::sync::atomic::{AtomicU64, Ordering};

use lifesim_core::{EventProcessor, ProcessorError};
use lifesim_types::{Event, EventType};
use tracing::info;

/// Logs each `time.advanced` event and counts them.
///
/// Runs last so domain processors see the tick first.
#[derive(Debug, Default)]
pub struct TickLogger {
    ticks: AtomicU64,
}

impl TickLogger {
    /// Ticks observed so far.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }
}

impl EventProcessor for TickLogger {
    fn name(&self) -> &str {
        "tick-logger"
    }

    fn supported_types(&self) -> Vec<EventType> {
        vec![EventType::TIME_ADVANCED]
    }

    fn priority(&self) -> i32 {
        i32::MIN
    }

    fn process(&self, event: &Event) -> Result<(), ProcessorError> {
        let tick = self.ticks.fetch_add(1, Ordering::Relaxed).saturating_add(1);
        let previous = event
            .property("previous_date")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("?");
        info!(tick, date = %event.event_date(), previous, "Tick");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::NaiveDate;

    use super::*;

    #[test]
    fn counts_ticks() {
        let logger = TickLogger::default();
        let event = Event::builder(
            EventType::TIME_ADVANCED,
            NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
        )
        .property("previous_date", "2025-01-01")
        .build();

        logger.process(&event).unwrap();
        logger.process(&event).unwrap();
        assert_eq!(logger.ticks(), 2);
        assert_eq!(logger.priority(), i32::MIN);
    }
}
