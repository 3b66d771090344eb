//! Enumeration types shared by the kernel and its collaborators.

use chrono::{Days, Months, NaiveDate};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Time unit
// ---------------------------------------------------------------------------

/// The calendar increment applied to the simulated date on every tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    /// One calendar day per tick.
    Day,
    /// One calendar month per tick.
    Month,
    /// One calendar year per tick.
    Year,
}

impl TimeUnit {
    /// All units, finest first.
    pub const ALL: [Self; 3] = [Self::Day, Self::Month, Self::Year];

    /// Apply `count` increments of this unit to `date`, one at a time.
    ///
    /// Month and year increments clamp to the end of shorter months
    /// (2025-01-31 plus one month is 2025-02-28), and every increment starts
    /// from the previous result, so three monthly ticks from 2025-01-31 land
    /// on 2025-04-28. Returns `None` if the calendar range is exceeded.
    pub fn add_to(self, date: NaiveDate, count: u32) -> Option<NaiveDate> {
        match self {
            // Day increments never clamp, a single jump is identical.
            Self::Day => date.checked_add_days(Days::new(u64::from(count))),
            Self::Month | Self::Year => {
                let mut current = date;
                for _ in 0..count {
                    current = self.next_after(current)?;
                }
                Some(current)
            }
        }
    }

    /// The date one tick after `date`, or `None` on calendar overflow.
    pub fn next_after(self, date: NaiveDate) -> Option<NaiveDate> {
        match self {
            Self::Day => date.checked_add_days(Days::new(1)),
            Self::Month => date.checked_add_months(Months::new(1)),
            Self::Year => date.checked_add_months(Months::new(12)),
        }
    }

    /// Lowercase name used in configuration files and event payloads.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Day => "day",
            Self::Month => "month",
            Self::Year => "year",
        }
    }
}

impl core::fmt::Display for TimeUnit {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for TimeUnit {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "day" | "days" => Ok(Self::Day),
            "month" | "months" => Ok(Self::Month),
            "year" | "years" => Ok(Self::Year),
            other => Err(format!("unknown time unit: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Controller status
// ---------------------------------------------------------------------------

/// Run-state of the simulation controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum ControllerStatus {
    /// The controller is being constructed.
    Initializing = 0,
    /// Not advancing; the ticker is not running.
    Stopped = 1,
    /// The background ticker advances the clock.
    Running = 2,
    /// The ticker fires but does not advance the clock.
    Paused = 3,
    /// A synchronous multi-tick step is in progress.
    Stepping = 4,
    /// A synchronous seek to a target date is in progress.
    Seeking = 5,
    /// The last synchronous step or seek failed.
    Error = 6,
}

impl ControllerStatus {
    /// Compact representation used for lock-free status storage.
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Inverse of [`as_u8`](Self::as_u8). Unknown values map to `None`.
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Initializing),
            1 => Some(Self::Stopped),
            2 => Some(Self::Running),
            3 => Some(Self::Paused),
            4 => Some(Self::Stepping),
            5 => Some(Self::Seeking),
            6 => Some(Self::Error),
            _ => None,
        }
    }

    /// Whether `start()` is allowed from this status.
    pub const fn can_start(self) -> bool {
        matches!(self, Self::Stopped | Self::Paused | Self::Error)
    }

    /// Whether a synchronous step or seek is in progress.
    pub const fn is_busy(self) -> bool {
        matches!(self, Self::Stepping | Self::Seeking)
    }
}

impl core::fmt::Display for ControllerStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            Self::Initializing => "INITIALIZING",
            Self::Stopped => "STOPPED",
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::Stepping => "STEPPING",
            Self::Seeking => "SEEKING",
            Self::Error => "ERROR",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn year_increment_keeps_day_and_month() {
        assert_eq!(TimeUnit::Year.next_after(date(2025, 1, 1)), Some(date(2026, 1, 1)));
    }

    #[test]
    fn month_increment_clamps_to_month_end() {
        assert_eq!(TimeUnit::Month.next_after(date(2025, 1, 31)), Some(date(2025, 2, 28)));
        assert_eq!(TimeUnit::Month.next_after(date(2024, 1, 31)), Some(date(2024, 2, 29)));
    }

    #[test]
    fn repeated_month_increments_drift_after_clamping() {
        assert_eq!(TimeUnit::Month.add_to(date(2025, 1, 31), 3), Some(date(2025, 4, 28)));
    }

    #[test]
    fn leap_day_plus_one_year_clamps() {
        assert_eq!(TimeUnit::Year.next_after(date(2024, 2, 29)), Some(date(2025, 2, 28)));
    }

    #[test]
    fn day_increment_crosses_year_boundary() {
        assert_eq!(TimeUnit::Day.add_to(date(2025, 12, 31), 2), Some(date(2026, 1, 2)));
    }

    #[test]
    fn overflow_is_reported_as_none() {
        assert_eq!(TimeUnit::Year.next_after(NaiveDate::MAX), None);
    }

    #[test]
    fn time_unit_parses_case_insensitively() {
        assert_eq!("YEAR".parse::<TimeUnit>(), Ok(TimeUnit::Year));
        assert_eq!("months".parse::<TimeUnit>(), Ok(TimeUnit::Month));
        assert!("fortnight".parse::<TimeUnit>().is_err());
    }

    #[test]
    fn status_roundtrips_through_u8() {
        for status in [
            ControllerStatus::Initializing,
            ControllerStatus::Stopped,
            ControllerStatus::Running,
            ControllerStatus::Paused,
            ControllerStatus::Stepping,
            ControllerStatus::Seeking,
            ControllerStatus::Error,
        ] {
            assert_eq!(ControllerStatus::from_u8(status.as_u8()), Some(status));
        }
        assert_eq!(ControllerStatus::from_u8(42), None);
    }

    #[test]
    fn only_idle_states_can_start() {
        assert!(ControllerStatus::Stopped.can_start());
        assert!(ControllerStatus::Paused.can_start());
        assert!(ControllerStatus::Error.can_start());
        assert!(!ControllerStatus::Running.can_start());
        assert!(!ControllerStatus::Stepping.can_start());
    }
}
