//! Schedule types: timing modes and calendar constraints.

use crate::error::{Result, SchedulerError};
use crate::time::{first_business_day_of_month, last_business_day_of_month, TimeUnit};
use chrono::{Datelike, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How a task fires. The modes are mutually exclusive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TimingMode {
    /// Fire once after `delay`.
    OneShotDelay {
        /// Amount of `unit` to wait.
        delay: u64,
        /// Unit of `delay`.
        unit: TimeUnit,
    },
    /// Fire every `period`, measured from each start.
    FixedRate {
        /// Amount of `unit` between starts.
        period: u64,
        /// Unit of `period`.
        unit: TimeUnit,
        /// Wait before the first firing.
        initial_delay: Duration,
    },
    /// Fire `spaced_delay` after the previous firing completes.
    FixedDelay {
        /// Amount of `unit` between a completion and the next start.
        spaced_delay: u64,
        /// Unit of `spaced_delay`.
        unit: TimeUnit,
        /// Wait before the first firing.
        initial_delay: Duration,
    },
    /// Fire once per eligible day at the constraint anchor time.
    Calendar,
}

impl TimingMode {
    /// Short label used in logs and configuration errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::OneShotDelay { .. } => "one-shot",
            Self::FixedRate { .. } => "fixed-rate",
            Self::FixedDelay { .. } => "fixed-delay",
            Self::Calendar => "calendar",
        }
    }

    /// The interval that separates consecutive firings, if the mode has one.
    pub fn interval(&self) -> Option<Duration> {
        match self {
            Self::OneShotDelay { delay, unit } => Some(unit.to_duration(*delay)),
            Self::FixedRate { period, unit, .. } => Some(unit.to_duration(*period)),
            Self::FixedDelay { spaced_delay, unit, .. } => Some(unit.to_duration(*spaced_delay)),
            Self::Calendar => None,
        }
    }

    /// Wait before the first firing of an interval mode.
    pub fn initial_delay(&self) -> Duration {
        match self {
            Self::OneShotDelay { delay, unit } => unit.to_duration(*delay),
            Self::FixedRate { initial_delay, .. } | Self::FixedDelay { initial_delay, .. } => {
                *initial_delay
            }
            Self::Calendar => Duration::ZERO,
        }
    }

    /// Check if this mode keeps firing after the first run.
    pub fn is_recurring(&self) -> bool {
        !matches!(self, Self::OneShotDelay { .. })
    }

    /// Validate the mode values.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::FixedRate { period: 0, .. } => Err(SchedulerError::Configuration(
                "fixed-rate period must be greater than 0".into(),
            )),
            Self::FixedDelay { spaced_delay: 0, .. } => Err(SchedulerError::Configuration(
                "fixed-delay spacing must be greater than 0".into(),
            )),
            _ => Ok(()),
        }
    }
}

/// Calendar and window constraints. Unset constraints always hold.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraints {
    /// Day of the month, 1-31. 0 = unset.
    pub day_of_month: u32,
    /// ISO day of the week, 1 (Monday) to 7 (Sunday). 0 = unset.
    pub day_of_week: u32,
    /// Month of the year used by `annually`, 1-12. 0 = unset.
    pub month_of_year: u32,
    pub weekends_only: bool,
    pub weekdays_only: bool,
    pub first_business_day: bool,
    pub last_business_day: bool,
    /// Restrict to `month_of_year`/`day_of_month` once a year.
    pub annually: bool,
    /// Start of the time-of-day window (inclusive).
    pub start_time: Option<NaiveTime>,
    /// End of the time-of-day window (inclusive). Earlier than `start_time`
    /// means the window wraps midnight.
    pub end_time: Option<NaiveTime>,
    /// Absolute validity window start.
    pub start_on: Option<NaiveDateTime>,
    /// Absolute validity window end.
    pub end_on: Option<NaiveDateTime>,
    /// Clock time calendar firings happen at.
    pub task_time: Option<NaiveTime>,
}

impl Constraints {
    /// Time of day a calendar firing is anchored to.
    pub fn anchor_time(&self) -> NaiveTime {
        self.task_time
            .or(self.start_time)
            .unwrap_or(NaiveTime::MIN)
    }

    /// True if any day-level constraint is configured.
    pub fn has_day_constraints(&self) -> bool {
        self.day_of_month > 0
            || self.day_of_week > 0
            || self.weekends_only
            || self.weekdays_only
            || self.first_business_day
            || self.last_business_day
            || self.annually
    }

    /// Validate ranges and exclusive combinations.
    pub fn validate(&self) -> Result<()> {
        if self.day_of_month > 31 {
            return Err(SchedulerError::Configuration(format!(
                "day of the month must be between 1 and 31, got {}",
                self.day_of_month
            )));
        }
        if self.day_of_week > 7 {
            return Err(SchedulerError::Configuration(format!(
                "day of the week must be between 1 and 7, got {}",
                self.day_of_week
            )));
        }
        if self.month_of_year > 12 {
            return Err(SchedulerError::Configuration(format!(
                "month of the year must be between 1 and 12, got {}",
                self.month_of_year
            )));
        }
        if self.weekends_only && self.weekdays_only {
            return Err(SchedulerError::Configuration(
                "weekends only and weekdays only are mutually exclusive".into(),
            ));
        }
        if self.first_business_day && self.last_business_day {
            return Err(SchedulerError::Configuration(
                "first and last business day are mutually exclusive".into(),
            ));
        }
        if self.annually && (self.month_of_year == 0 || self.day_of_month == 0) {
            return Err(SchedulerError::Configuration(
                "annual schedules need both a month and a day".into(),
            ));
        }
        if let (Some(start), Some(end)) = (self.start_on, self.end_on) {
            if start > end {
                return Err(SchedulerError::Configuration(format!(
                    "start date {start} is after end date {end}"
                )));
            }
        }
        Ok(())
    }

    /// Absolute validity window.
    pub fn within_validity(&self, at: NaiveDateTime) -> bool {
        if self.start_on.is_some_and(|start| at < start) {
            return false;
        }
        !self.end_on.is_some_and(|end| at > end)
    }

    /// Time-of-day window.
    pub fn within_time_window(&self, at: NaiveTime) -> bool {
        match (self.start_time, self.end_time) {
            (None, None) => true,
            (Some(start), None) => at >= start,
            (None, Some(end)) => at <= end,
            (Some(start), Some(end)) if start <= end => at >= start && at <= end,
            // Overnight window, e.g. 22:00 - 06:00.
            (Some(start), Some(end)) => at >= start || at <= end,
        }
    }

    /// Day-level constraints for the date of `at`.
    pub fn matches_day(&self, at: NaiveDateTime) -> bool {
        let date = at.date();
        let weekday = date.weekday().number_from_monday();

        if self.day_of_month > 0 && date.day() != self.day_of_month {
            return false;
        }
        if self.day_of_week > 0 && weekday != self.day_of_week {
            return false;
        }
        if self.weekends_only && weekday <= 5 {
            return false;
        }
        if self.weekdays_only && weekday > 5 {
            return false;
        }
        if self.first_business_day && date != first_business_day_of_month(date) {
            return false;
        }
        if self.last_business_day && date != last_business_day_of_month(date) {
            return false;
        }
        if self.annually && self.month_of_year > 0 && date.month() != self.month_of_year {
            return false;
        }
        true
    }

    /// All constraints, evaluated against a wall-clock instant in the task's timezone.
    pub fn admits(&self, at: NaiveDateTime) -> bool {
        self.within_validity(at) && self.within_time_window(at.time()) && self.matches_day(at)
    }
}
