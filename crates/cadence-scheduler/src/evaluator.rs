//! Eligibility checks and next-run computation.
//!
//! The evaluator holds no state besides its search bound. Everything it
//! needs comes in through the arguments, so the same instance can be shared
//! by every task of a scheduler.

use crate::error::{Result, SchedulerError};
use crate::schedule::{Constraints, TimingMode};
use crate::time::localize;
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, Timelike};
use chrono_tz::Tz;

/// Default bound on the day-by-day calendar search.
pub const DEFAULT_MAX_ITERATIONS: u32 = 400;

/// Decides when a task may fire.
#[derive(Debug, Clone, Copy)]
pub struct TimeWindowEvaluator {
    max_iterations: u32,
}

impl Default for TimeWindowEvaluator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ITERATIONS)
    }
}

impl TimeWindowEvaluator {
    /// Create an evaluator that gives up after `max_iterations` candidates.
    pub fn new(max_iterations: u32) -> Self {
        Self {
            max_iterations: max_iterations.max(1),
        }
    }

    /// Search bound.
    pub fn max_iterations(&self) -> u32 {
        self.max_iterations
    }

    /// Check whether `now` satisfies every configured constraint and the gate.
    ///
    /// Constraints are checked at minute resolution, so a firing that lands a
    /// few milliseconds after an inclusive `end_time` still counts. The gate is
    /// only consulted once every constraint holds.
    pub fn is_eligible_now<G>(&self, constraints: &Constraints, now: DateTime<Tz>, gate: G) -> bool
    where
        G: FnOnce() -> bool,
    {
        let local = truncate_to_minute(now.naive_local());
        constraints.admits(local) && gate()
    }

    /// Compute the next instant strictly after `after` at which the task may fire.
    ///
    /// Interval modes add their interval to `after`. Calendar mode walks forward
    /// one day at a time, probing each day at the anchor time. As in
    /// [`is_eligible_now`](Self::is_eligible_now), the gate is only consulted
    /// for candidates that satisfy every constraint.
    pub fn next_eligible<G>(
        &self,
        task: &str,
        mode: &TimingMode,
        constraints: &Constraints,
        after: DateTime<Tz>,
        mut gate: G,
    ) -> Result<DateTime<Tz>>
    where
        G: FnMut() -> bool,
    {
        match mode {
            TimingMode::Calendar if constraints.annually => {
                self.next_annual(task, constraints, after, &mut gate)
            }
            TimingMode::Calendar => self.next_daily(task, constraints, after, &mut gate),
            interval => {
                let step = interval.interval().unwrap_or_default();
                let step = chrono::Duration::from_std(step).map_err(|_| {
                    SchedulerError::Configuration(format!("interval of task ({task}) is too large"))
                })?;
                after.checked_add_signed(step).ok_or_else(|| {
                    exhausted(task, "next run time is out of range")
                })
            }
        }
    }

    fn next_daily(
        &self,
        task: &str,
        constraints: &Constraints,
        after: DateTime<Tz>,
        gate: &mut dyn FnMut() -> bool,
    ) -> Result<DateTime<Tz>> {
        let tz = after.timezone();
        let anchor = constraints.anchor_time();
        let mut date = after.naive_local().date();
        if let Some(start) = constraints.start_on {
            date = date.max(start.date());
        }

        for _ in 0..self.max_iterations {
            if let Some(found) =
                self.probe(task, &tz, constraints, date.and_time(anchor), after, gate)?
            {
                return Ok(found);
            }
            date = date
                .succ_opt()
                .ok_or_else(|| exhausted(task, "ran past the last representable date"))?;
        }

        Err(exhausted(
            task,
            &format!(
                "no matching day within {} days of {}",
                self.max_iterations,
                after.naive_local()
            ),
        ))
    }

    fn next_annual(
        &self,
        task: &str,
        constraints: &Constraints,
        after: DateTime<Tz>,
        gate: &mut dyn FnMut() -> bool,
    ) -> Result<DateTime<Tz>> {
        let tz = after.timezone();
        let anchor = constraints.anchor_time();
        let mut year = after.naive_local().year();
        if let Some(start) = constraints.start_on {
            year = year.max(start.year());
        }

        for _ in 0..self.max_iterations {
            // Feb 29 and friends only exist in some years.
            if let Some(date) =
                NaiveDate::from_ymd_opt(year, constraints.month_of_year, constraints.day_of_month)
            {
                if let Some(found) =
                    self.probe(task, &tz, constraints, date.and_time(anchor), after, gate)?
                {
                    return Ok(found);
                }
            }
            year += 1;
        }

        Err(exhausted(
            task,
            &format!("no matching date within {} years", self.max_iterations),
        ))
    }

    /// Resolve one candidate. `Ok(None)` moves the search along.
    fn probe(
        &self,
        task: &str,
        tz: &Tz,
        constraints: &Constraints,
        local: NaiveDateTime,
        after: DateTime<Tz>,
        gate: &mut dyn FnMut() -> bool,
    ) -> Result<Option<DateTime<Tz>>> {
        if constraints.end_on.is_some_and(|end| local > end) {
            return Err(exhausted(task, "validity window has ended"));
        }
        let candidate = localize(tz, local);
        if candidate > after && constraints.admits(candidate.naive_local()) && gate() {
            return Ok(Some(candidate));
        }
        Ok(None)
    }
}

fn truncate_to_minute(at: NaiveDateTime) -> NaiveDateTime {
    at.with_second(0)
        .and_then(|at| at.with_nanosecond(0))
        .unwrap_or(at)
}

fn exhausted(task: &str, reason: &str) -> SchedulerError {
    SchedulerError::SearchExhausted {
        task: task.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::TimeUnit;
    use chrono::{NaiveTime, TimeZone, Weekday};
    use std::time::Duration;

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Tz> {
        Tz::UTC.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    fn hm(h: u32, m: u32) -> Option<NaiveTime> {
        NaiveTime::from_hms_opt(h, m, 0)
    }

    fn next(constraints: &Constraints, after: DateTime<Tz>) -> Result<DateTime<Tz>> {
        TimeWindowEvaluator::default().next_eligible(
            "test",
            &TimingMode::Calendar,
            constraints,
            after,
            || true,
        )
    }

    #[test]
    fn test_day_of_month_skips_short_months() {
        let constraints = Constraints {
            day_of_month: 31,
            ..Default::default()
        };
        // April has 30 days, so the first 31st after April 1 is May 31.
        let found = next(&constraints, utc(2024, 4, 1, 12, 0)).unwrap();
        assert_eq!(found, utc(2024, 5, 31, 0, 0));

        // June has 30 days as well.
        let found = next(&constraints, utc(2024, 5, 31, 0, 0)).unwrap();
        assert_eq!(found, utc(2024, 7, 31, 0, 0));
    }

    #[test]
    fn test_weekdays_with_business_hours() {
        let constraints = Constraints {
            weekdays_only: true,
            start_time: hm(9, 0),
            end_time: hm(17, 0),
            ..Default::default()
        };

        // Saturday evening rolls to Monday morning.
        let found = next(&constraints, utc(2024, 6, 1, 19, 0)).unwrap();
        assert_eq!(found, utc(2024, 6, 3, 9, 0));
        assert_eq!(found.weekday(), Weekday::Mon);

        // Before the window on a Tuesday: same day.
        let found = next(&constraints, utc(2024, 6, 4, 7, 0)).unwrap();
        assert_eq!(found, utc(2024, 6, 4, 9, 0));

        // After the window on a Tuesday: Wednesday.
        let found = next(&constraints, utc(2024, 6, 4, 18, 0)).unwrap();
        assert_eq!(found, utc(2024, 6, 5, 9, 0));
    }

    #[test]
    fn test_business_day_constraints() {
        let first = Constraints {
            first_business_day: true,
            task_time: hm(8, 30),
            ..Default::default()
        };
        // June 1 2024 is a Saturday.
        let found = next(&first, utc(2024, 5, 15, 0, 0)).unwrap();
        assert_eq!(found, utc(2024, 6, 3, 8, 30));

        let last = Constraints {
            last_business_day: true,
            task_time: hm(18, 0),
            ..Default::default()
        };
        // June 30 2024 is a Sunday.
        let found = next(&last, utc(2024, 6, 10, 0, 0)).unwrap();
        assert_eq!(found, utc(2024, 6, 28, 18, 0));
    }

    #[test]
    fn test_annual_leap_day() {
        let constraints = Constraints {
            annually: true,
            month_of_year: 2,
            day_of_month: 29,
            task_time: hm(6, 0),
            ..Default::default()
        };
        let found = next(&constraints, utc(2024, 3, 1, 0, 0)).unwrap();
        assert_eq!(found, utc(2028, 2, 29, 6, 0));
    }

    #[test]
    fn test_impossible_combination_is_exhausted() {
        let constraints = Constraints {
            weekends_only: true,
            first_business_day: true,
            ..Default::default()
        };
        let err = next(&constraints, utc(2024, 1, 1, 0, 0)).unwrap_err();
        assert!(matches!(err, SchedulerError::SearchExhausted { .. }));
    }

    #[test]
    fn test_ended_validity_window_is_exhausted() {
        let constraints = Constraints {
            end_on: Some(utc(2024, 1, 1, 0, 0).naive_local()),
            ..Default::default()
        };
        let err = next(&constraints, utc(2024, 2, 1, 0, 0)).unwrap_err();
        match err {
            SchedulerError::SearchExhausted { reason, .. } => {
                assert!(reason.contains("validity window"))
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_start_on_moves_search_forward() {
        let constraints = Constraints {
            start_on: Some(utc(2024, 9, 1, 10, 0).naive_local()),
            task_time: hm(12, 0),
            ..Default::default()
        };
        let found = next(&constraints, utc(2024, 6, 1, 0, 0)).unwrap();
        assert_eq!(found, utc(2024, 9, 1, 12, 0));
    }

    #[test]
    fn test_calendar_in_named_timezone() {
        let tz: Tz = "America/New_York".parse().unwrap();
        let constraints = Constraints {
            task_time: hm(9, 0),
            ..Default::default()
        };
        let after = tz.with_ymd_and_hms(2024, 7, 4, 10, 0, 0).unwrap();
        let found = next(&constraints, after).unwrap();
        assert_eq!(found, tz.with_ymd_and_hms(2024, 7, 5, 9, 0, 0).unwrap());
    }

    #[test]
    fn test_interval_modes_add_interval() {
        let evaluator = TimeWindowEvaluator::default();
        let mode = TimingMode::FixedRate {
            period: 90,
            unit: TimeUnit::Seconds,
            initial_delay: Duration::ZERO,
        };
        let found = evaluator
            .next_eligible("test", &mode, &Constraints::default(), utc(2024, 1, 1, 0, 0), || false)
            .unwrap();
        assert_eq!(found, utc(2024, 1, 1, 0, 1) + chrono::Duration::seconds(30));
    }

    #[test]
    fn test_closed_gate_exhausts_calendar_search() {
        let evaluator = TimeWindowEvaluator::new(30);
        let weekdays = Constraints {
            weekdays_only: true,
            task_time: hm(9, 0),
            ..Default::default()
        };
        let mut consulted = 0;
        let err = evaluator
            .next_eligible("test", &TimingMode::Calendar, &weekdays, utc(2024, 6, 1, 12, 0), || {
                consulted += 1;
                false
            })
            .unwrap_err();
        assert!(matches!(err, SchedulerError::SearchExhausted { .. }));
        // Only weekdays reach the gate: June 2024 has 20 of them.
        assert_eq!(consulted, 20);

        // A gate that opens later moves the run to the first admitted day after that.
        let mut calls = 0;
        let found = evaluator
            .next_eligible("test", &TimingMode::Calendar, &weekdays, utc(2024, 6, 1, 12, 0), || {
                calls += 1;
                calls > 2
            })
            .unwrap();
        assert_eq!(found, utc(2024, 6, 5, 9, 0));
    }

    #[test]
    fn test_eligible_now_respects_gate_and_window() {
        let evaluator = TimeWindowEvaluator::default();
        let overnight = Constraints {
            start_time: hm(22, 0),
            end_time: hm(6, 0),
            ..Default::default()
        };
        assert!(evaluator.is_eligible_now(&overnight, utc(2024, 6, 4, 23, 0), || true));
        assert!(!evaluator.is_eligible_now(&overnight, utc(2024, 6, 4, 23, 0), || false));
        assert!(!evaluator.is_eligible_now(&overnight, utc(2024, 6, 4, 12, 0), || true));

        // Inclusive end at minute resolution.
        let closing = Tz::UTC.with_ymd_and_hms(2024, 6, 4, 6, 0, 40).unwrap();
        assert!(evaluator.is_eligible_now(&overnight, closing, || true));
    }
}
