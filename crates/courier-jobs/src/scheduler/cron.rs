//! Cron expressions.
//!
//! Accepts standard five-field expressions (minute, hour, day of month,
//! month, day of week with 0 or 7 for Sunday) and the `@yearly`,
//! `@monthly`, `@weekly`, `@daily` and `@hourly` shortcuts. All evaluation
//! is in UTC at minute resolution.
//!
//! When both day of month and day of week are restricted, a day matching
//! either one fires, as in classic cron. A field starting with `*` counts
//! as unrestricted.

use crate::error::{JobError, JobResult};
use chrono::{DateTime, Duration as ChronoDuration, DurationRound, Utc};
use cron::Schedule;
use std::fmt;
use std::str::FromStr;

const WEEKDAYS: [&str; 8] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT", "SUN"];

/// Expands a named shortcut to its five-field form.
fn expand_shortcut(expr: &str) -> Option<&'static str> {
    match expr {
        "@yearly" | "@annually" => Some("0 0 1 1 *"),
        "@monthly" => Some("0 0 1 * *"),
        "@weekly" => Some("0 0 * * 0"),
        "@daily" | "@midnight" => Some("0 0 * * *"),
        "@hourly" => Some("0 * * * *"),
        _ => None,
    }
}

/// Rewrites numeric weekdays (0-7, Sunday first) as names.
fn weekday_field(field: &str) -> JobResult<String> {
    let map_day = |day: &str| -> JobResult<String> {
        if day.chars().all(|c| c.is_ascii_digit()) {
            let index: usize = day
                .parse()
                .map_err(|_| invalid(field, "day of week is not a number"))?;
            WEEKDAYS
                .get(index)
                .map(|name| (*name).to_string())
                .ok_or_else(|| invalid(field, "day of week must be between 0 and 7"))
        } else {
            Ok(day.to_string())
        }
    };

    let mut items = Vec::new();
    for item in field.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => (range, Some(step)),
            None => (item, None),
        };
        let range = if range == "*" {
            range.to_string()
        } else {
            range
                .split('-')
                .map(map_day)
                .collect::<JobResult<Vec<_>>>()?
                .join("-")
        };
        items.push(match step {
            Some(step) => format!("{range}/{step}"),
            None => range,
        });
    }
    Ok(items.join(","))
}

fn invalid(expr: &str, reason: impl fmt::Display) -> JobError {
    JobError::Configuration(format!("Invalid cron expression '{expr}': {reason}"))
}

/// A parsed cron schedule.
#[derive(Debug, Clone)]
pub struct CronExpression {
    source: String,
    /// One schedule, or two when the day fields combine with OR.
    schedules: Vec<Schedule>,
}

impl CronExpression {
    /// Parses a five-field expression or a named shortcut.
    pub fn parse(expr: &str) -> JobResult<Self> {
        let trimmed = expr.trim();
        let five = expand_shortcut(trimmed).unwrap_or(trimmed);

        let fields: Vec<&str> = five.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(invalid(expr, format!("expected 5 fields, got {}", fields.len())));
        }

        let (minute, hour, dom, month) = (fields[0], fields[1], fields[2], fields[3]);
        let dow = weekday_field(fields[4])?;
        let build = |dom: &str, dow: &str| {
            Schedule::from_str(&format!("0 {minute} {hour} {dom} {month} {dow}")).map_err(|e| invalid(expr, e))
        };

        let schedules = if dom.starts_with('*') || dow.starts_with('*') {
            vec![build(dom, &dow)?]
        } else {
            vec![build(dom, "*")?, build("*", &dow)?]
        };

        Ok(Self {
            source: trimmed.to_string(),
            schedules,
        })
    }

    /// The expression as written.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// First fire time strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedules
            .iter()
            .filter_map(|schedule| schedule.after(&after).next())
            .min()
    }

    /// True if the expression fires in the minute containing `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        let minute = now
            .duration_trunc(ChronoDuration::minutes(1))
            .unwrap_or(now);
        self.next_after(minute - ChronoDuration::seconds(1)) == Some(minute)
    }
}

impl FromStr for CronExpression {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CronExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, h, m, 0).unwrap()
    }

    #[test]
    fn test_hourly_next_run() {
        let cron = CronExpression::parse("0 * * * *").unwrap();
        assert_eq!(cron.next_after(at(10, 15)), Some(at(11, 0)));
        assert_eq!(cron.next_after(at(11, 0)), Some(at(12, 0)));
    }

    #[test]
    fn test_shortcuts() {
        let hourly = CronExpression::parse("@hourly").unwrap();
        assert_eq!(hourly.next_after(at(10, 15)), Some(at(11, 0)));

        let daily = CronExpression::parse("@daily").unwrap();
        assert_eq!(
            daily.next_after(at(10, 15)),
            Some(Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap())
        );

        // 2024-01-01 is a Monday.
        let weekly = CronExpression::parse("@weekly").unwrap();
        assert_eq!(
            weekly.next_after(at(10, 15)),
            Some(Utc.with_ymd_and_hms(2024, 1, 7, 0, 0, 0).unwrap())
        );

        let monthly = CronExpression::parse("@monthly").unwrap();
        assert_eq!(
            monthly.next_after(at(10, 15)),
            Some(Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap())
        );

        let yearly = CronExpression::parse("@yearly").unwrap();
        assert_eq!(
            yearly.next_after(at(10, 15)),
            Some(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_numeric_weekdays() {
        let sunday = Utc.with_ymd_and_hms(2024, 1, 7, 9, 0, 0).unwrap();
        for expr in ["0 9 * * 0", "0 9 * * 7", "0 9 * * SUN"] {
            let cron = CronExpression::parse(expr).unwrap();
            assert_eq!(cron.next_after(at(10, 0)), Some(sunday), "{expr}");
        }

        let weekdays = CronExpression::parse("30 8 * * 1-5").unwrap();
        assert_eq!(
            weekdays.next_after(at(10, 0)),
            Some(Utc.with_ymd_and_hms(2024, 1, 2, 8, 30, 0).unwrap())
        );
    }

    #[test]
    fn test_restricted_day_fields_match_either() {
        // Midnight on the 1st of the month or on any Monday.
        let cron = CronExpression::parse("0 0 1 * 1").unwrap();
        let jan_2 = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        let monday = Utc.with_ymd_and_hms(2024, 1, 8, 0, 0, 0).unwrap();
        assert_eq!(cron.next_after(jan_2), Some(monday));

        let feb_1 = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        assert!(cron.is_due(feb_1));
        assert!(cron.is_due(Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap()));
        assert!(!cron.is_due(Utc.with_ymd_and_hms(2024, 1, 16, 0, 0, 0).unwrap()));

        // A wildcard day of week keeps the day of month alone.
        let first = CronExpression::parse("0 0 1 * *").unwrap();
        assert_eq!(first.next_after(jan_2), Some(feb_1));
    }

    #[test]
    fn test_is_due_uses_minute_resolution() {
        let cron = CronExpression::parse("*/15 * * * *").unwrap();
        assert!(cron.is_due(at(10, 15)));
        assert!(cron.is_due(at(10, 15) + ChronoDuration::seconds(42)));
        assert!(!cron.is_due(at(10, 16)));
    }

    #[test]
    fn test_rejects_invalid() {
        assert!(CronExpression::parse("* * * *").is_err());
        assert!(CronExpression::parse("61 * * * *").is_err());
        assert!(CronExpression::parse("0 0 * * 8").is_err());
        assert!(CronExpression::parse("@sometimes").is_err());
    }
}
