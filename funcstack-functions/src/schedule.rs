//! Schedule expressions for scheduled functions
//!
//! Accepts classic five-field cron expressions (`0 0 * * 1`), the six and
//! seven-field forms with seconds, and the `@hourly`-style aliases. Times are
//! computed in UTC. Nothing here fires invocations; the next run is only used
//! to populate the synthetic event of a local scheduled invocation.

use chrono::{DateTime, Utc};
use cron::Schedule;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("Invalid schedule expression '{expression}': {message}")]
    Invalid { expression: String, message: String },

    #[error("Schedule '{0}' has no upcoming run")]
    NoUpcomingRun(String),
}

/// Check that an expression parses
pub fn validate(expression: &str) -> Result<(), ScheduleError> {
    parse(expression).map(|_| ())
}

/// Next time the expression fires strictly after `after`
pub fn next_run(expression: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>, ScheduleError> {
    parse(expression)?
        .after(&after)
        .next()
        .ok_or_else(|| ScheduleError::NoUpcomingRun(expression.to_string()))
}

fn parse(expression: &str) -> Result<Schedule, ScheduleError> {
    let invalid = |message: String| ScheduleError::Invalid {
        expression: expression.to_string(),
        message,
    };

    let normalized = normalize(expression).map_err(invalid)?;
    Schedule::from_str(&normalized).map_err(|e| invalid(e.to_string()))
}

fn normalize(expression: &str) -> Result<String, String> {
    let trimmed = expression.trim();

    if let Some(alias) = trimmed.strip_prefix('@') {
        let expanded = match alias.to_ascii_lowercase().as_str() {
            "yearly" | "annually" => "0 0 0 1 1 *",
            "monthly" => "0 0 0 1 * *",
            "weekly" => "0 0 0 * * 1",
            "daily" | "midnight" => "0 0 0 * * *",
            "hourly" => "0 0 * * * *",
            _ => return Err(format!("unknown alias '@{alias}'")),
        };
        return Ok(expanded.to_string());
    }

    let fields: Vec<&str> = trimmed.split_whitespace().collect();
    match fields.len() {
        // minute hour day-of-month month day-of-week
        5 => Ok(format!(
            "0 {} {} {} {} {}",
            fields[0],
            fields[1],
            fields[2],
            fields[3],
            shift_day_of_week(fields[4])?
        )),
        6 | 7 => Ok(fields.join(" ")),
        _ => Err("expected 5 to 7 fields or an @alias".to_string()),
    }
}

/// Classic cron counts weekdays 0-7 from Sunday; the cron crate counts 1-7.
fn shift_day_of_week(field: &str) -> Result<String, String> {
    let weekday = |value: &str| -> Result<Option<u8>, String> {
        match value.parse::<u8>() {
            Ok(day) if day <= 7 => Ok(Some(day)),
            Ok(day) => Err(format!("day of week {day} is out of range 0-7")),
            // Names and wildcards pass through untouched
            Err(_) if value.chars().all(|c| c.is_ascii_digit()) && !value.is_empty() => {
                Err(format!("day of week {value} is out of range 0-7"))
            }
            Err(_) => Ok(None),
        }
    };

    field
        .split(',')
        .map(|part| {
            let (range, step) = match part.split_once('/') {
                Some((range, step)) => (range, Some(step)),
                None => (part, None),
            };

            let shifted = match range.split_once('-') {
                Some((start, end)) => match (weekday(start)?, weekday(end)?) {
                    (Some(0), Some(7)) => "1-7".to_string(),
                    (Some(7), Some(7)) => "1".to_string(),
                    (Some(start), Some(7)) => format!("{}-7,1", shift_day(start)),
                    (Some(start), Some(end)) => format!("{}-{}", shift_day(start), shift_day(end)),
                    _ => range.to_string(),
                },
                None => match weekday(range)? {
                    Some(day) => shift_day(day).to_string(),
                    None => range.to_string(),
                },
            };

            Ok(match step {
                Some(step) => format!("{shifted}/{step}"),
                None => shifted,
            })
        })
        .collect::<Result<Vec<_>, String>>()
        .map(|parts| parts.join(","))
}

fn shift_day(day: u8) -> u8 {
    if day >= 7 {
        1
    } else {
        day + 1
    }
}
