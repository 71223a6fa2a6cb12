//! Polling interval expressions.
//!
//! Watchers poll on a fixed delay. Two notations are accepted and converted
//! once into a [`Duration`]:
//!
//! - durations: `90`, `30s`, `5m`, `1h`, `1d`
//! - the periodic subset of cron (5 fields, or 6 with leading seconds):
//!   `* * * * *`, `*/5 * * * *`, `0 * * * *`, `0 */6 * * *`, `30 2 * * *`
//!
//! Cron expressions that are not periodic (weekday lists, ranges) are rejected,
//! and so is anything longer than [`MAX_INTERVAL`].

use crate::SchemaError;
use std::time::Duration;

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);

/// Longest accepted period: one week.
pub const MAX_INTERVAL: Duration = Duration::from_secs(7 * DAY);

const MINUTE: u64 = 60;
const HOUR: u64 = 60 * MINUTE;
const DAY: u64 = 24 * HOUR;

pub fn parse_interval(expr: &str) -> Result<Duration, SchemaError> {
    let err = |reason: &str| SchemaError::InvalidInterval {
        expr: expr.to_owned(),
        reason: reason.to_owned(),
    };

    let trimmed = expr.trim();
    if trimmed.is_empty() {
        return Err(err("empty expression"));
    }

    let fields: Vec<&str> = trimmed.split_whitespace().collect();
    let secs = match fields.len() {
        1 => parse_duration(fields[0]).ok_or_else(|| err("expected a number with s/m/h/d"))?,
        5 => parse_cron(&fields).map_err(|r| err(&r))?,
        6 => match parse_step(fields[0]) {
            Step::Every(n) if fields[1..].iter().all(|f| *f == "*") => n,
            Step::Every(_) | Step::Fixed => parse_cron(&fields[1..]).map_err(|r| err(&r))?,
            Step::Unsupported => return Err(err("unsupported seconds field")),
        },
        _ => return Err(err("expected a duration or 5/6 cron fields")),
    };

    if secs == 0 {
        return Err(err("interval must be greater than zero"));
    }
    if secs > MAX_INTERVAL.as_secs() {
        return Err(err("interval must not exceed 7d"));
    }
    Ok(Duration::from_secs(secs))
}

fn parse_duration(s: &str) -> Option<u64> {
    let (digits, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(i) => s.split_at(i),
        None => (s, "s"),
    };
    let n: u64 = digits.parse().ok()?;
    let factor = match unit {
        "s" => 1,
        "m" => MINUTE,
        "h" => HOUR,
        "d" => DAY,
        _ => return None,
    };
    n.checked_mul(factor)
}

enum Step {
    /// `*` or `*/n`
    Every(u64),
    /// A single literal value such as `0` or `30`.
    Fixed,
    Unsupported,
}

fn parse_step(field: &str) -> Step {
    if field == "*" {
        return Step::Every(1);
    }
    if let Some(n) = field.strip_prefix("*/") {
        return match n.parse::<u64>() {
            Ok(n) if n > 0 => Step::Every(n),
            _ => Step::Unsupported,
        };
    }
    if field.parse::<u64>().is_ok() {
        Step::Fixed
    } else {
        Step::Unsupported
    }
}

fn parse_cron(fields: &[&str]) -> Result<u64, String> {
    let [minute, hour, dom, month, dow] = fields else {
        return Err("expected 5 cron fields".to_owned());
    };
    if *month != "*" || *dow != "*" {
        return Err("month and weekday fields must be '*'".to_owned());
    }

    let (n, unit) = match (parse_step(minute), parse_step(hour), parse_step(dom)) {
        (Step::Every(n), Step::Every(1), Step::Every(1)) => (n, MINUTE),
        (Step::Fixed, Step::Every(n), Step::Every(1)) => (n, HOUR),
        (Step::Fixed, Step::Fixed, Step::Every(n)) => (n, DAY),
        _ => return Err("only periodic cron expressions are supported".to_owned()),
    };
    n.checked_mul(unit)
        .ok_or_else(|| "step is too large".to_owned())
}
