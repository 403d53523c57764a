//! Duration, frequency, and backoff option parsing.
//!
//! These are orchestration-option grammars (§6): durations accept a
//! non-negative number of milliseconds or a human string like `"1 hour"`;
//! frequencies accept `"N per <duration>"` or `"N/<unit>"`; backoff
//! accepts a number, a duration string, an array of durations indexed by
//! attempt (last entry repeats), or is left to the caller as a function.

use std::time::Duration as StdDuration;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DurationParseError {
    #[error("empty duration string")]
    Empty,
    #[error("invalid duration string: {0:?}")]
    Invalid(String),
    #[error("invalid frequency string: {0:?}")]
    InvalidFrequency(String),
}

/// Default retry backoff table, indexed by (1-based) attempt number.
/// The last entry repeats for attempts beyond the table's length.
pub const RETRY_TABLE: &[StdDuration] = &[
    StdDuration::from_millis(100),
    StdDuration::from_secs(30),
    StdDuration::from_secs(2 * 60),
    StdDuration::from_secs(10 * 60),
    StdDuration::from_secs(30 * 60),
    StdDuration::from_secs(60 * 60),
    StdDuration::from_secs(2 * 60 * 60),
    StdDuration::from_secs(12 * 60 * 60),
    StdDuration::from_secs(24 * 60 * 60),
];

/// Parse a duration given either as plain milliseconds or a string like
/// `"1 hour"`, `"30s"`, `"100ms"`, `"1d"`.
pub fn parse_duration_ms(input: &str) -> Result<StdDuration, DurationParseError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(DurationParseError::Empty);
    }
    if let Ok(ms) = trimmed.parse::<u64>() {
        return Ok(StdDuration::from_millis(ms));
    }

    let split_at = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .ok_or_else(|| DurationParseError::Invalid(trimmed.to_string()))?;
    let (number, unit) = trimmed.split_at(split_at);
    let number: f64 = number
        .parse()
        .map_err(|_| DurationParseError::Invalid(trimmed.to_string()))?;
    let unit = unit.trim().to_ascii_lowercase();

    let ms_per_unit = match unit.as_str() {
        "ms" | "msec" | "msecs" | "millisecond" | "milliseconds" => 1.0,
        "s" | "sec" | "secs" | "second" | "seconds" => 1_000.0,
        "m" | "min" | "mins" | "minute" | "minutes" => 60_000.0,
        "h" | "hr" | "hrs" | "hour" | "hours" => 3_600_000.0,
        "d" | "day" | "days" => 86_400_000.0,
        other => return Err(DurationParseError::Invalid(format!("unknown unit {other:?}"))),
    };

    Ok(StdDuration::from_millis((number * ms_per_unit).round() as u64))
}

/// A parsed frequency: `count` occurrences per `per`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Frequency {
    pub count: u64,
    pub per: StdDuration,
}

/// Parse `"N per <duration>"` or `"N/<unit>"`.
pub fn parse_frequency(input: &str) -> Result<Frequency, DurationParseError> {
    let trimmed = input.trim();

    if let Some((count_str, rest)) = trimmed.split_once(" per ") {
        let count: u64 = count_str
            .trim()
            .parse()
            .map_err(|_| DurationParseError::InvalidFrequency(trimmed.to_string()))?;
        let per = parse_duration_ms(rest.trim())
            .map_err(|_| DurationParseError::InvalidFrequency(trimmed.to_string()))?;
        return Ok(Frequency { count, per });
    }

    if let Some((count_str, unit)) = trimmed.split_once('/') {
        let count: u64 = count_str
            .trim()
            .parse()
            .map_err(|_| DurationParseError::InvalidFrequency(trimmed.to_string()))?;
        let per = unit_to_duration(unit.trim())
            .ok_or_else(|| DurationParseError::InvalidFrequency(trimmed.to_string()))?;
        return Ok(Frequency { count, per });
    }

    Err(DurationParseError::InvalidFrequency(trimmed.to_string()))
}

fn unit_to_duration(unit: &str) -> Option<StdDuration> {
    Some(match unit.to_ascii_lowercase().as_str() {
        "ms" | "millisecond" | "milliseconds" => StdDuration::from_millis(1),
        "s" | "sec" | "second" | "seconds" => StdDuration::from_secs(1),
        "m" | "min" | "minute" | "minutes" => StdDuration::from_secs(60),
        "h" | "hr" | "hour" | "hours" => StdDuration::from_secs(3_600),
        "d" | "day" | "days" => StdDuration::from_secs(86_400),
        _ => return None,
    })
}

/// Backoff option, as accepted from orchestration options.
///
/// `Function` is intentionally opaque here — a closure of
/// `fn(attempt: u32) -> StdDuration` lives at the `durable-runtime`
/// boundary where job options are actually constructed; `durable-types`
/// only needs to model the *shape* of the option for parsing strings and
/// arrays.
#[derive(Clone, Debug, PartialEq)]
pub enum Backoff {
    /// Fixed delay for every attempt.
    Fixed(StdDuration),
    /// Per-attempt delay (1-indexed); the last entry repeats once
    /// exhausted.
    Table(Vec<StdDuration>),
}

impl Backoff {
    /// Delay before `attempt` (1-indexed).
    pub fn delay_for(&self, attempt: u32) -> StdDuration {
        match self {
            Backoff::Fixed(d) => *d,
            Backoff::Table(table) => {
                if table.is_empty() {
                    return RETRY_TABLE
                        .last()
                        .copied()
                        .expect("RETRY_TABLE is a non-empty const");
                }
                let idx = (attempt.saturating_sub(1)) as usize;
                table.get(idx).copied().unwrap_or_else(|| *table.last().expect("checked non-empty above"))
            }
        }
    }

    /// The engine's default backoff, `RETRY_TABLE`.
    pub fn default_table() -> Self {
        Backoff::Table(RETRY_TABLE.to_vec())
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::default_table()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_milliseconds() {
        assert_eq!(parse_duration_ms("100").unwrap(), StdDuration::from_millis(100));
    }

    #[test]
    fn parses_human_strings() {
        assert_eq!(parse_duration_ms("1 hour").unwrap(), StdDuration::from_secs(3_600));
        assert_eq!(parse_duration_ms("30s").unwrap(), StdDuration::from_secs(30));
        assert_eq!(parse_duration_ms("100ms").unwrap(), StdDuration::from_millis(100));
        assert_eq!(parse_duration_ms("1d").unwrap(), StdDuration::from_secs(86_400));
    }

    #[test]
    fn rejects_empty_and_garbage() {
        assert_eq!(parse_duration_ms(""), Err(DurationParseError::Empty));
        assert!(parse_duration_ms("banana").is_err());
    }

    #[test]
    fn parses_frequency_variants() {
        let a = parse_frequency("5 per 1 hour").unwrap();
        assert_eq!(a.count, 5);
        assert_eq!(a.per, StdDuration::from_secs(3_600));

        let b = parse_frequency("10/s").unwrap();
        assert_eq!(b.count, 10);
        assert_eq!(b.per, StdDuration::from_secs(1));
    }

    #[test]
    fn backoff_table_repeats_last_entry() {
        let backoff = Backoff::default_table();
        let last = *RETRY_TABLE.last().unwrap();
        assert_eq!(backoff.delay_for(RETRY_TABLE.len() as u32 + 5), last);
        assert_eq!(backoff.delay_for(1), RETRY_TABLE[0]);
    }

    #[test]
    fn backoff_empty_table_falls_back_to_the_default_table_instead_of_panicking() {
        let backoff = Backoff::Table(vec![]);
        assert_eq!(backoff.delay_for(1), *RETRY_TABLE.last().unwrap());
        assert_eq!(backoff.delay_for(9), *RETRY_TABLE.last().unwrap());
    }
}
