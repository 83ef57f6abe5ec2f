//! Cadence parsing: fixed intervals (`30s`, `every 5m`) or cron expressions.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub enum Cadence {
    Every(Duration),
    Cron(Box<cron::Schedule>),
}

impl Cadence {
    /// Parse a cadence string.
    ///
    /// Intervals are `<n><unit>` with an optional `every` prefix, where the
    /// unit is one of `s`, `m`, `h`, `d` (or their long spellings); a bare
    /// number is seconds. Anything else is read as a cron expression, with
    /// five-field expressions taken to fire at second 0.
    pub fn parse(input: &str) -> Result<Self> {
        let text = input.trim();
        if text.is_empty() {
            return Err(Error::Config("empty cadence".to_string()));
        }

        let interval = match text.strip_prefix("every ") {
            Some(rest) => Some(rest.split_whitespace().collect::<String>()),
            None if text.starts_with(|c: char| c.is_ascii_digit()) && !text.contains(' ') => {
                Some(text.to_string())
            }
            None => None,
        };
        if let Some(interval) = interval {
            let d = parse_interval(&interval)?;
            if d.is_zero() {
                return Err(Error::Config(format!("cadence {input:?} is zero")));
            }
            return Ok(Cadence::Every(d));
        }

        let fields = text.split_whitespace().count();
        let expr = match fields {
            5 => format!("0 {text}"),
            6 | 7 => text.to_string(),
            _ => {
                return Err(Error::Config(format!(
                    "cadence {input:?} is neither an interval nor a cron expression"
                )));
            }
        };
        let schedule = cron::Schedule::from_str(&expr)
            .map_err(|e| Error::Config(format!("invalid cron {input:?}: {e}")))?;
        Ok(Cadence::Cron(Box::new(schedule)))
    }

    /// The first fire time strictly after `now`, or None if the cadence
    /// never fires again.
    pub fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Cadence::Every(d) => chrono::Duration::from_std(*d)
                .ok()
                .and_then(|d| now.checked_add_signed(d)),
            Cadence::Cron(schedule) => schedule.after(&now).next(),
        }
    }
}

fn parse_interval(text: &str) -> Result<Duration> {
    let split = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    let (digits, unit) = text.split_at(split);
    let n: u64 = digits
        .parse()
        .map_err(|_| Error::Config(format!("invalid interval {text:?}")))?;
    let secs = match unit.trim() {
        "" | "s" | "sec" | "secs" | "second" | "seconds" => 1,
        "m" | "min" | "mins" | "minute" | "minutes" => 60,
        "h" | "hr" | "hrs" | "hour" | "hours" => 3600,
        "d" | "day" | "days" => 86_400,
        other => {
            return Err(Error::Config(format!(
                "unknown interval unit {other:?} in {text:?}"
            )));
        }
    };
    n.checked_mul(secs)
        .map(Duration::from_secs)
        .ok_or_else(|| Error::Config(format!("interval {text:?} overflows")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn every(input: &str) -> Option<u64> {
        match Cadence::parse(input) {
            Ok(Cadence::Every(d)) => Some(d.as_secs()),
            _ => None,
        }
    }

    #[test]
    fn parses_intervals() {
        assert_eq!(every("30s"), Some(30));
        assert_eq!(every("every 5m"), Some(300));
        assert_eq!(every("2h"), Some(7200));
        assert_eq!(every("1d"), Some(86_400));
        assert_eq!(every("60"), Some(60));
        assert_eq!(every("every 10 minutes"), Some(600));
        assert!(matches!(Cadence::parse("0 0 * * * *"), Ok(Cadence::Cron(_))));
    }

    #[test]
    fn rejects_garbage() {
        assert!(Cadence::parse("").is_err());
        assert!(Cadence::parse("0s").is_err());
        assert!(Cadence::parse("5 fortnights").is_err());
        assert!(Cadence::parse("10x").is_err());
        assert!(Cadence::parse("not a cadence").is_err());
        assert!(Cadence::parse("99 99 99 99 99").is_err());
    }

    #[test]
    fn interval_advances_from_now() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();
        let c = Cadence::parse("90s").unwrap();
        assert_eq!(
            c.next_after(now),
            Some(Utc.with_ymd_and_hms(2026, 1, 1, 12, 1, 30).unwrap())
        );
    }

    #[test]
    fn five_field_cron_fires_on_the_minute() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 10).unwrap();
        let c = Cadence::parse("*/15 * * * *").unwrap();
        assert_eq!(
            c.next_after(now),
            Some(Utc.with_ymd_and_hms(2026, 1, 1, 12, 15, 0).unwrap())
        );
    }
}
