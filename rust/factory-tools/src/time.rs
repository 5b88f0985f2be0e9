//! Time bounds for Flux `range()` calls.

use crate::error::{Result, ServiceError};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::fmt;

/// Lookback applied to reading and statistics tools when no start is given.
pub const DEFAULT_LOOKBACK: &str = "-24h";
/// Lookback for the inventory tools; equipment and metrics change slowly.
pub const INVENTORY_LOOKBACK: &str = "-7d";
/// Window read by `get_latest_readings`, regardless of caller input.
pub const LATEST_WINDOW: &str = "-1h";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeBound {
    /// Duration literal such as `-24h`; evaluated by the backend at execution time.
    Relative(String),
    Now,
    Absolute(DateTime<Utc>),
}

impl TimeBound {
    pub fn parse(raw: &str) -> Self {
        let value = raw.trim();
        if value.eq_ignore_ascii_case("now") || value.eq_ignore_ascii_case("now()") {
            return TimeBound::Now;
        }
        if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
            return TimeBound::Absolute(dt.with_timezone(&Utc));
        }
        TimeBound::Relative(value.to_string())
    }

    /// Renders the bound as Flux source.
    pub fn to_flux(&self) -> String {
        match self {
            TimeBound::Relative(duration) => duration.clone(),
            TimeBound::Now => "now()".to_string(),
            TimeBound::Absolute(dt) => dt.to_rfc3339_opts(SecondsFormat::AutoSi, true),
        }
    }
}

impl fmt::Display for TimeBound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_flux())
    }
}

impl Serialize for TimeBound {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_flux())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimeRange {
    pub start: TimeBound,
    pub stop: TimeBound,
}

impl TimeRange {
    pub fn fixed(start: &str) -> Self {
        Self {
            start: TimeBound::Relative(start.to_string()),
            stop: TimeBound::Now,
        }
    }
}

/// Fills absent bounds with `default_start` and `now()`.
///
/// Duration syntax is left to the backend. The only check performed is that
/// two absolute instants are ordered.
pub fn resolve(start: Option<&str>, stop: Option<&str>, default_start: &str) -> Result<TimeRange> {
    let start = present(start)
        .map(TimeBound::parse)
        .unwrap_or_else(|| TimeBound::Relative(default_start.to_string()));
    let stop = present(stop).map(TimeBound::parse).unwrap_or(TimeBound::Now);

    if let (TimeBound::Absolute(start), TimeBound::Absolute(stop)) = (&start, &stop) {
        if start >= stop {
            return Err(ServiceError::InvalidArguments(
                "start_time must be before stop_time".to_string(),
            ));
        }
    }

    Ok(TimeRange { start, stop })
}

/// Resolves only a start bound, for queries whose range has no stop.
pub fn resolve_start(start: Option<&str>, default_start: &str) -> TimeBound {
    present(start)
        .map(TimeBound::parse)
        .unwrap_or_else(|| TimeBound::Relative(default_start.to_string()))
}

fn present(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn absent_bounds_use_defaults() {
        let range = resolve(None, None, DEFAULT_LOOKBACK).unwrap();
        assert_eq!(range.start, TimeBound::Relative("-24h".into()));
        assert_eq!(range.stop, TimeBound::Now);
        assert_eq!(range.start.to_flux(), "-24h");
        assert_eq!(range.stop.to_flux(), "now()");
    }

    #[test]
    fn supplied_start_is_kept() {
        let range = resolve(Some("-1h"), None, DEFAULT_LOOKBACK).unwrap();
        assert_eq!(range.start.to_flux(), "-1h");
        assert_eq!(range.stop, TimeBound::Now);
    }

    #[test]
    fn empty_strings_count_as_absent() {
        let range = resolve(Some("  "), Some(""), INVENTORY_LOOKBACK).unwrap();
        assert_eq!(range.start.to_flux(), "-7d");
        assert_eq!(range.stop, TimeBound::Now);
    }

    #[test]
    fn absolute_instants_render_in_utc() {
        let range = resolve(
            Some("2025-01-01T01:00:00+01:00"),
            Some("2025-01-02T00:00:00Z"),
            DEFAULT_LOOKBACK,
        )
        .unwrap();
        assert_eq!(
            range.start,
            TimeBound::Absolute(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap())
        );
        assert_eq!(range.start.to_flux(), "2025-01-01T00:00:00Z");
        assert_eq!(range.stop.to_flux(), "2025-01-02T00:00:00Z");
    }

    #[test]
    fn reversed_absolute_range_is_rejected() {
        let err = resolve(
            Some("2025-01-02T00:00:00Z"),
            Some("2025-01-01T00:00:00Z"),
            DEFAULT_LOOKBACK,
        )
        .unwrap_err();
        assert!(err.to_string().contains("start_time must be before stop_time"));
    }

    #[test]
    fn malformed_durations_pass_through() {
        let range = resolve(Some("yesterday-ish"), Some("NOW()"), DEFAULT_LOOKBACK).unwrap();
        assert_eq!(range.start, TimeBound::Relative("yesterday-ish".into()));
        assert_eq!(range.stop, TimeBound::Now);
    }
}
