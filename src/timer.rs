//! Named plugin timers aligned to wall-clock boundaries.
//!
//! A timer `zone:name:N[wdhms]` fires every `N` units, with the next fire
//! computed as now + period and then truncated down to the unit boundary
//! in local time, so a `1d` timer lands on local midnight and a `1h` timer
//! on the top of the hour. Re-arming is the plugin's call.

use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, Local, NaiveTime, Timelike};

use crate::zone::valid_zone_name;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TruncUnit {
    Second,
    Minute,
    Hour,
    Day,
    Week,
}

impl TruncUnit {
    fn seconds(self) -> u64 {
        match self {
            TruncUnit::Second => 1,
            TruncUnit::Minute => 60,
            TruncUnit::Hour => 3600,
            TruncUnit::Day => 86_400,
            TruncUnit::Week => 604_800,
        }
    }
}

/// One `--timer zone:name:N[wdhms]` argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerSpec {
    pub zone: String,
    pub name: String,
    pub period_secs: u64,
    pub unit: TruncUnit,
}

impl FromStr for TimerSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, ':');
        let (zone, name, period) = match (parts.next(), parts.next(), parts.next()) {
            (Some(zone), Some(name), Some(period)) => (zone, name, period),
            _ => return Err(format!("timer '{}' is not zone:name:period", s)),
        };
        if !valid_zone_name(zone) {
            return Err(format!("timer '{}' has an invalid zone name", s));
        }
        if name.is_empty() {
            return Err(format!("timer '{}' has an empty name", s));
        }
        let (digits, unit) = match period.char_indices().last() {
            Some((idx, c)) if c.is_ascii_alphabetic() => {
                let unit = match c.to_ascii_lowercase() {
                    's' => TruncUnit::Second,
                    'm' => TruncUnit::Minute,
                    'h' => TruncUnit::Hour,
                    'd' => TruncUnit::Day,
                    'w' => TruncUnit::Week,
                    other => return Err(format!("timer '{}': unknown unit '{}'", s, other)),
                };
                (&period[..idx], unit)
            }
            _ => (period, TruncUnit::Second),
        };
        let count: u64 = digits
            .parse()
            .map_err(|_| format!("timer '{}': bad period '{}'", s, period))?;
        if count == 0 {
            return Err(format!("timer '{}': period must be positive", s));
        }
        Ok(TimerSpec {
            zone: zone.to_string(),
            name: name.to_string(),
            period_secs: count * unit.seconds(),
            unit,
        })
    }
}

/// Truncate a timestamp down to the unit boundary in local time.
pub fn truncate(at: DateTime<Local>, unit: TruncUnit) -> DateTime<Local> {
    let on_boundary = |time: Option<DateTime<Local>>| time.unwrap_or(at);
    match unit {
        TruncUnit::Second => on_boundary(at.with_nanosecond(0)),
        TruncUnit::Minute => on_boundary(at.with_nanosecond(0).and_then(|t| t.with_second(0))),
        TruncUnit::Hour => on_boundary(
            at.with_nanosecond(0)
                .and_then(|t| t.with_second(0))
                .and_then(|t| t.with_minute(0)),
        ),
        TruncUnit::Day => on_boundary(
            at.date_naive()
                .and_time(NaiveTime::MIN)
                .and_local_timezone(Local)
                .earliest(),
        ),
        TruncUnit::Week => {
            let monday = at.date_naive()
                - Duration::days(i64::from(at.weekday().num_days_from_monday()));
            on_boundary(monday.and_time(NaiveTime::MIN).and_local_timezone(Local).earliest())
        }
    }
}

/// Next fire time for a timer evaluated at `now`.
pub fn next_fire(now: DateTime<Local>, spec: &TimerSpec) -> DateTime<Local> {
    let target = now + Duration::seconds(spec.period_secs as i64);
    let aligned = truncate(target, spec.unit);
    // Alignment can only move the target backwards; never behind the clock.
    if aligned <= now {
        target
    } else {
        aligned
    }
}
