//! Shared helpers: counter arithmetic and reply-line number formatting.
//!
//! Counters are JSON numbers carried as `f64`. Query replies print them
//! the way they would round-trip through the snapshot: integral values
//! without a fraction, everything else in the shortest float form.

use crate::zone::Counters;

/// Add `delta` to a counter, creating it at zero first if absent.
pub fn bump(counters: &mut Counters, key: &str, delta: f64) {
    *counters.entry(key.to_string()).or_insert(0.0) += delta;
}

/// Format a counter value for a protocol reply line.
pub fn fmt_count(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{}", value)
    }
}

/// Derive a zone name from a wildcard's file stem (basename mode): every
/// byte outside the zone grammar collapses to an underscore.
pub fn zone_name_from_pattern(pattern: &str) -> String {
    let base = pattern
        .rsplit('/')
        .next()
        .unwrap_or(pattern)
        .trim_end_matches('*');
    let stem = base.split('.').next().unwrap_or(base);
    let cleaned: String = stem
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}
