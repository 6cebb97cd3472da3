use once_cell::sync::Lazy;
use regex::Regex;

use super::{Fields, Plugin, PluginOptions};
use crate::util::bump;
use crate::zone::{Counters, Scratch};

/// Parses Apache access logs. The default pattern expects the combined
/// format; the `clf` option narrows it to the plain Common Log Format.
/// Request strings are validated semantically after the match, so a line
/// that matches the access-log shape but carries a garbage request still
/// counts as `http_request` plus `malformed_request`.
#[derive(Debug)]
pub struct ApachePlugin {
    pattern: Regex,
}

static COMBINED_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^\S+ \S+ \S+ \[[^\]]+\] "([^"]*)" (\d{3}) (\S+) "[^"]*" "[^"]*""#).unwrap()
});

static CLF_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"^\S+ \S+ \S+ \[[^\]]+\] "([^"]*)" (\d{3}) (\S+)"#).unwrap());

static REQUEST_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([A-Za-z]+) \S+ HTTP/(\d+)\.(\d+)$").unwrap());

impl ApachePlugin {
    pub fn new(options: &PluginOptions, pattern: Option<Regex>) -> Self {
        let pattern = pattern.unwrap_or_else(|| {
            if options.flag("clf") {
                CLF_RE.clone()
            } else {
                COMBINED_RE.clone()
            }
        });
        ApachePlugin { pattern }
    }
}

impl Plugin for ApachePlugin {
    fn name(&self) -> &'static str {
        "apache"
    }

    fn init_zone(
        &self,
        _zone: &str,
        public: &mut Counters,
        _private: &mut Scratch,
        window: &mut Counters,
    ) {
        for key in ["http_request", "http_bytes", "malformed_request"] {
            public.entry(key.to_string()).or_insert(0.0);
            window.entry(key.to_string()).or_insert(0.0);
        }
    }

    fn process_line(&self, line: &str) -> Option<Fields> {
        let caps = self.pattern.captures(line)?;
        Some(vec![
            caps[1].to_string(),
            caps[2].to_string(),
            caps[3].to_string(),
        ])
    }

    fn process_data(
        &self,
        fields: &Fields,
        public: &mut Counters,
        _private: &mut Scratch,
        window: &mut Counters,
    ) {
        let request = fields[0].as_str();
        let status = &fields[1];
        let bytes: f64 = fields[2].parse().unwrap_or(0.0);

        bump(public, "http_request", 1.0);
        bump(window, "http_request", 1.0);
        bump(public, "http_bytes", bytes);
        bump(window, "http_bytes", bytes);

        if let Some(class) = status.chars().next() {
            bump(public, &format!("http_status_{}xx", class), 1.0);
        }

        match REQUEST_RE.captures(request) {
            Some(req) => {
                bump(
                    public,
                    &format!("http_method_{}", req[1].to_ascii_lowercase()),
                    1.0,
                );
                bump(public, &format!("http_version_{}_{}", &req[2], &req[3]), 1.0);
            }
            None => {
                bump(public, "malformed_request", 1.0);
                bump(window, "malformed_request", 1.0);
            }
        }
    }
}
