use once_cell::sync::Lazy;
use regex::Regex;

use super::{Fields, Plugin, PluginOptions};
use crate::util::bump;
use crate::zone::{Counters, Scratch};

/// Parses clamd scan results: `<path>: OK` and `<path>: <signature> FOUND`.
/// The `type` option adds a `malware:<signature>` tally per detection next
/// to the aggregate `malware` counter.
#[derive(Debug)]
pub struct ClamdPlugin {
    pattern: Regex,
    by_type: bool,
}

static SCAN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:.*-> )?(.+?): (?:(\S+) )?(OK|FOUND)$").unwrap());

impl ClamdPlugin {
    pub fn new(options: &PluginOptions, pattern: Option<Regex>) -> Self {
        ClamdPlugin {
            pattern: pattern.unwrap_or_else(|| SCAN_RE.clone()),
            by_type: options.flag("type"),
        }
    }
}

impl Plugin for ClamdPlugin {
    fn name(&self) -> &'static str {
        "clamd"
    }

    fn init_zone(
        &self,
        _zone: &str,
        public: &mut Counters,
        _private: &mut Scratch,
        window: &mut Counters,
    ) {
        for key in ["clean", "malware"] {
            public.entry(key.to_string()).or_insert(0.0);
            window.entry(key.to_string()).or_insert(0.0);
        }
    }

    fn process_line(&self, line: &str) -> Option<Fields> {
        let caps = self.pattern.captures(line)?;
        let verdict = caps[3].to_string();
        let signature = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        // A FOUND without a signature is a scanner hiccup, not a result.
        if verdict == "FOUND" && signature.is_empty() {
            return None;
        }
        Some(vec![verdict, signature.to_string()])
    }

    fn process_data(
        &self,
        fields: &Fields,
        public: &mut Counters,
        _private: &mut Scratch,
        window: &mut Counters,
    ) {
        match fields[0].as_str() {
            "OK" => {
                bump(public, "clean", 1.0);
                bump(window, "clean", 1.0);
            }
            "FOUND" => {
                bump(public, "malware", 1.0);
                bump(window, "malware", 1.0);
                if self.by_type {
                    bump(public, &format!("malware:{}", fields[1]), 1.0);
                }
            }
            _ => {}
        }
    }
}
