//! Plugin infrastructure for tailstat.
//!
//! Each plugin encapsulates one log format: it parses a line into capture
//! fields, folds the fields into per-zone counters, and renders the reply
//! lines for `stats` and `dump`. The engine owns zone state and calls the
//! plugin at fixed dispatch points; the trait below is the only coupling
//! between the two. Plugins are compiled in and selected by name.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use anyhow::bail;
use regex::Regex;

use crate::util::fmt_count;
use crate::zone::{Counters, Scratch};

pub mod apache;
pub mod clamd;
pub mod spamd;

use self::apache::ApachePlugin;
use self::clamd::ClamdPlugin;
use self::spamd::SpamdPlugin;

/// Capture fields extracted from one parsed log line.
pub type Fields = Vec<String>;

/// Level at which unparsable lines are reported. `None` suppresses them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseErrorLevel {
    None,
    Debug,
    Info,
    Warn,
    Error,
}

impl ParseErrorLevel {
    /// Emit one unparsable-line record at this level.
    pub fn emit(self, zone: &str, line: &str) {
        match self {
            ParseErrorLevel::None => {}
            ParseErrorLevel::Debug => tracing::debug!(zone = %zone, line = %line, "unparsable line"),
            ParseErrorLevel::Info => tracing::info!(zone = %zone, line = %line, "unparsable line"),
            ParseErrorLevel::Warn => tracing::warn!(zone = %zone, line = %line, "unparsable line"),
            ParseErrorLevel::Error => tracing::error!(zone = %zone, line = %line, "unparsable line"),
        }
    }
}

impl FromStr for ParseErrorLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(ParseErrorLevel::None),
            "debug" => Ok(ParseErrorLevel::Debug),
            "info" => Ok(ParseErrorLevel::Info),
            "warn" | "warning" => Ok(ParseErrorLevel::Warn),
            "error" => Ok(ParseErrorLevel::Error),
            other => Err(format!("unknown parse-error level '{}'", other)),
        }
    }
}

impl fmt::Display for ParseErrorLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ParseErrorLevel::None => "none",
            ParseErrorLevel::Debug => "debug",
            ParseErrorLevel::Info => "info",
            ParseErrorLevel::Warn => "warn",
            ParseErrorLevel::Error => "error",
        };
        f.write_str(s)
    }
}

/// Options handed to a plugin constructor, parsed from the `-o` argument:
/// comma-separated entries, each either `key=value` or a bare flag.
#[derive(Debug, Clone, Default)]
pub struct PluginOptions {
    values: BTreeMap<String, String>,
}

impl PluginOptions {
    pub fn parse(raw: &str) -> Self {
        let mut values = BTreeMap::new();
        for entry in raw.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            match entry.split_once('=') {
                Some((key, value)) => {
                    values.insert(key.trim().to_string(), value.trim().to_string())
                }
                None => values.insert(entry.to_string(), "true".to_string()),
            };
        }
        PluginOptions { values }
    }

    /// Bare flags and `key=true` both count as set.
    pub fn flag(&self, name: &str) -> bool {
        matches!(
            self.values.get(name).map(String::as_str),
            Some("true") | Some("1") | Some("yes")
        )
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }
}

/// The parse-and-accumulate strategy for one log format.
///
/// Callbacks run to completion inside an engine event handler and must not
/// block. `init_zone` is called for every configured zone after every
/// load, so seeding must be idempotent.
pub trait Plugin: Send + std::fmt::Debug {
    fn name(&self) -> &'static str;

    /// Suggested report level for lines `process_line` rejects; the
    /// `--parse-error` option overrides it.
    fn parse_error_default(&self) -> ParseErrorLevel {
        ParseErrorLevel::Debug
    }

    /// Seed the counters this plugin relies on being present, so later
    /// counter queries are totally defined even before the first line.
    fn init_zone(
        &self,
        zone: &str,
        public: &mut Counters,
        private: &mut Scratch,
        window: &mut Counters,
    );

    /// Apply the line pattern plus any semantic validation. `None` marks
    /// the line unparsable.
    fn process_line(&self, line: &str) -> Option<Fields>;

    /// Fold one parsed line into the zone's counters.
    fn process_data(
        &self,
        fields: &Fields,
        public: &mut Counters,
        private: &mut Scratch,
        window: &mut Counters,
    );

    /// Window rollover hook. The just-completed window is at index 0; a
    /// fresh current window is opened only after this returns.
    fn process_window(&self, public: &mut Counters, private: &mut Scratch, windows: &mut [Counters]) {
        let _ = (public, private, windows);
    }

    /// Named timer hook; the return value decides whether to re-arm.
    fn process_timer(
        &self,
        name: &str,
        public: &mut Counters,
        private: &mut Scratch,
        windows: &[Counters],
    ) -> bool {
        let _ = (name, public, private, windows);
        false
    }

    /// Reply lines for `stats`, sorted. The default exposes the public
    /// counters; `windows` holds completed windows only.
    fn stats_zone(
        &self,
        zone: &str,
        public: &Counters,
        private: &Scratch,
        windows: &[Counters],
    ) -> Vec<String> {
        let _ = (zone, private, windows);
        public
            .iter()
            .map(|(key, value)| format!("{}: {}", key, fmt_count(*value)))
            .collect()
    }

    /// Reply lines for `dump`: the complete zone state, sections sorted.
    fn dump_zone(
        &self,
        zone: &str,
        public: &Counters,
        private: &Scratch,
        windows: &[Counters],
    ) -> Vec<String> {
        let _ = zone;
        let mut lines = Vec::new();
        for (key, value) in public {
            lines.push(format!("public:{}: {}", key, fmt_count(*value)));
        }
        for (key, value) in private {
            lines.push(format!("private:{}: {}", key, value));
        }
        for (i, window) in windows.iter().enumerate() {
            for (key, value) in window {
                lines.push(format!("window:{}:{}: {}", i, key, fmt_count(*value)));
            }
        }
        lines
    }
}

/// Construct a registered plugin by name. Unknown names are a startup
/// error; the daemon refuses to run without a parser.
pub fn create(
    name: &str,
    options: &PluginOptions,
    pattern: Option<Regex>,
) -> anyhow::Result<Box<dyn Plugin>> {
    match name {
        "apache" => Ok(Box::new(ApachePlugin::new(options, pattern))),
        "clamd" => Ok(Box::new(ClamdPlugin::new(options, pattern))),
        "spamd" => Ok(Box::new(SpamdPlugin::new(options, pattern))),
        other => bail!("unknown plugin '{}'", other),
    }
}
