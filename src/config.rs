use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use regex::Regex;

use crate::expand::ExpandRules;
use crate::plugins::{self, ParseErrorLevel, Plugin, PluginOptions};
use crate::timer::TimerSpec;
use crate::util::zone_name_from_pattern;
use crate::zone::valid_zone_name;

/// Command-line surface. Everything is optional except the plugin name
/// and at least one wildcard.
#[derive(Debug, Parser)]
#[command(name = "tailstat", version, about = "log statistics daemon")]
pub struct Cli {
    /// Plugin selecting the log format (apache, clamd, spamd)
    pub plugin: String,

    /// One or more [zone:]wildcard arguments
    #[arg(required = true, value_name = "[ZONE:]WILDCARD")]
    pub wildcards: Vec<String>,

    /// Zone subscribed to every watched file
    #[arg(short = 'a', long = "aggregate-zone", value_name = "ZONE")]
    pub aggregate_zone: Option<String>,

    /// State database path
    #[arg(short = 'b', long = "database", value_name = "FILE")]
    pub database: Option<PathBuf>,

    /// Derive zone names from wildcard basenames
    #[arg(long)]
    pub basename: bool,

    /// Base directory for relative wildcards
    #[arg(short = 'c', long = "change-dir", value_name = "DIR")]
    pub change_dir: Option<PathBuf>,

    /// Shortcut for --log-level debug
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Seconds between wildcard re-expansions
    #[arg(short = 'e', long = "expand-period", default_value_t = 60, value_name = "SECS")]
    pub expand_period: u64,

    /// Instance identity (word characters only)
    #[arg(short = 'i', long, value_name = "NAME")]
    pub identity: Option<String>,

    /// Query listener address
    #[arg(short = 'l', long = "listen", default_value = "127.0.0.1:3638", value_name = "ADDR:PORT")]
    pub listen: String,

    /// Subscribe every matching zone, not only the first
    #[arg(long)]
    pub multiple: bool,

    /// Number of sliding windows kept per zone
    #[arg(short = 'n', long = "windows-num", default_value_t = 60, value_name = "NUM")]
    pub windows_num: usize,

    /// Plugin options, comma separated key=value or flags
    #[arg(short = 'o', long = "options", value_name = "OPTS")]
    pub options: Option<String>,

    /// Pid file written at startup
    #[arg(short = 'p', long = "pid-file", value_name = "FILE")]
    pub pid_file: Option<PathBuf>,

    /// Level for unparsable-line reports (none, debug, info, warn, error)
    #[arg(long = "parse-error", value_name = "LEVEL")]
    pub parse_error: Option<String>,

    /// Override the plugin's line pattern
    #[arg(short = 'r', long, value_name = "REGEX")]
    pub regex: Option<String>,

    /// Read the line pattern override from a file
    #[arg(long = "regex-from", value_name = "FILE", conflicts_with = "regex")]
    pub regex_from: Option<PathBuf>,

    /// Seconds between state saves
    #[arg(short = 's', long = "store-period", default_value_t = 10, value_name = "SECS")]
    pub store_period: u64,

    /// Named timer zone:name:N[wdhms]; repeatable
    #[arg(long = "timer", value_name = "SPEC")]
    pub timers: Vec<String>,

    /// Window duration in seconds
    #[arg(short = 'w', long = "window-size", default_value_t = 10, value_name = "SECS")]
    pub window_size: u64,

    /// Log filter (error, warn, info, debug, trace)
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Log destination file; stderr when unset
    #[arg(long = "log-file", value_name = "FILE")]
    pub log_file: Option<PathBuf>,
}

/// Validated runtime configuration.
#[derive(Debug)]
pub struct Config {
    pub plugin: String,
    pub options: PluginOptions,
    pub pattern: Option<Regex>,
    pub rules: ExpandRules,
    pub database: PathBuf,
    pub listen: SocketAddr,
    pub expand_period: Duration,
    pub store_period: Duration,
    pub window_size: Duration,
    pub windows_num: usize,
    pub parse_error: Option<ParseErrorLevel>,
    pub timers: Vec<TimerSpec>,
    pub pid_file: Option<PathBuf>,
    pub log_level: Option<String>,
    pub log_file: Option<PathBuf>,
    pub debug: bool,
}

impl Config {
    /// Parse and validate an argument vector; used by `main` and tests.
    pub fn from_args<I, T>(args: I) -> Result<Config>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let cli = Cli::try_parse_from(args)?;
        Config::from_cli(cli)
    }

    pub fn from_cli(cli: Cli) -> Result<Config> {
        let mut wildcards = Vec::new();
        for raw in &cli.wildcards {
            wildcards.push(split_wildcard(raw, cli.basename)?);
        }

        if let Some(aggregate) = &cli.aggregate_zone {
            if !valid_zone_name(aggregate) {
                bail!("invalid aggregate zone name '{}'", aggregate);
            }
        }

        if let Some(identity) = &cli.identity {
            if identity.is_empty() || !identity.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_') {
                bail!("invalid identity '{}': word characters only", identity);
            }
        }

        let parse_error = match &cli.parse_error {
            Some(raw) => Some(raw.parse::<ParseErrorLevel>().map_err(|e| anyhow!(e))?),
            None => None,
        };

        let listen: SocketAddr = cli
            .listen
            .parse()
            .with_context(|| format!("invalid listen address '{}'", cli.listen))?;

        if cli.windows_num == 0 {
            bail!("windows-num must be at least 1");
        }
        if cli.window_size == 0 || cli.expand_period == 0 || cli.store_period == 0 {
            bail!("periods must be positive");
        }

        let rules = ExpandRules {
            wildcards,
            multiple: cli.multiple,
            change_dir: cli.change_dir.clone(),
            aggregate: cli.aggregate_zone.clone(),
        };

        let active = rules.active_zones();
        let mut timers = Vec::new();
        for raw in &cli.timers {
            let spec: TimerSpec = raw.parse().map_err(|e: String| anyhow!(e))?;
            if !active.iter().any(|z| z == &spec.zone) {
                bail!("timer '{}' names an unconfigured zone", raw);
            }
            timers.push(spec);
        }

        let pattern = match (&cli.regex, &cli.regex_from) {
            (Some(raw), None) => Some(compile_pattern(raw)?),
            (None, Some(path)) => {
                let raw = fs::read_to_string(path)
                    .with_context(|| format!("cannot read regex file '{}'", path.display()))?;
                Some(compile_pattern(raw.trim_end())?)
            }
            (None, None) => None,
            // clap's conflicts_with already rejects this pair.
            (Some(_), Some(_)) => None,
        };

        let database = cli.database.clone().unwrap_or_else(|| {
            match &cli.identity {
                Some(identity) => PathBuf::from(format!("tailstat-{}.db", identity)),
                None => PathBuf::from("tailstat.db"),
            }
        });

        let options = PluginOptions::parse(cli.options.as_deref().unwrap_or(""));

        Ok(Config {
            plugin: cli.plugin,
            options,
            pattern,
            rules,
            database,
            listen,
            expand_period: Duration::from_secs(cli.expand_period),
            store_period: Duration::from_secs(cli.store_period),
            window_size: Duration::from_secs(cli.window_size),
            windows_num: cli.windows_num,
            parse_error,
            timers,
            pid_file: cli.pid_file,
            log_level: cli.log_level,
            log_file: cli.log_file,
            debug: cli.debug,
        })
    }

    /// Instantiate the configured plugin from the registry.
    pub fn build_plugin(&self) -> Result<Box<dyn Plugin>> {
        plugins::create(&self.plugin, &self.options, self.pattern.clone())
    }
}

fn compile_pattern(raw: &str) -> Result<Regex> {
    Regex::new(raw).with_context(|| format!("invalid regex '{}'", raw))
}

/// Split `[zone:]wildcard`. The prefix counts as a zone only when it fits
/// the zone grammar; anything else is part of the pattern. Patterns
/// without a zone need basename mode to derive one.
fn split_wildcard(raw: &str, basename: bool) -> Result<(String, String)> {
    if let Some((zone, pattern)) = raw.split_once(':') {
        if valid_zone_name(zone) && !pattern.is_empty() {
            return Ok((zone.to_string(), pattern.to_string()));
        }
        if !basename {
            bail!("invalid zone name in wildcard '{}'", raw);
        }
    }
    if !basename {
        bail!("wildcard '{}' has no zone; use zone:pattern or --basename", raw);
    }
    Ok((zone_name_from_pattern(raw), raw.to_string()))
}
