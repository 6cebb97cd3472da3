use std::fs;

use clap::Parser;
use tailstat::{Cli, Config};
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = Config::from_cli(cli)?;

    // Initialise structured logging. --log-level wins over RUST_LOG.
    let default_level = if cfg.debug {
        "debug"
    } else {
        cfg.log_level.as_deref().unwrap_or("info")
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    match &cfg.log_file {
        Some(path) => {
            let file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            fmt()
                .with_env_filter(filter)
                .with_writer(std::sync::Mutex::new(file))
                .with_ansi(false)
                .init();
        }
        None => {
            fmt().with_env_filter(filter).init();
        }
    }

    let pid_file = cfg.pid_file.clone();
    if let Some(path) = &pid_file {
        fs::write(path, format!("{}\n", std::process::id()))?;
    }

    let result = tailstat::run(cfg).await;

    if let Some(path) = &pid_file {
        let _ = fs::remove_file(path);
    }
    result
}
