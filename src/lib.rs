//! Core library for tailstat. This module wires together the tail
//! watchers, the wildcard expander, the zone store, the plugin registry,
//! the query server and the persistence layer under one engine. It
//! deliberately keeps everything embeddable: tests and the binary both
//! drive the same [`Engine`].

mod config;
pub mod engine;
pub mod expand;
pub mod persist;
pub mod plugins;
pub mod server;
pub mod timer;
pub mod util;
pub mod watch;
pub mod zone;

pub use config::{Cli, Config};
pub use engine::{Engine, EngineHandle};

/// Build and run the daemon until shutdown. The final snapshot is on
/// disk when this returns.
pub async fn run(cfg: Config) -> anyhow::Result<()> {
    let engine = Engine::new(cfg).await?;
    engine.run().await
}
