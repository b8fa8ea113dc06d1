// CLI subcommand dispatch.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Subcommand;
use feedsync_client::config::ClientConfig;

pub mod notifications;
pub mod tail;

#[derive(Subcommand)]
pub enum Command {
    /// Connect to the push channel and print events as they arrive
    Tail(tail::TailArgs),
    /// Inspect or clear the cached notification backlog
    Notifications(notifications::NotificationsArgs),
}

pub async fn run(cmd: Command) -> anyhow::Result<()> {
    match cmd {
        Command::Tail(args) => tail::run(args).await,
        Command::Notifications(args) => notifications::run(args),
    }
}

/// Explicit `--config` must exist and parse; otherwise fall back to the
/// global config, or defaults.
pub(crate) fn load_config(path: Option<&Path>) -> anyhow::Result<ClientConfig> {
    match path {
        Some(path) => ClientConfig::load_from(path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        None => Ok(ClientConfig::load()),
    }
}

/// `--cache` overrides the configured database location.
pub(crate) fn cache_location(config: &ClientConfig, cache: Option<PathBuf>) -> Option<PathBuf> {
    cache.or_else(|| config.cache_path())
}
