// `feedsync tail`: hold the push channel open and print every event.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use async_trait::async_trait;
use clap::Args;
use feedsync_client::cache::LocalCache;
use feedsync_client::realtime::transport::WsTransport;
use feedsync_client::realtime::{ConnectionManager, ConnectionState, Credential, LiveUpdates};
use feedsync_client::reconcile::{BadgeIndicator, NotificationReconciler};
use feedsync_client::registry::{Subscription, SubscriptionRegistry};
use feedsync_common::protocol::envelope::EventType;
use feedsync_common::types::UserId;
use tracing::info;

use crate::output::{self, OutputFormat};

/// Environment variable consulted when `--token` is omitted.
pub const TOKEN_ENV: &str = "FEEDSYNC_TOKEN";

#[derive(Debug, Args)]
pub struct TailArgs {
    /// Account to connect as.
    #[arg(long)]
    pub user_id: UserId,

    /// Access token (falls back to $FEEDSYNC_TOKEN).
    #[arg(long)]
    pub token: Option<String>,

    /// Override the configured push host, e.g. `localhost:8000`.
    #[arg(long)]
    pub host: Option<String>,

    /// Path to a config file (defaults to ~/.feedsync/config.toml).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Path to the cache database.
    #[arg(long)]
    pub cache: Option<PathBuf>,

    /// Print events as JSON lines.
    #[arg(long)]
    pub json: bool,
}

/// Reports unread-count changes on stderr instead of an app icon.
struct LogBadge;

#[async_trait]
impl BadgeIndicator for LogBadge {
    async fn set_count(&self, count: usize) -> anyhow::Result<()> {
        info!(unread = count, "badge updated");
        Ok(())
    }
}

pub async fn run(args: TailArgs) -> anyhow::Result<()> {
    let format = OutputFormat::detect(args.json);
    let token = resolve_token(args.token, std::env::var(TOKEN_ENV).ok())?;
    let mut config = super::load_config(args.config.as_deref())?;
    if let Some(host) = args.host {
        config.realtime.host = host;
    }

    let location = super::cache_location(&config, args.cache);
    let cache = LocalCache::open_or_in_memory(location.as_deref(), &config.cache)?;
    let registry = SubscriptionRegistry::new();

    // Persist notifications exactly like a full session would.
    let mut notifications =
        NotificationReconciler::new(args.user_id, cache, Arc::new(LogBadge), &registry);
    let printers = subscribe_printers(&registry, format);

    let mut manager =
        ConnectionManager::new(config.realtime.clone(), Arc::new(WsTransport), registry);
    manager
        .connect(&Credential::new(args.user_id, token))
        .await
        .context("failed to start push channel")?;

    let mut state = manager.watch_state();
    let mut live = manager.watch_live_updates();
    let outcome = loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for ctrl-c")?;
                info!("interrupted");
                break Ok(());
            }
            changed = state.changed() => {
                if changed.is_err() {
                    break Ok(());
                }
                log_state(*state.borrow_and_update());
            }
            changed = live.changed() => {
                if changed.is_err() {
                    break Ok(());
                }
                if *live.borrow_and_update() == LiveUpdates::Unavailable {
                    output::print_error(
                        format,
                        "LIVE_UPDATES_UNAVAILABLE",
                        "push channel gave up reconnecting",
                    );
                    break Err(anyhow::anyhow!("live updates unavailable"));
                }
            }
        }
    };

    manager.teardown().await;
    drop(printers);
    notifications.detach();
    info!(unread = notifications.unread_count(), "tail finished");
    outcome
}

fn resolve_token(flag: Option<String>, env: Option<String>) -> anyhow::Result<String> {
    match flag.or(env).filter(|t| !t.trim().is_empty()) {
        Some(token) => Ok(token),
        None => bail!("no access token: pass --token or set {TOKEN_ENV}"),
    }
}

fn subscribe_printers(registry: &SubscriptionRegistry, format: OutputFormat) -> Vec<Subscription> {
    EventType::ALL
        .into_iter()
        .map(|event| {
            registry.subscribe(event.as_str(), move |data| {
                output::print_event(format, event.as_str(), data)?;
                Ok(())
            })
        })
        .collect()
}

fn log_state(state: ConnectionState) {
    match state {
        ConnectionState::Reconnecting { attempt } => info!(attempt, "reconnecting"),
        other => info!(state = ?other, "connection state changed"),
    }
}
