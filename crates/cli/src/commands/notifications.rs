// `feedsync notifications`: inspect or clear the cached backlog.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::bail;
use clap::{Args, Subcommand};
use feedsync_client::cache::LocalCache;
use feedsync_client::reconcile::{NoBadge, Notification, NotificationReconciler};
use feedsync_client::registry::SubscriptionRegistry;
use feedsync_common::types::UserId;
use serde::Serialize;

use crate::output::{self, OutputFormat};

#[derive(Debug, Args)]
pub struct NotificationsArgs {
    #[command(subcommand)]
    pub action: NotificationsAction,

    /// Account whose backlog to read.
    #[arg(long)]
    pub user_id: UserId,

    /// Path to a config file (defaults to ~/.feedsync/config.toml).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Path to the cache database.
    #[arg(long)]
    pub cache: Option<PathBuf>,

    /// Output as JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Subcommand)]
pub enum NotificationsAction {
    /// List notifications, newest first
    List {
        /// Only show unread notifications.
        #[arg(long)]
        unread: bool,
    },
    /// Mark one notification as read
    Read {
        /// Notification id as shown by `list`.
        id: i64,
    },
    /// Mark every notification as read
    ReadAll,
    /// Drop the whole backlog
    Clear,
}

#[derive(Debug, Serialize)]
struct ListOutput {
    user_id: UserId,
    unread: usize,
    notifications: Vec<Notification>,
}

#[derive(Debug, Serialize)]
struct UpdateOutput {
    user_id: UserId,
    changed: usize,
    unread: usize,
}

pub fn run(args: NotificationsArgs) -> anyhow::Result<()> {
    let format = OutputFormat::detect(args.json);
    let config = super::load_config(args.config.as_deref())?;
    let location = super::cache_location(&config, args.cache);
    let cache = LocalCache::open_or_in_memory(location.as_deref(), &config.cache)?;

    // A private registry: nothing is published, the reconciler is only a
    // view over the cached backlog.
    let registry = SubscriptionRegistry::new();
    let reconciler =
        NotificationReconciler::new(args.user_id, cache, Arc::new(NoBadge), &registry);

    match args.action {
        NotificationsAction::List { unread } => {
            let notifications: Vec<Notification> =
                reconciler.list().into_iter().filter(|n| !unread || !n.read).collect();
            let result = ListOutput {
                user_id: args.user_id,
                unread: reconciler.unread_count(),
                notifications,
            };
            output::print_output(format, &result, format_list)?;
        }
        NotificationsAction::Read { id } => {
            let changed = mark_one(&reconciler, id)?;
            let unread = reconciler.unread_count();
            let result = UpdateOutput { user_id: args.user_id, changed, unread };
            output::print_output(format, &result, |r| match r.changed {
                0 => format!("notification {id} was already read; {} unread", r.unread),
                _ => format!("{} unread", r.unread),
            })?;
        }
        NotificationsAction::ReadAll => {
            let changed = reconciler.mark_all_read();
            let result = UpdateOutput { user_id: args.user_id, changed, unread: 0 };
            output::print_output(format, &result, |r| format!("marked {} read", r.changed))?;
        }
        NotificationsAction::Clear => {
            let changed = reconciler.list().len();
            reconciler.clear();
            let result = UpdateOutput { user_id: args.user_id, changed, unread: 0 };
            output::print_output(format, &result, |r| format!("cleared {}", r.changed))?;
        }
    }

    Ok(())
}

/// Mark `id` read. Returns how many records changed: 0 when it was
/// already read, an error when there is no such record.
fn mark_one(reconciler: &NotificationReconciler, id: i64) -> anyhow::Result<usize> {
    if !reconciler.list().iter().any(|n| n.id == id) {
        bail!("notification {id} not found");
    }
    Ok(usize::from(reconciler.mark_read(id)))
}

fn format_list(result: &ListOutput) -> String {
    if result.notifications.is_empty() {
        return "No notifications.".to_string();
    }

    let mut out = format!("{} unread\n", result.unread);
    for n in &result.notifications {
        let marker = if n.read { ' ' } else { '*' };
        out.push_str(&format!(
            "{marker} {:<15} {:<14} {}  ({})\n",
            n.id,
            n.kind.as_str(),
            n.message,
            n.created_at.format("%Y-%m-%d %H:%M"),
        ));
    }
    out.pop();
    out
}
