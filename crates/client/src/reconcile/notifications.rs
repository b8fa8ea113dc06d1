// Notification reconciler: the notification backlog is built only from live
// pushes plus whatever the durable cache restored. Records go Unread -> Read;
// `clear` removes them. Every change is persisted and the unread count is
// forwarded to the platform badge.

use std::sync::{Arc, Mutex, Weak};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use feedsync_common::protocol::envelope::EventType;
use feedsync_common::types::UserId;

use crate::cache::{CacheKey, LocalCache};
use crate::reconcile::optimistic::lock;
use crate::registry::{Subscription, SubscriptionRegistry};

/// Platform unread-count indicator (dock badge, tray icon, ...).
#[async_trait]
pub trait BadgeIndicator: Send + Sync {
    async fn set_count(&self, count: usize) -> Result<()>;
}

/// Badge that ignores every update.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoBadge;

#[async_trait]
impl BadgeIndicator for NoBadge {
    async fn set_count(&self, _count: usize) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Post,
    WallPost,
    PostComment,
    CommentReply,
    FriendAccepted,
}

impl NotificationKind {
    pub fn from_event(event: EventType) -> Option<Self> {
        match event {
            EventType::NewPostNotification | EventType::NewPost => Some(Self::Post),
            EventType::WallPost => Some(Self::WallPost),
            EventType::PostComment => Some(Self::PostComment),
            EventType::CommentReply => Some(Self::CommentReply),
            EventType::FriendAccepted => Some(Self::FriendAccepted),
            EventType::NewMessage => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Post => "post",
            Self::WallPost => "wall_post",
            Self::PostComment => "post_comment",
            Self::CommentReply => "comment_reply",
            Self::FriendAccepted => "friend_accepted",
        }
    }

    /// Payload field holding the user who triggered the notification.
    fn actor_field(self) -> &'static str {
        match self {
            Self::Post | Self::WallPost => "author",
            Self::PostComment => "commenter",
            Self::CommentReply => "replier",
            Self::FriendAccepted => "friend",
        }
    }

    fn describe(self, name: &str) -> String {
        match self {
            Self::Post => format!("{name} shared a new post"),
            Self::WallPost => format!("{name} posted on your wall"),
            Self::PostComment => format!("{name} commented on your post"),
            Self::CommentReply => format!("{name} replied to your comment"),
            Self::FriendAccepted => format!("{name} accepted your friend request"),
        }
    }

    /// Display message: the server's `message` when present, otherwise
    /// synthesized from the actor's name.
    pub fn message_for(self, data: &Value) -> String {
        if let Some(message) = data.get("message").and_then(Value::as_str) {
            if !message.is_empty() {
                return message.to_string();
            }
        }
        let actor = data.get(self.actor_field());
        let name = ["first_name", "username"]
            .iter()
            .filter_map(|field| actor.and_then(|a| a.get(field)).and_then(Value::as_str))
            .find(|value| !value.is_empty())
            .unwrap_or("Someone");
        self.describe(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Client-local, time-derived and strictly increasing.
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub message: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

struct NotificationState {
    /// Newest first.
    items: Vec<Notification>,
    last_id: i64,
    badge: watch::Sender<usize>,
}

impl NotificationState {
    fn unread(&self) -> usize {
        self.items.iter().filter(|n| !n.read).count()
    }

    fn next_id(&mut self, now: DateTime<Utc>) -> i64 {
        self.last_id = now.timestamp_millis().max(self.last_id + 1);
        self.last_id
    }
}

struct Inner {
    cache: LocalCache,
    key: CacheKey,
    state: Mutex<NotificationState>,
}

impl Inner {
    /// Persist and forward the unread count. Called with the state lock held
    /// so cache writes land in mutation order.
    fn commit(&self, state: &NotificationState) {
        self.cache.store_list(&self.key, &state.items);
        let unread = state.unread();
        state.badge.send_if_modified(|count| {
            let changed = *count != unread;
            *count = unread;
            changed
        });
    }

    fn on_push(&self, kind: NotificationKind, data: &Value) -> Result<()> {
        let now = Utc::now();
        let mut state = lock(&self.state);
        let notification = Notification {
            id: state.next_id(now),
            kind,
            message: kind.message_for(data),
            payload: data.clone(),
            read: false,
            created_at: now,
        };
        debug!(id = notification.id, kind = kind.as_str(), "notification received");
        state.items.insert(0, notification);
        self.cache.trim_to_bound(&self.key, &mut state.items);
        self.commit(&state);
        Ok(())
    }
}

/// Owns the notification backlog for one user.
pub struct NotificationReconciler {
    inner: Arc<Inner>,
    subscriptions: Vec<Subscription>,
}

impl NotificationReconciler {
    /// Restore the backlog from `cache` and subscribe to every notification
    /// event. Badge updates are drained by a task on the current runtime.
    pub fn new(
        user_id: UserId,
        cache: LocalCache,
        badge: Arc<dyn BadgeIndicator>,
        registry: &SubscriptionRegistry,
    ) -> Self {
        let key = CacheKey::Notifications(user_id);
        let items: Vec<Notification> = cache.load_list(&key);
        let last_id = items.iter().map(|n| n.id).max().unwrap_or(0);
        let unread = items.iter().filter(|n| !n.read).count();
        info!(restored = items.len(), unread, "notification backlog restored");

        let (badge_tx, badge_rx) = watch::channel(unread);
        spawn_badge_task(badge_rx, badge);

        let inner = Arc::new(Inner {
            cache,
            key,
            state: Mutex::new(NotificationState { items, last_id, badge: badge_tx }),
        });

        let subscriptions = EventType::ALL
            .into_iter()
            .filter_map(|event| NotificationKind::from_event(event).map(|kind| (event, kind)))
            .map(|(event, kind)| {
                let weak: Weak<Inner> = Arc::downgrade(&inner);
                registry.subscribe(event.as_str(), move |data| match weak.upgrade() {
                    Some(inner) => inner.on_push(kind, data),
                    None => Ok(()),
                })
            })
            .collect();

        Self { inner, subscriptions }
    }

    pub fn list(&self) -> Vec<Notification> {
        lock(&self.inner.state).items.clone()
    }

    pub fn unread_count(&self) -> usize {
        lock(&self.inner.state).unread()
    }

    pub fn watch_unread(&self) -> watch::Receiver<usize> {
        lock(&self.inner.state).badge.subscribe()
    }

    /// Mark `id` read. Returns whether it was unread before.
    pub fn mark_read(&self, id: i64) -> bool {
        let mut state = lock(&self.inner.state);
        let Some(notification) = state.items.iter_mut().find(|n| n.id == id && !n.read) else {
            return false;
        };
        notification.read = true;
        self.inner.commit(&state);
        true
    }

    pub fn mark_all_read(&self) -> usize {
        let mut state = lock(&self.inner.state);
        let mut changed = 0;
        for notification in state.items.iter_mut().filter(|n| !n.read) {
            notification.read = true;
            changed += 1;
        }
        if changed > 0 {
            self.inner.commit(&state);
        }
        changed
    }

    /// Remove every record, durably.
    pub fn clear(&self) {
        let mut state = lock(&self.inner.state);
        state.items.clear();
        self.inner.commit(&state);
        info!("notifications cleared");
    }

    pub fn detach(&mut self) {
        self.subscriptions.clear();
    }
}

fn spawn_badge_task(mut rx: watch::Receiver<usize>, badge: Arc<dyn BadgeIndicator>) {
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        debug!("no runtime; badge updates disabled");
        return;
    };
    handle.spawn(async move {
        loop {
            let count = *rx.borrow_and_update();
            if let Err(error) = badge.set_count(count).await {
                warn!(count, error = %format!("{error:#}"), "badge update failed");
            }
            if rx.changed().await.is_err() {
                break;
            }
        }
    });
}
