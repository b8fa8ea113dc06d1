// Session context: everything one logged-in user needs, created on login
// and torn down on logout.
//
// Reconcilers subscribe before the channel opens so no early push is lost.
// While the channel is down, conversations fall back to periodic polling.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use feedsync_common::types::UserId;

use crate::api::{FriendsApi, MessagingApi, StoriesApi};
use crate::cache::LocalCache;
use crate::config::ClientConfig;
use crate::realtime::transport::Transport;
use crate::realtime::{ConnectionManager, ConnectionState, Credential};
use crate::reconcile::{
    BadgeIndicator, ConversationReconciler, FriendReconciler, NotificationReconciler,
    StoryReconciler,
};
use crate::registry::SubscriptionRegistry;

/// Command collaborators for one session.
#[derive(Clone)]
pub struct SessionApis {
    pub messaging: Arc<dyn MessagingApi>,
    pub friends: Arc<dyn FriendsApi>,
    pub stories: Arc<dyn StoriesApi>,
}

struct Poller {
    shutdown_tx: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

pub struct Session {
    credential: Credential,
    registry: SubscriptionRegistry,
    connection: ConnectionManager,
    conversations: Arc<ConversationReconciler>,
    notifications: NotificationReconciler,
    friends: FriendReconciler,
    stories: StoryReconciler,
    poller: Option<Poller>,
}

impl Session {
    /// Build every component for `credential`, open the channel and run the
    /// initial best-effort fetches.
    pub async fn start(
        config: &ClientConfig,
        credential: Credential,
        apis: SessionApis,
        badge: Arc<dyn BadgeIndicator>,
        transport: Arc<dyn Transport>,
        cache: LocalCache,
    ) -> Result<Self> {
        let me = credential.user_id;
        let registry = SubscriptionRegistry::new();

        let conversations =
            Arc::new(ConversationReconciler::new(me, apis.messaging.clone(), &registry));
        let notifications = NotificationReconciler::new(me, cache.clone(), badge, &registry);
        let friends = FriendReconciler::new(apis.friends.clone(), &registry);
        let stories = StoryReconciler::new(me, apis.stories.clone(), cache);

        let mut connection =
            ConnectionManager::new(config.realtime.clone(), transport, registry.clone());
        connection.connect(&credential).await?;

        let poller = config.realtime.fallback_poll_interval().map(|interval| {
            spawn_poller(interval, connection.watch_state(), Arc::clone(&conversations))
        });

        let session = Self {
            credential,
            registry,
            connection,
            conversations,
            notifications,
            friends,
            stories,
            poller,
        };
        session.initial_fetch().await;
        info!(user_id = me, "session started");
        Ok(session)
    }

    async fn initial_fetch(&self) {
        let (conversations, friends, stories) = tokio::join!(
            self.conversations.refresh_conversations(),
            self.friends.refresh(),
            self.stories.refresh(),
        );
        let results =
            [("conversations", conversations), ("friends", friends), ("stories", stories)];
        for (what, result) in results {
            if let Err(error) = result {
                warn!(what, %error, "initial fetch failed");
            }
        }
    }

    pub fn user_id(&self) -> UserId {
        self.credential.user_id
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    pub fn conversations(&self) -> &ConversationReconciler {
        &self.conversations
    }

    pub fn notifications(&self) -> &NotificationReconciler {
        &self.notifications
    }

    pub fn friends(&self) -> &FriendReconciler {
        &self.friends
    }

    pub fn stories(&self) -> &StoryReconciler {
        &self.stories
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.connection.watch_state()
    }

    pub fn live_updates_available(&self) -> bool {
        self.connection.live_updates_available()
    }

    /// Swap the bearer token of the same user and reopen the channel.
    /// Pending reconnects for the old token are cancelled.
    pub async fn change_credential(&mut self, credential: Credential) -> Result<()> {
        if credential.user_id != self.credential.user_id {
            return Err(anyhow!(
                "credential belongs to user {} but the session is for user {}; start a new session",
                credential.user_id,
                self.credential.user_id
            ));
        }
        self.connection.connect(&credential).await?;
        self.credential = credential;
        info!(user_id = self.credential.user_id, "session credential changed");
        Ok(())
    }

    /// Unsubscribe every reconciler and close the channel.
    pub async fn shutdown(mut self) {
        if let Some(poller) = self.poller.take() {
            let _ = poller.shutdown_tx.send(());
            let _ = poller.task.await;
        }
        self.conversations.reset();
        self.notifications.detach();
        self.friends.reset();
        self.stories.reset();
        self.connection.teardown().await;
        info!(user_id = self.credential.user_id, "session shut down");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(poller) = self.poller.take() {
            let _ = poller.shutdown_tx.send(());
            poller.task.abort();
        }
    }
}

fn spawn_poller(
    interval: Duration,
    state: watch::Receiver<ConnectionState>,
    conversations: Arc<ConversationReconciler>,
) -> Poller {
    let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            if *state.borrow() == ConnectionState::Connected {
                continue;
            }
            debug!("channel down; polling conversations");
            if let Err(error) = conversations.refresh_conversations().await {
                warn!(%error, "conversation poll failed");
            }
            if let Err(error) = conversations.resync_active().await {
                warn!(%error, "active conversation poll failed");
            }
        }
    });
    Poller { shutdown_tx, task }
}
