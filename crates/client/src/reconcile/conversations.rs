// Conversation reconciler: conversation summaries plus the live view of the
// open conversation.
//
// Local sends are appended provisionally and replaced in place by the
// confirmed server message (looked up by correlation id). Opening a
// conversation always refetches the authoritative history and replaces the
// view; a history result for a superseded selection is discarded.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use feedsync_common::protocol::envelope::EventType;
use feedsync_common::types::{ConversationSummary, Message, MessageId, UserId, UserSummary};

use crate::api::{CommandError, CommandResult, MessagingApi};
use crate::reconcile::optimistic::{lock, OptimisticMutation};
use crate::registry::{Subscription, SubscriptionRegistry};

/// How long an incoming-message alert stays visible.
pub const ALERT_TTL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Provisional; the send command has not resolved yet.
    Pending { correlation: Uuid },
    Confirmed,
    /// The send command failed. The entry stays visible, flagged.
    Failed { correlation: Uuid, error: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationMessage {
    pub message: Message,
    pub delivery: Delivery,
}

impl ConversationMessage {
    fn confirmed(message: Message) -> Self {
        Self { message, delivery: Delivery::Confirmed }
    }

    fn server_id(&self) -> Option<MessageId> {
        matches!(self.delivery, Delivery::Confirmed).then_some(self.message.id)
    }

    fn correlation(&self) -> Option<Uuid> {
        match &self.delivery {
            Delivery::Pending { correlation } | Delivery::Failed { correlation, .. } => {
                Some(*correlation)
            }
            Delivery::Confirmed => None,
        }
    }
}

/// Snapshot of the open conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveConversation {
    pub peer_id: UserId,
    /// Arrival order, not server timestamp order.
    pub messages: Vec<ConversationMessage>,
    pub loading: bool,
}

impl ActiveConversation {
    fn contains_server_id(&self, id: MessageId) -> bool {
        self.messages.iter().any(|entry| entry.server_id() == Some(id))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingAlert {
    pub sender_id: UserId,
    pub sender_username: String,
    pub content: String,
    pub received_at: Instant,
}

struct ConversationState {
    summaries: Vec<ConversationSummary>,
    active: Option<ActiveConversation>,
    alert: Option<IncomingAlert>,
    selection_epoch: u64,
    summary_requested: u64,
    summary_applied: u64,
    next_provisional_id: MessageId,
    revision: watch::Sender<u64>,
}

impl ConversationState {
    fn touch(&mut self) {
        self.revision.send_modify(|revision| *revision += 1);
    }

    fn active_for(&mut self, peer_id: UserId) -> Option<&mut ActiveConversation> {
        self.active.as_mut().filter(|active| active.peer_id == peer_id)
    }

    fn replace_history(&mut self, history: Vec<Message>) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        let interim = std::mem::take(&mut active.messages);
        active.messages = history.into_iter().map(ConversationMessage::confirmed).collect();
        // Keep whatever arrived while the history was loading and is not in it.
        for entry in interim {
            let duplicate = entry.server_id().is_some_and(|id| active.contains_server_id(id));
            if !duplicate {
                active.messages.push(entry);
            }
        }
        active.loading = false;
        self.touch();
    }

    fn confirm_send(&mut self, correlation: Uuid, confirmed: &Message) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        let Some(index) =
            active.messages.iter().position(|entry| entry.correlation() == Some(correlation))
        else {
            return;
        };
        if active.contains_server_id(confirmed.id) {
            active.messages.remove(index);
        } else {
            active.messages[index] = ConversationMessage::confirmed(confirmed.clone());
        }
        self.touch();
    }

    fn fail_send(&mut self, correlation: Uuid, error: &CommandError) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        if let Some(entry) =
            active.messages.iter_mut().find(|entry| entry.correlation() == Some(correlation))
        {
            entry.delivery = Delivery::Failed { correlation, error: error.to_string() };
            self.touch();
        }
    }
}

struct Inner {
    me: UserId,
    api: Arc<dyn MessagingApi>,
    state: Mutex<ConversationState>,
}

impl Inner {
    async fn refresh_summaries(&self) -> CommandResult<()> {
        let request = {
            let mut state = lock(&self.state);
            state.summary_requested += 1;
            state.summary_requested
        };
        let mut summaries = self.api.conversations().await?;
        for summary in &mut summaries {
            if summary.last_message.as_ref().is_some_and(|m| m.sender.id == self.me) {
                summary.unread_count = 0;
            }
        }

        let mut state = lock(&self.state);
        if request < state.summary_applied {
            debug!(request, "discarding out-of-order conversation list");
            return Ok(());
        }
        state.summary_applied = request;
        state.summaries = summaries;
        state.touch();
        Ok(())
    }

    fn on_new_message(self: &Arc<Self>, data: &Value) -> anyhow::Result<()> {
        let message: Message =
            serde_json::from_value(data.clone()).context("invalid new_message payload")?;
        if message.sender.id == self.me {
            debug!(message_id = message.id, "ignoring echo of own message");
            return Ok(());
        }

        {
            let mut state = lock(&self.state);
            let sender_id = message.sender.id;
            if let Some(active) = state.active_for(sender_id) {
                if !active.contains_server_id(message.id) {
                    active.messages.push(ConversationMessage::confirmed(message));
                }
            } else {
                state.alert = Some(IncomingAlert {
                    sender_id,
                    sender_username: message.sender.username.clone(),
                    content: message.content.clone(),
                    received_at: Instant::now(),
                });
            }
            state.touch();
        }

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let inner = Arc::clone(self);
            handle.spawn(async move {
                if let Err(error) = inner.refresh_summaries().await {
                    warn!(%error, "conversation list refresh failed");
                }
            });
        }
        Ok(())
    }
}

/// Owns conversation state for one session.
pub struct ConversationReconciler {
    inner: Arc<Inner>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl ConversationReconciler {
    pub fn new(me: UserId, api: Arc<dyn MessagingApi>, registry: &SubscriptionRegistry) -> Self {
        let (revision, _) = watch::channel(0);
        let inner = Arc::new(Inner {
            me,
            api,
            state: Mutex::new(ConversationState {
                summaries: Vec::new(),
                active: None,
                alert: None,
                selection_epoch: 0,
                summary_requested: 0,
                summary_applied: 0,
                next_provisional_id: -1,
                revision,
            }),
        });

        let weak: Weak<Inner> = Arc::downgrade(&inner);
        let subscription = registry.subscribe(EventType::NewMessage.as_str(), move |data| {
            match weak.upgrade() {
                Some(inner) => inner.on_new_message(data),
                None => Ok(()),
            }
        });

        Self { inner, subscriptions: Mutex::new(vec![subscription]) }
    }

    /// Bumped on every state change.
    pub fn changes(&self) -> watch::Receiver<u64> {
        lock(&self.inner.state).revision.subscribe()
    }

    pub async fn refresh_conversations(&self) -> CommandResult<()> {
        self.inner.refresh_summaries().await
    }

    pub fn list_conversations(&self) -> Vec<ConversationSummary> {
        lock(&self.inner.state).summaries.clone()
    }

    pub fn unread_message_count(&self) -> u32 {
        lock(&self.inner.state).summaries.iter().map(|s| s.unread_count).sum()
    }

    pub fn active_conversation(&self) -> Option<ActiveConversation> {
        lock(&self.inner.state).active.clone()
    }

    /// The latest alert for a message from a peer that is not open, if it
    /// has not expired.
    pub fn incoming_alert(&self) -> Option<IncomingAlert> {
        lock(&self.inner.state)
            .alert
            .clone()
            .filter(|alert| alert.received_at.elapsed() < ALERT_TTL)
    }

    pub fn dismiss_alert(&self) {
        let mut state = lock(&self.inner.state);
        if state.alert.take().is_some() {
            state.touch();
        }
    }

    /// Select `peer_id`, refetch its history, replace the live view, then
    /// mark it read.
    pub async fn open_conversation(&self, peer_id: UserId) -> CommandResult<()> {
        let epoch = {
            let mut state = lock(&self.inner.state);
            state.selection_epoch += 1;
            state.active =
                Some(ActiveConversation { peer_id, messages: Vec::new(), loading: true });
            if state.alert.as_ref().is_some_and(|alert| alert.sender_id == peer_id) {
                state.alert = None;
            }
            state.touch();
            state.selection_epoch
        };

        let history = self.inner.api.conversation(peer_id).await;
        {
            let mut state = lock(&self.inner.state);
            if state.selection_epoch != epoch {
                debug!(peer_id, "discarding history for a superseded selection");
                return Ok(());
            }
            match history {
                Ok(history) => state.replace_history(history),
                Err(error) => {
                    if let Some(active) = state.active.as_mut() {
                        active.loading = false;
                    }
                    state.touch();
                    return Err(error);
                }
            }
        }

        match self.inner.api.mark_all_read(peer_id).await {
            Ok(count) => debug!(peer_id, count, "conversation marked read"),
            Err(error) => warn!(peer_id, %error, "mark-read failed"),
        }
        if let Err(error) = self.inner.refresh_summaries().await {
            warn!(%error, "conversation list refresh failed");
        }
        Ok(())
    }

    /// Refetch the open conversation's history and replace the live view.
    pub async fn resync_active(&self) -> CommandResult<()> {
        let (peer_id, epoch) = {
            let state = lock(&self.inner.state);
            match &state.active {
                Some(active) => (active.peer_id, state.selection_epoch),
                None => return Ok(()),
            }
        };
        let history = self.inner.api.conversation(peer_id).await?;
        let mut state = lock(&self.inner.state);
        if state.selection_epoch == epoch {
            state.replace_history(history);
        }
        Ok(())
    }

    pub fn close_conversation(&self) {
        let mut state = lock(&self.inner.state);
        state.selection_epoch += 1;
        if state.active.take().is_some() {
            state.touch();
        }
    }

    /// Send `text` to `peer_id`. The message shows up in the live view
    /// immediately; a failure leaves it flagged as failed.
    pub async fn send(&self, peer_id: UserId, text: &str) -> CommandResult<Message> {
        let content = text.trim();
        if content.is_empty() {
            return Err(CommandError::Invalid("message must not be empty".to_string()));
        }

        let me = self.inner.me;
        let mutation = OptimisticMutation::new("send_message");
        let correlation = mutation.correlation();
        let result = mutation
            .run(
                &self.inner.state,
                |state| {
                    let id = state.next_provisional_id;
                    state.next_provisional_id -= 1;
                    if let Some(active) = state.active_for(peer_id) {
                        active.messages.push(ConversationMessage {
                            message: Message {
                                id,
                                sender: UserSummary::new(me, String::new()),
                                content: content.to_string(),
                                created_at: Utc::now(),
                                is_read: true,
                            },
                            delivery: Delivery::Pending { correlation },
                        });
                        state.touch();
                    }
                },
                self.inner.api.send_message(peer_id, content),
                |state, confirmed| state.confirm_send(correlation, confirmed),
                |state, error| state.fail_send(correlation, error),
            )
            .await;

        match &result {
            Ok(message) => {
                info!(peer_id, message_id = message.id, "message sent");
                if let Err(error) = self.inner.refresh_summaries().await {
                    warn!(%error, "conversation list refresh failed");
                }
            }
            Err(error) => warn!(peer_id, %error, "message send failed"),
        }
        result
    }

    /// Detach from the registry and forget all state.
    pub fn reset(&self) {
        lock(&self.subscriptions).clear();
        let mut state = lock(&self.inner.state);
        state.summaries.clear();
        state.active = None;
        state.alert = None;
        state.selection_epoch += 1;
        // In-flight list fetches predate the reset and must not land.
        state.summary_requested += 1;
        state.summary_applied = state.summary_requested;
        state.touch();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::testing::{message, user, MockMessaging};
    use serde_json::json;

    const ME: UserId = 1;
    const PEER: UserId = 42;

    fn push(registry: &SubscriptionRegistry, message: &Message) {
        registry.publish("new_message", &serde_json::to_value(message).unwrap());
    }

    fn contents(reconciler: &ConversationReconciler) -> Vec<String> {
        reconciler
            .active_conversation()
            .map(|active| active.messages.iter().map(|m| m.message.content.clone()).collect())
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn open_replaces_view_with_history_and_marks_read() {
        let api = Arc::new(MockMessaging::default());
        api.set_history(PEER, vec![message(10, PEER, "old")]);
        let registry = SubscriptionRegistry::new();
        let reconciler = ConversationReconciler::new(ME, api.clone(), &registry);

        reconciler.open_conversation(PEER).await.unwrap();

        let active = reconciler.active_conversation().unwrap();
        assert_eq!(active.peer_id, PEER);
        assert!(!active.loading);
        assert_eq!(contents(&reconciler), vec!["old"]);
        assert_eq!(api.marked_read(), vec![PEER]);
    }

    #[tokio::test]
    async fn push_after_opening_empty_conversation_yields_one_message() {
        let api = Arc::new(MockMessaging::default());
        let registry = SubscriptionRegistry::new();
        let reconciler = ConversationReconciler::new(ME, api.clone(), &registry);

        reconciler.open_conversation(PEER).await.unwrap();
        let incoming = message(11, PEER, "hello");
        // The server now also reports it in history; a refetch must not duplicate it.
        api.set_history(PEER, vec![incoming.clone()]);
        push(&registry, &incoming);
        reconciler.resync_active().await.unwrap();
        push(&registry, &incoming);

        assert_eq!(contents(&reconciler), vec!["hello"]);
    }

    #[tokio::test]
    async fn push_during_history_load_survives_replacement() {
        let api = Arc::new(MockMessaging::default());
        let gate = api.gate_history();
        api.set_history(PEER, vec![message(10, PEER, "old")]);
        let registry = SubscriptionRegistry::new();
        let reconciler = Arc::new(ConversationReconciler::new(ME, api.clone(), &registry));

        let opening = tokio::spawn({
            let reconciler = Arc::clone(&reconciler);
            async move { reconciler.open_conversation(PEER).await }
        });
        while reconciler.active_conversation().is_none() {
            tokio::task::yield_now().await;
        }
        push(&registry, &message(12, PEER, "during load"));
        push(&registry, &message(10, PEER, "old"));
        gate.send(()).unwrap();
        opening.await.unwrap().unwrap();

        assert_eq!(contents(&reconciler), vec!["old", "during load"]);
    }

    #[tokio::test]
    async fn stale_history_is_discarded_after_switching_peers() {
        let api = Arc::new(MockMessaging::default());
        let gate = api.gate_history();
        api.set_history(PEER, vec![message(10, PEER, "from 42")]);
        let registry = SubscriptionRegistry::new();
        let reconciler = Arc::new(ConversationReconciler::new(ME, api.clone(), &registry));

        let first = tokio::spawn({
            let reconciler = Arc::clone(&reconciler);
            async move { reconciler.open_conversation(PEER).await }
        });
        while reconciler.active_conversation().is_none() {
            tokio::task::yield_now().await;
        }
        reconciler.close_conversation();
        gate.send(()).unwrap();
        first.await.unwrap().unwrap();

        assert!(reconciler.active_conversation().is_none());
        assert!(api.marked_read().is_empty());
    }

    #[tokio::test]
    async fn send_while_disconnected_leaves_exactly_one_entry_despite_echo() {
        let api = Arc::new(MockMessaging::default());
        let registry = SubscriptionRegistry::new();
        let reconciler = Arc::new(ConversationReconciler::new(ME, api.clone(), &registry));
        reconciler.open_conversation(PEER).await.unwrap();

        let gate = api.gate_send();
        let sending = tokio::spawn({
            let reconciler = Arc::clone(&reconciler);
            async move { reconciler.send(PEER, "hi").await }
        });
        while contents(&reconciler).is_empty() {
            tokio::task::yield_now().await;
        }
        let provisional = reconciler.active_conversation().unwrap().messages[0].clone();
        assert!(matches!(provisional.delivery, Delivery::Pending { .. }));

        // Server echoes our own message before the command resolves.
        let confirmed = message(500, ME, "hi");
        push(&registry, &confirmed);
        gate.send(()).unwrap();
        let sent = sending.await.unwrap().unwrap();

        assert_eq!(sent.id, 500);
        let active = reconciler.active_conversation().unwrap();
        assert_eq!(active.messages.len(), 1);
        assert_eq!(active.messages[0].message.id, 500);
        assert_eq!(active.messages[0].delivery, Delivery::Confirmed);
    }

    #[tokio::test]
    async fn failed_send_is_flagged_not_removed() {
        let api = Arc::new(MockMessaging::default());
        api.fail_sends(CommandError::rejected(403, "You cannot message this user"));
        let registry = SubscriptionRegistry::new();
        let reconciler = ConversationReconciler::new(ME, api.clone(), &registry);
        reconciler.open_conversation(PEER).await.unwrap();

        let error = reconciler.send(PEER, "hey").await.unwrap_err();
        assert_eq!(error.status(), Some(403));

        let active = reconciler.active_conversation().unwrap();
        assert_eq!(active.messages.len(), 1);
        match &active.messages[0].delivery {
            Delivery::Failed { error, .. } => assert_eq!(error, "You cannot message this user"),
            other => panic!("expected failed delivery, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_send_is_rejected_locally() {
        let api = Arc::new(MockMessaging::default());
        let reconciler = ConversationReconciler::new(ME, api.clone(), &SubscriptionRegistry::new());
        let error = reconciler.send(PEER, "   ").await.unwrap_err();
        assert!(matches!(error, CommandError::Invalid(_)));
        assert!(api.sent().is_empty());
    }

    #[tokio::test]
    async fn push_from_other_peer_raises_alert_until_opened() {
        let api = Arc::new(MockMessaging::default());
        let registry = SubscriptionRegistry::new();
        let reconciler = ConversationReconciler::new(ME, api.clone(), &registry);

        push(&registry, &message(20, 7, "psst"));
        let alert = reconciler.incoming_alert().unwrap();
        assert_eq!(alert.sender_id, 7);
        assert_eq!(alert.content, "psst");

        reconciler.open_conversation(7).await.unwrap();
        assert!(reconciler.incoming_alert().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn alert_expires() {
        let registry = SubscriptionRegistry::new();
        let reconciler =
            ConversationReconciler::new(ME, Arc::new(MockMessaging::default()), &registry);
        push(&registry, &message(20, 7, "psst"));
        assert!(reconciler.incoming_alert().is_some());
        tokio::time::sleep(ALERT_TTL + Duration::from_millis(1)).await;
        assert!(reconciler.incoming_alert().is_none());
    }

    #[tokio::test]
    async fn own_last_message_forces_zero_unread() {
        let api = Arc::new(MockMessaging::default());
        api.set_summaries(vec![
            ConversationSummary {
                user: user(PEER),
                last_message: Some(message(1, ME, "mine")),
                unread_count: 3,
            },
            ConversationSummary {
                user: user(7),
                last_message: Some(message(2, 7, "theirs")),
                unread_count: 2,
            },
        ]);
        let reconciler = ConversationReconciler::new(ME, api, &SubscriptionRegistry::new());

        reconciler.refresh_conversations().await.unwrap();
        assert_eq!(reconciler.unread_message_count(), 2);
        assert_eq!(reconciler.list_conversations()[0].unread_count, 0);
    }

    #[tokio::test]
    async fn malformed_push_is_rejected_without_state_change() {
        let registry = SubscriptionRegistry::new();
        let reconciler =
            ConversationReconciler::new(ME, Arc::new(MockMessaging::default()), &registry);
        assert_eq!(registry.publish("new_message", &json!({"nope": true})), 1);
        assert!(reconciler.incoming_alert().is_none());
    }

    #[tokio::test]
    async fn list_fetched_before_reset_is_discarded() {
        let api = Arc::new(MockMessaging::default());
        api.set_summaries(vec![ConversationSummary {
            user: user(PEER),
            last_message: Some(message(1, PEER, "hey")),
            unread_count: 4,
        }]);
        let gate = api.gate_summaries();
        let reconciler =
            Arc::new(ConversationReconciler::new(ME, api.clone(), &SubscriptionRegistry::new()));

        let refreshing = tokio::spawn({
            let reconciler = Arc::clone(&reconciler);
            async move { reconciler.refresh_conversations().await }
        });
        while api.summary_fetches() == 0 {
            tokio::task::yield_now().await;
        }
        reconciler.reset();
        gate.send(()).unwrap();
        refreshing.await.unwrap().unwrap();

        assert!(reconciler.list_conversations().is_empty());
        assert_eq!(reconciler.unread_message_count(), 0);

        // A fetch issued after the reset still applies.
        reconciler.refresh_conversations().await.unwrap();
        assert_eq!(reconciler.unread_message_count(), 4);
    }

    #[tokio::test]
    async fn reset_unsubscribes() {
        let registry = SubscriptionRegistry::new();
        let reconciler =
            ConversationReconciler::new(ME, Arc::new(MockMessaging::default()), &registry);
        assert_eq!(registry.subscriber_count("new_message"), 1);
        reconciler.reset();
        assert_eq!(registry.subscriber_count("new_message"), 0);
    }
}
