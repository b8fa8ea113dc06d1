// In-memory command collaborators shared by reconciler tests.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use tokio::sync::oneshot;

use feedsync_common::types::{
    ConversationSummary, FriendRequest, FriendRequestId, Message, MessageId, Reaction,
    ReactionCounts, Story, StoryDraft, StoryGroup, StoryId, UserId, UserSummary,
};

use crate::api::{CommandError, CommandResult, FriendsApi, MessagingApi, StoriesApi};
use crate::reconcile::notifications::BadgeIndicator;

/// Sender id the mock server stamps on messages it confirms.
pub const MOCK_SELF: UserId = 1;

pub fn user(id: UserId) -> UserSummary {
    UserSummary::new(id, format!("user{id}"))
}

pub fn message(id: MessageId, sender: UserId, content: &str) -> Message {
    Message {
        id,
        sender: user(sender),
        content: content.to_string(),
        created_at: Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
        is_read: false,
    }
}

pub fn story(id: StoryId) -> Story {
    Story {
        id,
        media_url: format!("https://cdn.test/{id}.jpg"),
        media_type: Default::default(),
        caption: None,
        created_at: Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
        user_reaction: None,
        reactions: ReactionCounts::default(),
    }
}

pub fn group(user_id: UserId, ids: &[StoryId]) -> StoryGroup {
    StoryGroup { user_id, user: user(user_id), stories: ids.iter().map(|id| story(*id)).collect() }
}

pub fn request(id: FriendRequestId, from: UserId) -> FriendRequest {
    FriendRequest {
        id,
        from_user: user(from),
        created_at: Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
    }
}

/// Holds a command until the paired sender fires.
#[derive(Default)]
struct Gate(Mutex<Option<oneshot::Receiver<()>>>);

impl Gate {
    fn arm(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *self.0.lock().unwrap() = Some(rx);
        tx
    }

    async fn pass(&self) {
        let rx = self.0.lock().unwrap().take();
        if let Some(rx) = rx {
            let _ = rx.await;
        }
    }
}

// ── Messaging ───────────────────────────────────────────────────────

#[derive(Default)]
pub struct MockMessaging {
    summaries: Mutex<Vec<ConversationSummary>>,
    histories: Mutex<HashMap<UserId, Vec<Message>>>,
    sent: Mutex<Vec<(UserId, String)>>,
    marked_read: Mutex<Vec<UserId>>,
    send_failure: Mutex<Option<CommandError>>,
    summary_fetches: Mutex<usize>,
    summary_gate: Gate,
    history_gate: Gate,
    send_gate: Gate,
}

impl MockMessaging {
    pub fn set_summaries(&self, summaries: Vec<ConversationSummary>) {
        *self.summaries.lock().unwrap() = summaries;
    }

    pub fn set_history(&self, peer: UserId, messages: Vec<Message>) {
        self.histories.lock().unwrap().insert(peer, messages);
    }

    pub fn fail_sends(&self, error: CommandError) {
        *self.send_failure.lock().unwrap() = Some(error);
    }

    /// Hold the next conversation list fetch until the returned sender fires.
    pub fn gate_summaries(&self) -> oneshot::Sender<()> {
        self.summary_gate.arm()
    }

    /// Hold the next history fetch until the returned sender fires.
    pub fn gate_history(&self) -> oneshot::Sender<()> {
        self.history_gate.arm()
    }

    /// Hold the next send until the returned sender fires.
    pub fn gate_send(&self) -> oneshot::Sender<()> {
        self.send_gate.arm()
    }

    pub fn sent(&self) -> Vec<(UserId, String)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn marked_read(&self) -> Vec<UserId> {
        self.marked_read.lock().unwrap().clone()
    }

    pub fn summary_fetches(&self) -> usize {
        *self.summary_fetches.lock().unwrap()
    }
}

#[async_trait]
impl MessagingApi for MockMessaging {
    async fn conversations(&self) -> CommandResult<Vec<ConversationSummary>> {
        *self.summary_fetches.lock().unwrap() += 1;
        self.summary_gate.pass().await;
        Ok(self.summaries.lock().unwrap().clone())
    }

    async fn conversation(&self, peer_id: UserId) -> CommandResult<Vec<Message>> {
        self.history_gate.pass().await;
        Ok(self.histories.lock().unwrap().get(&peer_id).cloned().unwrap_or_default())
    }

    async fn send_message(&self, peer_id: UserId, content: &str) -> CommandResult<Message> {
        self.send_gate.pass().await;
        if let Some(error) = self.send_failure.lock().unwrap().clone() {
            return Err(error);
        }
        let mut sent = self.sent.lock().unwrap();
        sent.push((peer_id, content.to_string()));
        Ok(message(499 + sent.len() as MessageId, MOCK_SELF, content))
    }

    async fn mark_all_read(&self, peer_id: UserId) -> CommandResult<u64> {
        self.marked_read.lock().unwrap().push(peer_id);
        Ok(0)
    }
}

// ── Friends ─────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MockFriends {
    pub friends: Mutex<Vec<UserSummary>>,
    pub requests: Mutex<Vec<FriendRequest>>,
    pub calls: Mutex<Vec<String>>,
    failure: Mutex<Option<CommandError>>,
    gate: Gate,
}

impl MockFriends {
    pub fn fail_commands(&self, error: CommandError) {
        *self.failure.lock().unwrap() = Some(error);
    }

    /// Hold the next mutating command until the returned sender fires.
    pub fn gate_commands(&self) -> oneshot::Sender<()> {
        self.gate.arm()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    async fn command(&self, call: String) -> CommandResult<()> {
        self.gate.pass().await;
        self.calls.lock().unwrap().push(call);
        match self.failure.lock().unwrap().clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl FriendsApi for MockFriends {
    async fn friends(&self) -> CommandResult<Vec<UserSummary>> {
        Ok(self.friends.lock().unwrap().clone())
    }

    async fn pending_requests(&self) -> CommandResult<Vec<FriendRequest>> {
        Ok(self.requests.lock().unwrap().clone())
    }

    async fn send_request(&self, user_id: UserId) -> CommandResult<()> {
        self.command(format!("send:{user_id}")).await
    }

    async fn accept_request(&self, request_id: FriendRequestId) -> CommandResult<UserSummary> {
        self.command(format!("accept:{request_id}")).await?;
        let from = self
            .requests
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.id == request_id)
            .map(|r| r.from_user.clone());
        let mut friend = from.ok_or_else(|| CommandError::rejected(404, "request not found"))?;
        friend.first_name = Some("Confirmed".to_string());
        Ok(friend)
    }

    async fn decline_request(&self, request_id: FriendRequestId) -> CommandResult<()> {
        self.command(format!("decline:{request_id}")).await
    }

    async fn remove_friend(&self, user_id: UserId) -> CommandResult<()> {
        self.command(format!("remove:{user_id}")).await
    }
}

// ── Stories ─────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MockStories {
    pub groups: Mutex<Vec<StoryGroup>>,
    pub calls: Mutex<Vec<String>>,
    failure: Mutex<Option<CommandError>>,
    gate: Gate,
}

impl MockStories {
    pub fn fail_commands(&self, error: CommandError) {
        *self.failure.lock().unwrap() = Some(error);
    }

    pub fn gate_commands(&self) -> oneshot::Sender<()> {
        self.gate.arm()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    async fn command(&self, call: String) -> CommandResult<()> {
        self.gate.pass().await;
        self.calls.lock().unwrap().push(call);
        match self.failure.lock().unwrap().clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl StoriesApi for MockStories {
    async fn stories(&self) -> CommandResult<Vec<StoryGroup>> {
        Ok(self.groups.lock().unwrap().clone())
    }

    async fn create_story(&self, draft: &StoryDraft) -> CommandResult<Story> {
        self.command(format!("create:{}", draft.media_url)).await?;
        let mut created = story(900);
        created.media_url = draft.media_url.clone();
        created.caption = draft.caption.clone();
        Ok(created)
    }

    async fn delete_story(&self, story_id: StoryId) -> CommandResult<()> {
        self.command(format!("delete:{story_id}")).await
    }

    async fn mark_viewed(&self, story_id: StoryId) -> CommandResult<()> {
        self.command(format!("view:{story_id}")).await
    }

    async fn react(&self, story_id: StoryId, reaction: Reaction) -> CommandResult<ReactionCounts> {
        self.command(format!("react:{story_id}:{reaction:?}")).await?;
        Ok(ReactionCounts { heart: 5, thunder: 2 })
    }

    async fn remove_reaction(&self, story_id: StoryId) -> CommandResult<ReactionCounts> {
        self.command(format!("unreact:{story_id}")).await?;
        Ok(ReactionCounts { heart: 4, thunder: 2 })
    }
}

// ── Badge ───────────────────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingBadge {
    counts: Mutex<Vec<usize>>,
    fail: bool,
}

impl RecordingBadge {
    pub fn failing() -> Self {
        Self { counts: Mutex::default(), fail: true }
    }

    pub fn last(&self) -> Option<usize> {
        self.counts.lock().unwrap().last().copied()
    }
}

#[async_trait]
impl BadgeIndicator for RecordingBadge {
    async fn set_count(&self, count: usize) -> Result<()> {
        self.counts.lock().unwrap().push(count);
        if self.fail {
            return Err(anyhow!("badge unavailable"));
        }
        Ok(())
    }
}
