// Command collaborators: the REST calls the reconcilers issue.
//
// The core never talks HTTP itself. Each trait is implemented by the
// embedding application; tests use in-memory mocks.

use async_trait::async_trait;
use thiserror::Error;

use feedsync_common::types::{
    ConversationSummary, FriendRequest, FriendRequestId, Message, Reaction, ReactionCounts,
    Story, StoryDraft, StoryGroup, StoryId, UserId, UserSummary,
};

/// Structured failure of a command. `Ok` is the success flag; the
/// `Display` output is the user-facing message.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("network error: {0}")]
    Network(String),
    #[error("{detail}")]
    Rejected { status: u16, detail: String },
    #[error("{0}")]
    Invalid(String),
}

impl CommandError {
    pub fn rejected(status: u16, detail: impl Into<String>) -> Self {
        Self::Rejected { status, detail: detail.into() }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Rejected { status, .. } => Some(*status),
            _ => None,
        }
    }
}

pub type CommandResult<T> = Result<T, CommandError>;

#[async_trait]
pub trait MessagingApi: Send + Sync {
    async fn conversations(&self) -> CommandResult<Vec<ConversationSummary>>;
    async fn conversation(&self, peer_id: UserId) -> CommandResult<Vec<Message>>;
    async fn send_message(&self, peer_id: UserId, content: &str) -> CommandResult<Message>;
    /// Marks every message from `peer_id` as read; returns how many changed.
    async fn mark_all_read(&self, peer_id: UserId) -> CommandResult<u64>;
}

#[async_trait]
pub trait FriendsApi: Send + Sync {
    async fn friends(&self) -> CommandResult<Vec<UserSummary>>;
    async fn pending_requests(&self) -> CommandResult<Vec<FriendRequest>>;
    async fn send_request(&self, user_id: UserId) -> CommandResult<()>;
    /// Returns the new friend.
    async fn accept_request(&self, request_id: FriendRequestId) -> CommandResult<UserSummary>;
    async fn decline_request(&self, request_id: FriendRequestId) -> CommandResult<()>;
    async fn remove_friend(&self, user_id: UserId) -> CommandResult<()>;
}

#[async_trait]
pub trait StoriesApi: Send + Sync {
    async fn stories(&self) -> CommandResult<Vec<StoryGroup>>;
    async fn create_story(&self, draft: &StoryDraft) -> CommandResult<Story>;
    async fn delete_story(&self, story_id: StoryId) -> CommandResult<()>;
    async fn mark_viewed(&self, story_id: StoryId) -> CommandResult<()>;
    async fn react(&self, story_id: StoryId, reaction: Reaction) -> CommandResult<ReactionCounts>;
    async fn remove_reaction(&self, story_id: StoryId) -> CommandResult<ReactionCounts>;
}
