// Domain types exchanged with the REST collaborator and carried in push payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type UserId = i64;
pub type MessageId = i64;
pub type StoryId = i64;
pub type FriendRequestId = i64;

/// Public profile fields embedded in messages, requests and stories.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserSummary {
    pub id: UserId,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_picture: Option<String>,
}

impl UserSummary {
    pub fn new(id: UserId, username: impl Into<String>) -> Self {
        Self {
            id,
            username: username.into(),
            first_name: None,
            last_name: None,
            profile_picture: None,
        }
    }

    /// "First Last" when both names are present, otherwise the username.
    pub fn display_name(&self) -> String {
        match (non_empty(&self.first_name), non_empty(&self.last_name)) {
            (Some(first), Some(last)) => format!("{first} {last}"),
            _ => self.username.clone(),
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|s| !s.is_empty())
}

/// A direct message as returned by the server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub sender: UserSummary,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub is_read: bool,
}

/// One row of the conversation list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConversationSummary {
    pub user: UserSummary,
    #[serde(default)]
    pub last_message: Option<Message>,
    #[serde(default)]
    pub unread_count: u32,
}

/// An incoming friend request awaiting a response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FriendRequest {
    pub id: FriendRequestId,
    pub from_user: UserSummary,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Reaction {
    Heart,
    Thunder,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MediaType {
    #[default]
    Image,
    Video,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct ReactionCounts {
    pub heart: u32,
    pub thunder: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Story {
    pub id: StoryId,
    pub media_url: String,
    #[serde(default)]
    pub media_type: MediaType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub user_reaction: Option<Reaction>,
    #[serde(default)]
    pub reactions: ReactionCounts,
}

/// All active stories of one author, newest first.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoryGroup {
    pub user_id: UserId,
    pub user: UserSummary,
    pub stories: Vec<Story>,
}

/// Input for creating a story.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoryDraft {
    pub media_url: String,
    #[serde(default)]
    pub media_type: MediaType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn display_name_prefers_full_name() {
        let mut user = UserSummary::new(1, "ada");
        assert_eq!(user.display_name(), "ada");

        user.first_name = Some("Ada".into());
        assert_eq!(user.display_name(), "ada");

        user.last_name = Some("Lovelace".into());
        assert_eq!(user.display_name(), "Ada Lovelace");

        user.last_name = Some(String::new());
        assert_eq!(user.display_name(), "ada");
    }

    #[test]
    fn message_parses_push_payload_without_read_flag() {
        let message: Message = serde_json::from_value(json!({
            "id": 77,
            "sender": {"id": 42, "username": "grace"},
            "content": "hi",
            "created_at": "2026-01-01T00:00:00Z"
        }))
        .unwrap();
        assert_eq!(message.sender.id, 42);
        assert!(!message.is_read);
    }

    #[test]
    fn story_defaults_optional_fields() {
        let story: Story = serde_json::from_value(json!({
            "id": 5,
            "media_url": "https://cdn.test/5.jpg",
            "created_at": "2026-01-01T00:00:00Z"
        }))
        .unwrap();
        assert_eq!(story.media_type, MediaType::Image);
        assert_eq!(story.user_reaction, None);
        assert_eq!(story.reactions, ReactionCounts::default());
    }

    #[test]
    fn reaction_serializes_snake_case() {
        assert_eq!(serde_json::to_string(&Reaction::Thunder).unwrap(), "\"thunder\"");
    }
}
