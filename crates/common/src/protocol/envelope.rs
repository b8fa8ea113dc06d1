// Event envelope for inbound push frames: `{ "type": <string>, "data": <object> }`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// One decoded inbound frame. The payload stays opaque at this layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventEnvelope {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("frame has an empty `type` tag")]
    EmptyType,
}

impl EventEnvelope {
    pub fn new(event_type: impl Into<String>, data: Value) -> Self {
        Self { event_type: event_type.into(), data }
    }

    /// Decode a UTF-8 JSON text frame.
    pub fn decode(frame: &str) -> Result<Self, CodecError> {
        let envelope: Self = serde_json::from_str(frame)?;
        if envelope.event_type.is_empty() {
            return Err(CodecError::EmptyType);
        }
        Ok(envelope)
    }

    pub fn encode(&self) -> Result<String, CodecError> {
        Ok(serde_json::to_string(self)?)
    }

    /// The typed tag, or `None` for types this client does not know about.
    pub fn known_type(&self) -> Option<EventType> {
        EventType::parse(&self.event_type)
    }
}

/// Inbound event tags understood by this client. Unknown tags are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    NewMessage,
    NewPostNotification,
    NewPost,
    WallPost,
    PostComment,
    CommentReply,
    FriendAccepted,
}

impl EventType {
    pub const ALL: [EventType; 7] = [
        Self::NewMessage,
        Self::NewPostNotification,
        Self::NewPost,
        Self::WallPost,
        Self::PostComment,
        Self::CommentReply,
        Self::FriendAccepted,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NewMessage => "new_message",
            Self::NewPostNotification => "new_post_notification",
            Self::NewPost => "new_post",
            Self::WallPost => "wall_post",
            Self::PostComment => "post_comment",
            Self::CommentReply => "comment_reply",
            Self::FriendAccepted => "friend_accepted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|event_type| event_type.as_str() == s)
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
