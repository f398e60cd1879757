//! Message model for the conversational log.

use std::fmt;
use std::str::FromStr;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::errors::SyncResult;
use crate::core::ids::MessageId;

/// Author of a message.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Text typed or dictated by the user.
    User,
    /// Reply streamed from the backend.
    Assistant,
}

impl Role {
    /// Stable string form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            _ => Err(value.to_string()),
        }
    }
}

/// Whether a message still accepts chunks.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageState {
    /// A stream is appending to this message.
    Open,
    /// No further content will be appended.
    Closed,
}

/// Synthesized audio attached to a finished reply.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct AudioAttachment {
    /// Base64-encoded audio bytes, as returned by the speech endpoint.
    #[serde(rename = "audio_content")]
    pub payload_base64: String,
    /// MIME type of the audio, e.g. `audio/mpeg`.
    #[serde(rename = "content_type")]
    pub content_type: String,
}

impl AudioAttachment {
    /// Decode the audio payload.
    ///
    /// # Errors
    /// Returns an error if the payload is not valid base64.
    pub fn decode(&self) -> SyncResult<Vec<u8>> {
        Ok(STANDARD.decode(self.payload_base64.as_bytes())?)
    }
}

/// One entry of the message log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Stable identifier.
    pub id: MessageId,
    /// Author.
    pub role: Role,
    /// Accumulated text.
    pub content: String,
    /// Optional synthesized audio.
    pub attachment: Option<AudioAttachment>,
    /// Creation time, used only for display.
    pub created_at: DateTime<Utc>,
    /// Open while a stream is appending to it.
    pub state: MessageState,
    #[serde(skip)]
    pub(crate) side_effect_claimed: bool,
    #[serde(skip)]
    pub(crate) cancelled: bool,
}

impl Message {
    /// Build a closed user message.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            id: MessageId::new(),
            role: Role::User,
            content: content.into(),
            attachment: None,
            created_at: Utc::now(),
            state: MessageState::Closed,
            side_effect_claimed: false,
            cancelled: false,
        }
    }

    /// Build an empty message that is open for streaming.
    #[must_use]
    pub fn open(role: Role) -> Self {
        Self {
            id: MessageId::new(),
            role,
            content: String::new(),
            attachment: None,
            created_at: Utc::now(),
            state: MessageState::Open,
            side_effect_claimed: false,
            cancelled: false,
        }
    }

    /// Whether a stream is still appending to this message.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state == MessageState::Open
    }

    /// Whether the stream feeding this message was cancelled.
    #[must_use]
    pub const fn was_cancelled(&self) -> bool {
        self.cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_round_trip() {
        assert_eq!("assistant".parse::<Role>(), Ok(Role::Assistant));
        assert_eq!(Role::User.to_string(), "user");
        assert!("system".parse::<Role>().is_err());
    }

    #[test]
    fn test_user_message_is_closed() {
        let message = Message::user("hello");
        assert_eq!(message.role, Role::User);
        assert!(!message.is_open());
    }

    #[test]
    fn test_attachment_wire_names_and_decode() {
        let attachment: AudioAttachment = serde_json::from_str(
            r#"{"audio_content": "SUQz", "content_type": "audio/mpeg"}"#,
        )
        .unwrap();
        assert_eq!(attachment.content_type, "audio/mpeg");
        assert_eq!(attachment.decode().unwrap(), b"ID3".to_vec());

        let broken = AudioAttachment {
            payload_base64: "***".to_string(),
            content_type: "audio/mpeg".to_string(),
        };
        assert!(broken.decode().is_err());
    }
}
