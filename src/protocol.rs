//! Wire protocol: JSON envelopes with a `type` discriminator.
//!
//! Inbound and outbound events are closed sets of tagged variants so that
//! adding an event type is a compile-time-checked change at every dispatch
//! site. The envelope shape matches what clients already speak:
//! `{"type": "...", ...fields}`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::upstream::StoredMessage;

pub type UserId = u64;
pub type ConversationId = u64;
pub type MessageId = u64;

/// Inbound client actions. Anything that fails to decode into one of these
/// is logged and dropped without terminating the connection.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientAction {
    Join {
        conversation_id: ConversationId,
    },
    Leave {
        conversation_id: ConversationId,
    },
    Typing {
        conversation_id: ConversationId,
        is_typing: bool,
    },
    Message {
        conversation_id: ConversationId,
        content: String,
    },
    Read {
        conversation_id: ConversationId,
    },
}

/// Outbound events pushed to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Message {
        conversation_id: ConversationId,
        message: StoredMessage,
    },
    Typing {
        conversation_id: ConversationId,
        user_id: UserId,
        is_typing: bool,
    },
    Presence {
        user_id: UserId,
        status: PresenceStatus,
    },
    Joined {
        conversation_id: ConversationId,
    },
    ParticipantJoined {
        conversation_id: ConversationId,
        user_id: UserId,
    },
    ParticipantLeft {
        conversation_id: ConversationId,
        user_id: UserId,
    },
    Read {
        conversation_id: ConversationId,
        user_id: UserId,
    },
    ReactionUpdated {
        conversation_id: ConversationId,
        message_id: MessageId,
        user_id: UserId,
        emoji: String,
        added: bool,
    },
    /// Snapshot of currently-online users, sent once on connect.
    ConnectedUsers {
        user_ids: Vec<UserId>,
    },
    Error {
        code: u16,
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Offline,
}

/// Backpressure handling per event kind. Ephemeral events may be dropped
/// when a client's outbound queue is full; guaranteed events close the
/// connection instead, deferring to persistence-layer replay on reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryClass {
    Ephemeral,
    Guaranteed,
}

impl ServerEvent {
    pub fn delivery_class(&self) -> DeliveryClass {
        match self {
            ServerEvent::Typing { .. }
            | ServerEvent::Presence { .. }
            | ServerEvent::ConnectedUsers { .. }
            | ServerEvent::Error { .. } => DeliveryClass::Ephemeral,
            ServerEvent::Message { .. }
            | ServerEvent::Joined { .. }
            | ServerEvent::ParticipantJoined { .. }
            | ServerEvent::ParticipantLeft { .. }
            | ServerEvent::Read { .. }
            | ServerEvent::ReactionUpdated { .. } => DeliveryClass::Guaranteed,
        }
    }

    /// Metric label for dispatch counters.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerEvent::Message { .. } => "message",
            ServerEvent::Typing { .. } => "typing",
            ServerEvent::Presence { .. } => "presence",
            ServerEvent::Joined { .. } => "joined",
            ServerEvent::ParticipantJoined { .. } => "participant_joined",
            ServerEvent::ParticipantLeft { .. } => "participant_left",
            ServerEvent::Read { .. } => "read",
            ServerEvent::ReactionUpdated { .. } => "reaction_updated",
            ServerEvent::ConnectedUsers { .. } => "connected_users",
            ServerEvent::Error { .. } => "error",
        }
    }

    /// Encode to the canonical wire form exactly once per fan-out. Each
    /// target connection gets a cheap clone of the same `Arc<str>`.
    pub fn encode(&self) -> Option<Arc<str>> {
        match serde_json::to_string(self) {
            Ok(json) => Some(Arc::from(json)),
            Err(e) => {
                tracing::error!(error = %e, kind = self.kind(), "Failed to encode server event");
                None
            }
        }
    }

    pub fn error(code: u16, message: impl Into<String>) -> Self {
        ServerEvent::Error {
            code,
            message: message.into(),
        }
    }
}
