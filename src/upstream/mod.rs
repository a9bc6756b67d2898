//! Boundary traits for the hub's external collaborators.
//!
//! The hub never owns durable state or identity: message persistence,
//! participant/blocking checks, and handshake tickets all live behind
//! these traits. `memory` provides the reference implementations used by
//! the binary and the test suite.

pub mod memory;

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{TicketError, UpstreamError};
use crate::protocol::{ConversationId, MessageId, UserId};

pub use memory::MemoryBackend;

/// A message the persistence collaborator has durably recorded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: String,
    pub sent_at: DateTime<Utc>,
}

/// Persistence collaborator. The hub calls into it for writes triggered by
/// client actions and for the durable participant list (cold fan-out
/// fallback); the persistence side pushes domain events back into the
/// router after each durable change.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn persist_message(
        &self,
        conversation: ConversationId,
        sender: UserId,
        content: &str,
    ) -> Result<StoredMessage, UpstreamError>;

    async fn mark_read(
        &self,
        conversation: ConversationId,
        user: UserId,
    ) -> Result<(), UpstreamError>;

    async fn fetch_participants(
        &self,
        conversation: ConversationId,
    ) -> Result<HashSet<UserId>, UpstreamError>;
}

/// Authorization collaborator, consulted before accepting inbound actions
/// and before including a user in fan-out.
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn is_participant(
        &self,
        user: UserId,
        conversation: ConversationId,
    ) -> Result<bool, UpstreamError>;

    /// Whether `user` has blocked `other`. A blocked user must never
    /// receive the blocking party's events.
    async fn is_blocked(&self, user: UserId, other: UserId) -> Result<bool, UpstreamError>;
}

/// Claims carried by a validated handshake ticket.
#[derive(Debug, Clone)]
pub struct TicketClaims {
    pub user_id: UserId,
}

/// Transport handshake collaborator: single-use, time-limited connection
/// tickets. Validation is a precondition to registering a connection.
#[async_trait]
pub trait TicketValidator: Send + Sync {
    async fn validate(&self, ticket: &str) -> Result<TicketClaims, TicketError>;
}
