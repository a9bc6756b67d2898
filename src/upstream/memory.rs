//! In-memory reference collaborators.
//!
//! One backend implements all three boundary traits: a conversation
//! directory with participant sets, a block list, an auto-incrementing
//! message log, and a single-use expiring ticket store.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{TicketError, UpstreamError};
use crate::protocol::{ConversationId, UserId};
use crate::upstream::{Authorizer, MessageStore, StoredMessage, TicketClaims, TicketValidator};

#[derive(Debug)]
struct TicketEntry {
    user_id: UserId,
    expires_at: Instant,
}

pub struct MemoryBackend {
    participants: DashMap<ConversationId, HashSet<UserId>>,
    /// (blocker, blocked) pairs.
    blocks: DashMap<(UserId, UserId), ()>,
    tickets: DashMap<String, TicketEntry>,
    next_message_id: AtomicU64,
    ticket_ttl: Duration,
}

impl MemoryBackend {
    pub fn new(ticket_ttl: Duration) -> Self {
        Self {
            participants: DashMap::new(),
            blocks: DashMap::new(),
            tickets: DashMap::new(),
            next_message_id: AtomicU64::new(1),
            ticket_ttl,
        }
    }

    /// Seed a conversation with its durable participant list.
    pub fn create_conversation(&self, conversation: ConversationId, users: &[UserId]) {
        self.participants
            .insert(conversation, users.iter().copied().collect());
    }

    pub fn add_participant(&self, conversation: ConversationId, user: UserId) {
        self.participants
            .entry(conversation)
            .or_default()
            .insert(user);
    }

    pub fn block(&self, blocker: UserId, blocked: UserId) {
        self.blocks.insert((blocker, blocked), ());
    }

    /// Issue a single-use ticket for the user. The opaque token is the
    /// only thing the client ever sees.
    pub fn issue_ticket(&self, user_id: UserId) -> String {
        let token = Uuid::new_v4().to_string();
        self.tickets.insert(
            token.clone(),
            TicketEntry {
                user_id,
                expires_at: Instant::now() + self.ticket_ttl,
            },
        );
        token
    }
}

#[async_trait]
impl MessageStore for MemoryBackend {
    async fn persist_message(
        &self,
        conversation: ConversationId,
        sender: UserId,
        content: &str,
    ) -> Result<StoredMessage, UpstreamError> {
        let id = self.next_message_id.fetch_add(1, Ordering::Relaxed);
        Ok(StoredMessage {
            id,
            conversation_id: conversation,
            sender_id: sender,
            content: content.to_string(),
            sent_at: Utc::now(),
        })
    }

    async fn mark_read(
        &self,
        _conversation: ConversationId,
        _user: UserId,
    ) -> Result<(), UpstreamError> {
        // The reference backend keeps no per-user read cursor; a real
        // persistence collaborator records it durably.
        Ok(())
    }

    async fn fetch_participants(
        &self,
        conversation: ConversationId,
    ) -> Result<HashSet<UserId>, UpstreamError> {
        Ok(self
            .participants
            .get(&conversation)
            .map(|set| set.clone())
            .unwrap_or_default())
    }
}

#[async_trait]
impl Authorizer for MemoryBackend {
    async fn is_participant(
        &self,
        user: UserId,
        conversation: ConversationId,
    ) -> Result<bool, UpstreamError> {
        Ok(self
            .participants
            .get(&conversation)
            .map(|set| set.contains(&user))
            .unwrap_or(false))
    }

    async fn is_blocked(&self, user: UserId, other: UserId) -> Result<bool, UpstreamError> {
        Ok(self.blocks.contains_key(&(user, other)))
    }
}

#[async_trait]
impl TicketValidator for MemoryBackend {
    async fn validate(&self, ticket: &str) -> Result<TicketClaims, TicketError> {
        // Single-use: the entry is consumed on first validation attempt,
        // expired or not.
        let (_, entry) = self
            .tickets
            .remove(ticket)
            .ok_or(TicketError::Invalid)?;

        if Instant::now() >= entry.expires_at {
            return Err(TicketError::Expired);
        }

        Ok(TicketClaims {
            user_id: entry.user_id,
        })
    }
}
