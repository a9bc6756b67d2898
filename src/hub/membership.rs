//! Volatile conversation membership: which users are currently interested
//! in a conversation's live events.
//!
//! This is a runtime fan-out index only, never the source of truth for
//! who belongs to a conversation — that is the durable participant list
//! owned by the persistence collaborator. A durable participant who has
//! not joined at runtime simply gets no live pushes and catches up on the
//! next fetch.

use std::collections::HashSet;

use dashmap::DashMap;

use crate::protocol::{ConversationId, UserId};

#[derive(Default)]
pub struct MembershipIndex {
    /// conversation -> users currently joined.
    conversations: DashMap<ConversationId, HashSet<UserId>>,
    /// user -> conversations they have joined.
    user_conversations: DashMap<UserId, HashSet<ConversationId>>,
}

impl MembershipIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent.
    pub fn join(&self, user: UserId, conversation: ConversationId) {
        self.conversations
            .entry(conversation)
            .or_default()
            .insert(user);
        self.user_conversations
            .entry(user)
            .or_default()
            .insert(conversation);
        tracing::debug!(user_id = user, conversation_id = conversation, "Joined conversation");
    }

    /// Idempotent. Returns whether the user actually was a member, so
    /// callers only announce real departures.
    pub fn leave(&self, user: UserId, conversation: ConversationId) -> bool {
        let removed = self
            .conversations
            .get_mut(&conversation)
            .map(|mut users| users.remove(&user))
            .unwrap_or(false);
        self.conversations
            .remove_if(&conversation, |_, users| users.is_empty());

        if let Some(mut convs) = self.user_conversations.get_mut(&user) {
            convs.remove(&conversation);
        }
        self.user_conversations
            .remove_if(&user, |_, convs| convs.is_empty());

        if removed {
            tracing::debug!(user_id = user, conversation_id = conversation, "Left conversation");
        }
        removed
    }

    /// Snapshot of the fan-out targets for a conversation.
    pub fn members_of(&self, conversation: ConversationId) -> Vec<UserId> {
        self.conversations
            .get(&conversation)
            .map(|users| users.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn is_member(&self, user: UserId, conversation: ConversationId) -> bool {
        self.user_conversations
            .get(&user)
            .map(|convs| convs.contains(&conversation))
            .unwrap_or(false)
    }

    /// Drop all of a user's memberships. Called when the presence tracker
    /// finalizes the user's offline transition; returns the conversations
    /// they were removed from so the caller can broadcast departures.
    pub fn remove_user(&self, user: UserId) -> Vec<ConversationId> {
        let Some((_, convs)) = self.user_conversations.remove(&user) else {
            return Vec::new();
        };

        for &conversation in &convs {
            if let Some(mut users) = self.conversations.get_mut(&conversation) {
                users.remove(&user);
            }
            self.conversations
                .remove_if(&conversation, |_, users| users.is_empty());
        }

        convs.into_iter().collect()
    }
}
