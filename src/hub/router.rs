//! Event router: turns inbound client actions and persistence-layer
//! domain events into per-connection deliveries.
//!
//! Fan-out reads a snapshot of targets, then dispatches; a concurrent
//! join/leave during fan-out is resolved by "next event sees updated
//! membership", never by blocking the in-flight dispatch. Each event is
//! encoded exactly once per fan-out and every target connection gets its
//! own clone of that canonical encoding.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::error::UpstreamError;
use crate::hub::dedup::DedupCache;
use crate::hub::membership::MembershipIndex;
use crate::hub::registry::ConnectionRegistry;
use crate::metrics;
use crate::protocol::{
    ClientAction, ConversationId, DeliveryClass, MessageId, PresenceStatus, ServerEvent, UserId,
};
use crate::upstream::{Authorizer, MessageStore, StoredMessage};
use crate::ws::{ConnectionHandle, PushOutcome};

/// Pushed in by the persistence collaborator when a reaction changes.
#[derive(Debug, Clone, Deserialize)]
pub struct ReactionEvent {
    pub conversation_id: ConversationId,
    pub message_id: MessageId,
    pub user_id: UserId,
    pub emoji: String,
    pub added: bool,
}

/// Pushed in by the persistence collaborator when a read cursor moves.
#[derive(Debug, Clone, Deserialize)]
pub struct ReadReceiptEvent {
    pub conversation_id: ConversationId,
    pub user_id: UserId,
}

pub struct EventRouter {
    registry: Arc<ConnectionRegistry>,
    membership: Arc<MembershipIndex>,
    store: Arc<dyn MessageStore>,
    authorizer: Arc<dyn Authorizer>,
    dedup: DedupCache,
    upstream_timeout: Duration,
}

impl EventRouter {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        membership: Arc<MembershipIndex>,
        store: Arc<dyn MessageStore>,
        authorizer: Arc<dyn Authorizer>,
        dedup: DedupCache,
        upstream_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            membership,
            store,
            authorizer,
            dedup,
            upstream_timeout,
        })
    }

    /// Dispatch one inbound client action. A bad action never terminates
    /// the session: authorization failures are dropped with a warning,
    /// upstream failures come back as an explicit `error` envelope.
    pub async fn handle_action(&self, user_id: UserId, action: ClientAction, conn: &ConnectionHandle) {
        match action {
            ClientAction::Join { conversation_id } => {
                if !self.authorize(user_id, conversation_id, "join", conn).await {
                    return;
                }
                self.membership.join(user_id, conversation_id);

                if let Some(text) = (ServerEvent::Joined { conversation_id }).encode() {
                    conn.push_event(text, DeliveryClass::Guaranteed);
                }
                self.dispatch_to_conversation(
                    conversation_id,
                    Some(user_id),
                    &ServerEvent::ParticipantJoined {
                        conversation_id,
                        user_id,
                    },
                )
                .await;
            }

            ClientAction::Leave { conversation_id } => {
                // Leaving needs no authorization, but only an actual
                // member's departure is announced; otherwise anyone could
                // inject participant_left envelopes into any conversation.
                if !self.membership.leave(user_id, conversation_id) {
                    return;
                }
                self.dispatch_to_conversation(
                    conversation_id,
                    Some(user_id),
                    &ServerEvent::ParticipantLeft {
                        conversation_id,
                        user_id,
                    },
                )
                .await;
            }

            ClientAction::Typing {
                conversation_id,
                is_typing,
            } => {
                if !self.authorize(user_id, conversation_id, "typing", conn).await {
                    return;
                }
                let mut targets = self.membership.members_of(conversation_id);
                if targets.is_empty() {
                    // Cold fallback: typing should reach durable
                    // participants even before anyone explicitly joined.
                    match self
                        .with_timeout(self.store.fetch_participants(conversation_id))
                        .await
                    {
                        Ok(participants) => targets = participants.into_iter().collect(),
                        Err(e) => {
                            // Typing is best-effort; no error envelope.
                            metrics::upstream_failure("fetch_participants");
                            tracing::warn!(error = %e, conversation_id, "Participant fetch failed, typing dropped");
                            return;
                        }
                    }
                }
                // The typist already knows they are typing.
                targets.retain(|&target| target != user_id);
                self.dispatch_to_users(
                    &targets,
                    Some(user_id),
                    &ServerEvent::Typing {
                        conversation_id,
                        user_id,
                        is_typing,
                    },
                )
                .await;
            }

            ClientAction::Message {
                conversation_id,
                content,
            } => {
                if content.is_empty() {
                    return;
                }
                if !self.authorize(user_id, conversation_id, "message", conn).await {
                    return;
                }
                match self
                    .with_timeout(self.store.persist_message(conversation_id, user_id, &content))
                    .await
                {
                    Ok(stored) => self.on_message_persisted(stored).await,
                    Err(e) => {
                        metrics::upstream_failure("persist_message");
                        tracing::warn!(error = %e, user_id, conversation_id, "Message persist failed");
                        Self::send_error(conn, 504, "message not persisted, retry");
                    }
                }
            }

            ClientAction::Read { conversation_id } => {
                if !self.authorize(user_id, conversation_id, "read", conn).await {
                    return;
                }
                match self
                    .with_timeout(self.store.mark_read(conversation_id, user_id))
                    .await
                {
                    Ok(()) => {
                        self.on_read_receipt(ReadReceiptEvent {
                            conversation_id,
                            user_id,
                        })
                        .await;
                    }
                    Err(e) => {
                        metrics::upstream_failure("mark_read");
                        tracing::warn!(error = %e, user_id, conversation_id, "Mark read failed");
                        Self::send_error(conn, 504, "read receipt not recorded, retry");
                    }
                }
            }
        }
    }

    /// A message was durably persisted; broadcast it to the conversation's
    /// runtime members. The dedup cache suppresses the race between a
    /// direct push and a reconnect-triggered resync.
    pub async fn on_message_persisted(&self, message: StoredMessage) {
        let conversation_id = message.conversation_id;
        if !self.dedup.first_delivery(conversation_id, message.id) {
            metrics::duplicate_suppressed();
            tracing::debug!(
                conversation_id,
                message_id = message.id,
                "Duplicate message delivery suppressed"
            );
            return;
        }

        let sender = message.sender_id;
        self.dispatch_to_conversation(
            conversation_id,
            Some(sender),
            &ServerEvent::Message {
                conversation_id,
                message,
            },
        )
        .await;
    }

    pub async fn on_reaction_changed(&self, event: ReactionEvent) {
        self.dispatch_to_conversation(
            event.conversation_id,
            Some(event.user_id),
            &ServerEvent::ReactionUpdated {
                conversation_id: event.conversation_id,
                message_id: event.message_id,
                user_id: event.user_id,
                emoji: event.emoji,
                added: event.added,
            },
        )
        .await;
    }

    pub async fn on_read_receipt(&self, event: ReadReceiptEvent) {
        self.dispatch_to_conversation(
            event.conversation_id,
            Some(event.user_id),
            &ServerEvent::Read {
                conversation_id: event.conversation_id,
                user_id: event.user_id,
            },
        )
        .await;
    }

    /// Presence transition hook, wired as the shared tracker's subscriber.
    /// On offline: clear the user's runtime memberships and announce their
    /// departure; either way, broadcast the status change to everyone else.
    pub fn on_presence_change(self: &Arc<Self>, user_id: UserId, online: bool) {
        if !online {
            let conversations = self.membership.remove_user(user_id);
            for conversation_id in conversations {
                let router = Arc::clone(self);
                tokio::spawn(async move {
                    router
                        .dispatch_to_conversation(
                            conversation_id,
                            Some(user_id),
                            &ServerEvent::ParticipantLeft {
                                conversation_id,
                                user_id,
                            },
                        )
                        .await;
                });
            }
        }

        let status = if online {
            PresenceStatus::Online
        } else {
            PresenceStatus::Offline
        };
        let event = ServerEvent::Presence { user_id, status };
        let Some(text) = event.encode() else { return };
        for handle in self.registry.all_connections() {
            // No echo back to the user who transitioned.
            if handle.user_id() == user_id {
                continue;
            }
            if handle.push_event(text.clone(), DeliveryClass::Ephemeral) == PushOutcome::Queued {
                metrics::event_dispatched(event.kind());
            }
        }
    }

    async fn dispatch_to_conversation(
        &self,
        conversation: ConversationId,
        sender: Option<UserId>,
        event: &ServerEvent,
    ) {
        let members = self.membership.members_of(conversation);
        if members.is_empty() {
            // Expected when nobody is actively viewing the conversation;
            // durable participants catch up on their next fetch.
            tracing::trace!(conversation_id = conversation, "No runtime members, event skipped");
            return;
        }
        self.dispatch_to_users(&members, sender, event).await;
    }

    async fn dispatch_to_users(&self, targets: &[UserId], sender: Option<UserId>, event: &ServerEvent) {
        let Some(text) = event.encode() else { return };
        let class = event.delivery_class();

        for &target in targets {
            if let Some(sender) = sender {
                if target != sender && self.blocked_between(target, sender).await {
                    continue;
                }
            }
            // Snapshot of live connections; every one of the user's tabs
            // gets its own copy of the canonical encoding.
            for handle in self.registry.connections_for(target) {
                if handle.push_event(text.clone(), class) == PushOutcome::Queued {
                    metrics::event_dispatched(event.kind());
                }
            }
        }
    }

    /// A blocked pair never exchanges live events, in either direction.
    /// Upstream failure excludes the target (fail closed).
    async fn blocked_between(&self, a: UserId, b: UserId) -> bool {
        match self.with_timeout(self.authorizer.is_blocked(a, b)).await {
            Ok(true) => return true,
            Ok(false) => {}
            Err(_) => {
                metrics::upstream_failure("is_blocked");
                return true;
            }
        }
        match self.with_timeout(self.authorizer.is_blocked(b, a)).await {
            Ok(blocked) => blocked,
            Err(_) => {
                metrics::upstream_failure("is_blocked");
                true
            }
        }
    }

    /// Check the actor may touch the conversation. Returns false (and
    /// handles client signalling) when the action must not proceed.
    async fn authorize(
        &self,
        user_id: UserId,
        conversation: ConversationId,
        action: &'static str,
        conn: &ConnectionHandle,
    ) -> bool {
        match self
            .with_timeout(self.authorizer.is_participant(user_id, conversation))
            .await
        {
            Ok(true) => true,
            Ok(false) => {
                metrics::unauthorized_action(action);
                tracing::warn!(
                    user_id,
                    conversation_id = conversation,
                    action,
                    "Unauthorized action dropped"
                );
                false
            }
            Err(e) => {
                metrics::upstream_failure("is_participant");
                tracing::warn!(error = %e, user_id, conversation_id = conversation, "Authorization check failed");
                Self::send_error(conn, 504, "authorization unavailable, retry");
                false
            }
        }
    }

    fn send_error(conn: &ConnectionHandle, code: u16, message: &str) {
        if let Some(text) = ServerEvent::error(code, message).encode() {
            conn.push_event(text, DeliveryClass::Ephemeral);
        }
    }

    async fn with_timeout<T>(
        &self,
        fut: impl Future<Output = Result<T, UpstreamError>>,
    ) -> Result<T, UpstreamError> {
        match tokio::time::timeout(self.upstream_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(UpstreamError::Timeout),
        }
    }
}
