//! Connection handle types shared between the registry and the pumps.

pub mod actor;
pub mod handler;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::metrics;
use crate::protocol::{DeliveryClass, UserId};

/// Process-unique identifier for one live transport session.
pub type ConnectionId = u64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// A frame queued for the write loop.
#[derive(Debug, Clone)]
pub enum OutboundFrame {
    /// Pre-encoded JSON envelope. One canonical encoding per fan-out; each
    /// connection holds a cheap clone of the same `Arc<str>`.
    Event {
        text: Arc<str>,
        class: DeliveryClass,
    },
    /// Echo of a client ping.
    Pong(Vec<u8>),
}

/// What happened to a frame offered to a connection's outbound queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queue full, ephemeral frame dropped (counted).
    DroppedEphemeral,
    /// Queue full on a guaranteed frame; the connection was cancelled so
    /// the client can reconnect and replay from persistence.
    ClosedBackpressure,
    /// The write loop is already gone.
    Gone,
}

/// Handle to one live connection. Cloneable; the registry owns the
/// authoritative set, fan-out works on snapshots of these handles.
#[derive(Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    user_id: UserId,
    sender: mpsc::Sender<OutboundFrame>,
    cancel: CancellationToken,
}

impl ConnectionHandle {
    pub fn new(
        user_id: UserId,
        sender: mpsc::Sender<OutboundFrame>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            user_id,
            sender,
            cancel,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// True once the write loop has dropped its receiver.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Force-close: trips both pump loops, which funnel into the single
    /// unregister path.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Offer a pre-encoded event to the outbound queue, applying the
    /// backpressure policy for its delivery class.
    pub fn push_event(&self, text: Arc<str>, class: DeliveryClass) -> PushOutcome {
        match self.sender.try_send(OutboundFrame::Event { text, class }) {
            Ok(()) => PushOutcome::Queued,
            Err(mpsc::error::TrySendError::Full(_)) => match class {
                DeliveryClass::Ephemeral => {
                    metrics::backpressure_drop(metrics::REASON_EPHEMERAL_FULL);
                    tracing::debug!(
                        user_id = self.user_id,
                        connection_id = self.id,
                        "Outbound queue full, ephemeral frame dropped"
                    );
                    self.offer_drop_notice();
                    PushOutcome::DroppedEphemeral
                }
                DeliveryClass::Guaranteed => {
                    metrics::backpressure_drop(metrics::REASON_GUARANTEED_FULL);
                    tracing::warn!(
                        user_id = self.user_id,
                        connection_id = self.id,
                        "Outbound queue full on guaranteed frame, closing connection"
                    );
                    self.cancel.cancel();
                    PushOutcome::ClosedBackpressure
                }
            },
            Err(mpsc::error::TrySendError::Closed(_)) => {
                metrics::backpressure_drop(metrics::REASON_RECEIVER_GONE);
                PushOutcome::Gone
            }
        }
    }

    /// Echo a client ping. Best-effort; a full queue just drops it.
    pub fn push_pong(&self, payload: Vec<u8>) {
        let _ = self.sender.try_send(OutboundFrame::Pong(payload));
    }

    /// Best-effort notice that an ephemeral frame was lost, so the client
    /// can detect the gap and re-fetch. If even this does not fit, the
    /// client is truly overwhelmed and the absence speaks for itself.
    fn offer_drop_notice(&self) {
        if let Some(text) =
            crate::protocol::ServerEvent::error(429, "events dropped: slow consumer").encode()
        {
            let _ = self.sender.try_send(OutboundFrame::Event {
                text,
                class: DeliveryClass::Ephemeral,
            });
        }
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ServerEvent;

    fn handle_with_capacity(cap: usize) -> (ConnectionHandle, mpsc::Receiver<OutboundFrame>) {
        let (tx, rx) = mpsc::channel(cap);
        let handle = ConnectionHandle::new(1, tx, CancellationToken::new());
        (handle, rx)
    }

    #[tokio::test]
    async fn ephemeral_overflow_drops_and_keeps_connection() {
        let (handle, _rx) = handle_with_capacity(2);
        let text = ServerEvent::Typing {
            conversation_id: 1,
            user_id: 2,
            is_typing: true,
        }
        .encode()
        .unwrap();

        assert_eq!(
            handle.push_event(text.clone(), DeliveryClass::Ephemeral),
            PushOutcome::Queued
        );
        assert_eq!(
            handle.push_event(text.clone(), DeliveryClass::Ephemeral),
            PushOutcome::Queued
        );
        // Queue is full: the frame is dropped (a drop notice may or may
        // not squeeze in) but the connection is not cancelled.
        assert_eq!(
            handle.push_event(text, DeliveryClass::Ephemeral),
            PushOutcome::DroppedEphemeral
        );
        assert!(!handle.cancel_token().is_cancelled());
    }

    #[tokio::test]
    async fn guaranteed_overflow_cancels_connection() {
        let (handle, _rx) = handle_with_capacity(1);
        let text = ServerEvent::Read {
            conversation_id: 1,
            user_id: 2,
        }
        .encode()
        .unwrap();

        assert_eq!(
            handle.push_event(text.clone(), DeliveryClass::Guaranteed),
            PushOutcome::Queued
        );
        assert_eq!(
            handle.push_event(text, DeliveryClass::Guaranteed),
            PushOutcome::ClosedBackpressure
        );
        assert!(handle.cancel_token().is_cancelled());
    }

    #[tokio::test]
    async fn push_after_receiver_drop_reports_gone() {
        let (handle, rx) = handle_with_capacity(1);
        drop(rx);
        let text = ServerEvent::error(500, "x").encode().unwrap();
        assert_eq!(
            handle.push_event(text, DeliveryClass::Ephemeral),
            PushOutcome::Gone
        );
    }
}
