//! Actor-per-connection pumps.
//!
//! Each accepted socket is split into a reader half and a writer task.
//! The writer owns the sink and drains the connection's bounded outbound
//! queue; the reader decodes client actions and hands them to the router.
//! A shared cancellation token trips both halves, and every exit path
//! funnels into a single unregister at the bottom of `run_connection`.

use std::sync::{Arc, Mutex};

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{interval, Instant};
use tokio_util::sync::CancellationToken;

use crate::error::RegisterError;
use crate::metrics;
use crate::protocol::{ClientAction, DeliveryClass, ServerEvent, UserId};
use crate::state::AppState;
use crate::ws::{ConnectionHandle, OutboundFrame};

/// Close code sent when the per-user connection cap is hit.
const CLOSE_CONNECTION_LIMIT: u16 = 4008;

/// Run the pumps for an authenticated WebSocket until either side closes.
pub async fn run_connection(socket: WebSocket, state: AppState, user_id: UserId) {
    let (ws_sender, mut ws_receiver) = socket.split();
    let (tx, rx) = mpsc::channel::<OutboundFrame>(state.settings.queue_capacity);
    let cancel = CancellationToken::new();
    let handle = ConnectionHandle::new(user_id, tx, cancel.clone());

    if let Err(RegisterError::ConnectionLimit) = state.registry.register(handle.clone()) {
        tracing::warn!(user_id, "Connection limit reached, refusing socket");
        let mut sink = ws_sender;
        let _ = sink
            .send(Message::Close(Some(CloseFrame {
                code: CLOSE_CONNECTION_LIMIT,
                reason: "Connection limit reached".into(),
            })))
            .await;
        return;
    }

    metrics::connection_opened();
    tracing::info!(user_id, connection_id = handle.id(), "WebSocket actor started");

    // Initial snapshot so a fresh tab knows who is around.
    if let Some(text) = (ServerEvent::ConnectedUsers {
        user_ids: state.presence.online_users(),
    })
    .encode()
    {
        handle.push_event(text, DeliveryClass::Ephemeral);
    }

    let last_pong = Arc::new(Mutex::new(Instant::now()));

    let writer = tokio::spawn(write_loop(
        ws_sender,
        rx,
        cancel.clone(),
        last_pong.clone(),
        state.clone(),
        user_id,
    ));

    // Reader loop: decode client actions and dispatch.
    loop {
        let incoming = tokio::select! {
            _ = cancel.cancelled() => break,
            incoming = ws_receiver.next() => incoming,
        };

        match incoming {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientAction>(&text) {
                Ok(action) => state.router.handle_action(user_id, action, &handle).await,
                Err(e) => {
                    // A malformed frame never terminates the session.
                    metrics::decode_error();
                    tracing::warn!(user_id, error = %e, "Undecodable client frame dropped");
                }
            },
            Some(Ok(Message::Binary(_))) => {
                tracing::debug!(user_id, "Binary frame ignored (protocol is JSON text)");
            }
            Some(Ok(Message::Ping(data))) => {
                handle.push_pong(data.to_vec());
            }
            Some(Ok(Message::Pong(_))) => {
                let mut last = last_pong.lock().unwrap_or_else(|e| e.into_inner());
                *last = Instant::now();
            }
            Some(Ok(Message::Close(frame))) => {
                tracing::info!(user_id, reason = ?frame, "Client initiated close");
                break;
            }
            Some(Err(e)) => {
                tracing::warn!(user_id, error = %e, "WebSocket receive error");
                break;
            }
            None => break,
        }
    }

    // Trip the writer if the reader exited first, then wait for it so the
    // close frame (if any) gets flushed.
    cancel.cancel();
    let _ = writer.await;

    state.registry.unregister(user_id, handle.id());
    metrics::connection_closed();
    tracing::info!(user_id, connection_id = handle.id(), "WebSocket actor stopped");
}

/// Writer task: drains the bounded outbound queue into the sink and runs
/// keep-alive supervision. Suspends until a frame is queued, the ping
/// timer ticks, or the connection is cancelled; it never busy-waits.
async fn write_loop(
    mut sink: futures_util::stream::SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<OutboundFrame>,
    cancel: CancellationToken,
    last_pong: Arc<Mutex<Instant>>,
    state: AppState,
    user_id: UserId,
) {
    let mut ping_timer = interval(state.settings.ping_interval);
    // Skip the first immediate tick.
    ping_timer.tick().await;

    let pong_deadline = state.settings.ping_interval + state.settings.pong_timeout;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = sink.send(Message::Close(Some(CloseFrame {
                    code: 1001,
                    reason: "Server closing".into(),
                }))).await;
                break;
            }
            frame = rx.recv() => {
                let sent = match frame {
                    Some(OutboundFrame::Event { text, .. }) => {
                        sink.send(Message::Text(text.as_ref().into())).await
                    }
                    Some(OutboundFrame::Pong(payload)) => {
                        sink.send(Message::Pong(payload.into())).await
                    }
                    None => break,
                };
                if sent.is_err() {
                    // Sink is broken; the reader will notice too.
                    break;
                }
            }
            _ = ping_timer.tick() => {
                let silent_for = {
                    let last = last_pong.lock().unwrap_or_else(|e| e.into_inner());
                    last.elapsed()
                };
                if silent_for > pong_deadline {
                    tracing::warn!(user_id, "Pong timeout, closing connection");
                    let _ = sink.send(Message::Close(Some(CloseFrame {
                        code: 1001,
                        reason: "Pong timeout".into(),
                    }))).await;
                    break;
                }
                if sink.send(Message::Ping(vec![1, 2, 3, 4].into())).await.is_err() {
                    break;
                }
            }
        }
    }

    cancel.cancel();
}
