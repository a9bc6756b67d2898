use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use serde::Deserialize;

use crate::error::TicketError;
use crate::metrics;
use crate::state::AppState;
use crate::ws::actor;

/// Query parameters for the WebSocket handshake. Auth is a single-use
/// ticket in the query string; the socket itself never carries credentials.
#[derive(Debug, Deserialize)]
pub struct WsAuthQuery {
    pub ticket: String,
}

/// WebSocket close codes:
/// 4001 = ticket expired
/// 4002 = ticket invalid
const CLOSE_TICKET_EXPIRED: u16 = 4001;
const CLOSE_TICKET_INVALID: u16 = 4002;
/// 1013 = try again later (ticket service unreachable).
const CLOSE_TRY_LATER: u16 = 1013;

/// GET /ws?ticket=...
///
/// Upgrade endpoint. The ticket is validated before any registration
/// happens; on failure the connection is upgraded and then immediately
/// closed with a code the client can distinguish.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    Query(params): Query<WsAuthQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let validated = tokio::time::timeout(
        state.settings.upstream_timeout,
        state.tickets.validate(&params.ticket),
    )
    .await;

    match validated {
        Ok(Ok(claims)) => {
            tracing::info!(user_id = claims.user_id, "WebSocket ticket accepted");
            ws.on_upgrade(move |socket| actor::run_connection(socket, state, claims.user_id))
        }
        Ok(Err(err)) => {
            let (close_code, reason) = match err {
                TicketError::Expired => (CLOSE_TICKET_EXPIRED, "Ticket expired"),
                TicketError::Invalid => (CLOSE_TICKET_INVALID, "Ticket invalid"),
                TicketError::Upstream(_) => {
                    metrics::upstream_failure("validate_ticket");
                    (CLOSE_TRY_LATER, "Try again later")
                }
            };
            tracing::warn!(close_code, reason, "WebSocket handshake refused");
            refuse(ws, close_code, reason)
        }
        Err(_) => {
            metrics::upstream_failure("validate_ticket");
            tracing::warn!("Ticket validation timed out");
            refuse(ws, CLOSE_TRY_LATER, "Try again later")
        }
    }
}

/// Upgrade, send a close frame with the given code, and hang up.
fn refuse(ws: WebSocketUpgrade, code: u16, reason: &'static str) -> Response {
    ws.on_upgrade(move |mut socket| async move {
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code,
                reason: reason.into(),
            })))
            .await;
    })
}
