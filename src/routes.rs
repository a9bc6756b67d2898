use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;

use crate::hub::router::{ReactionEvent, ReadReceiptEvent};
use crate::protocol::{ConversationId, UserId};
use crate::state::AppState;
use crate::upstream::StoredMessage;
use crate::ws::handler as ws_handler;

/// GET /healthz — liveness probe.
async fn healthz() -> &'static str {
    "ok"
}

/// GET /api/presence — snapshot of currently-online users.
async fn presence_snapshot(State(state): State<AppState>) -> Json<serde_json::Value> {
    let mut user_ids = state.presence.online_users();
    user_ids.sort_unstable();
    Json(serde_json::json!({ "user_ids": user_ids }))
}

#[derive(Debug, Deserialize)]
struct TicketRequest {
    user_id: UserId,
}

/// POST /api/tickets — issue a single-use connection ticket.
///
/// In a full deployment this sits behind the session-authenticated API
/// gateway; the hub itself only ever sees the opaque ticket.
async fn issue_ticket(
    State(state): State<AppState>,
    Json(req): Json<TicketRequest>,
) -> Json<serde_json::Value> {
    let ticket = state.directory.issue_ticket(req.user_id);
    Json(serde_json::json!({ "ticket": ticket }))
}

#[derive(Debug, Deserialize)]
struct ConversationRequest {
    conversation_id: ConversationId,
    participants: Vec<UserId>,
}

/// POST /api/conversations — seed a conversation's durable participant
/// list in the reference directory.
async fn create_conversation(
    State(state): State<AppState>,
    Json(req): Json<ConversationRequest>,
) -> StatusCode {
    state
        .directory
        .create_conversation(req.conversation_id, &req.participants);
    StatusCode::CREATED
}

/// POST /api/ingest/message — the persistence side reports a durably
/// stored message for fan-out. Idempotent within the dedup window.
async fn ingest_message(
    State(state): State<AppState>,
    Json(message): Json<StoredMessage>,
) -> StatusCode {
    state.router.on_message_persisted(message).await;
    StatusCode::ACCEPTED
}

/// POST /api/ingest/reaction
async fn ingest_reaction(
    State(state): State<AppState>,
    Json(event): Json<ReactionEvent>,
) -> StatusCode {
    state.router.on_reaction_changed(event).await;
    StatusCode::ACCEPTED
}

/// POST /api/ingest/read
async fn ingest_read(
    State(state): State<AppState>,
    Json(event): Json<ReadReceiptEvent>,
) -> StatusCode {
    state.router.on_read_receipt(event).await;
    StatusCode::ACCEPTED
}

/// Build the full axum Router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler::ws_upgrade))
        .route("/healthz", get(healthz))
        .route("/api/presence", get(presence_snapshot))
        .route("/api/tickets", post(issue_ticket))
        .route("/api/conversations", post(create_conversation))
        .route("/api/ingest/message", post(ingest_message))
        .route("/api/ingest/reaction", post(ingest_reaction))
        .route("/api/ingest/read", post(ingest_read))
        .with_state(state)
}
