//! Error taxonomies for the hub's fallible boundaries.

use thiserror::Error;

/// Failures talking to an external collaborator (persistence store,
/// authorization service). The hub fails closed on these: no event is
/// dispatched and the client gets an explicit `error` envelope.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("upstream call timed out")]
    Timeout,

    #[error("upstream unavailable: {0}")]
    Unavailable(String),
}

/// Handshake ticket validation outcomes that map to WebSocket close codes.
#[derive(Debug, Error)]
pub enum TicketError {
    #[error("ticket expired")]
    Expired,

    #[error("ticket invalid")]
    Invalid,

    #[error(transparent)]
    Upstream(#[from] UpstreamError),
}

/// Why a connection could not be registered.
#[derive(Debug, Error)]
pub enum RegisterError {
    #[error("user connection limit reached")]
    ConnectionLimit,
}
