//! Metric names and recording helpers.
//!
//! Every deliberate data-loss point is counted with a reason label so
//! operators can tell "client too slow" apart from a bug.

pub const ACTIVE_CONNECTIONS: &str = "chorus_hub_active_connections";
pub const BACKPRESSURE_DROPS: &str = "chorus_hub_backpressure_drops_total";
pub const DECODE_ERRORS: &str = "chorus_hub_decode_errors_total";
pub const EVENTS_DISPATCHED: &str = "chorus_hub_events_dispatched_total";
pub const DUPLICATES_SUPPRESSED: &str = "chorus_hub_duplicates_suppressed_total";
pub const UNAUTHORIZED_ACTIONS: &str = "chorus_hub_unauthorized_actions_total";
pub const UPSTREAM_FAILURES: &str = "chorus_hub_upstream_failures_total";

/// Reason labels for backpressure drops.
pub const REASON_EPHEMERAL_FULL: &str = "ephemeral_full";
pub const REASON_GUARANTEED_FULL: &str = "guaranteed_full";
pub const REASON_RECEIVER_GONE: &str = "receiver_gone";

pub fn connection_opened() {
    metrics::gauge!(ACTIVE_CONNECTIONS).increment(1.0);
}

pub fn connection_closed() {
    metrics::gauge!(ACTIVE_CONNECTIONS).decrement(1.0);
}

pub fn backpressure_drop(reason: &'static str) {
    metrics::counter!(BACKPRESSURE_DROPS, "reason" => reason).increment(1);
}

pub fn decode_error() {
    metrics::counter!(DECODE_ERRORS).increment(1);
}

pub fn event_dispatched(kind: &'static str) {
    metrics::counter!(EVENTS_DISPATCHED, "event_type" => kind).increment(1);
}

pub fn duplicate_suppressed() {
    metrics::counter!(DUPLICATES_SUPPRESSED).increment(1);
}

pub fn unauthorized_action(action: &'static str) {
    metrics::counter!(UNAUTHORIZED_ACTIONS, "action" => action).increment(1);
}

pub fn upstream_failure(operation: &'static str) {
    metrics::counter!(UPSTREAM_FAILURES, "operation" => operation).increment(1);
}
