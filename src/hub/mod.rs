//! The real-time hub: connection registry, conversation membership,
//! presence aggregation, dedup cache, and the event router that ties them
//! together.

pub mod dedup;
pub mod membership;
pub mod presence;
pub mod registry;
pub mod router;

pub use dedup::DedupCache;
pub use membership::MembershipIndex;
pub use presence::PresenceTracker;
pub use registry::ConnectionRegistry;
pub use router::EventRouter;
