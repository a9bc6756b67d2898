use std::sync::Arc;
use std::time::Duration;

use crate::hub::dedup::DedupCache;
use crate::hub::membership::MembershipIndex;
use crate::hub::presence::PresenceTracker;
use crate::hub::registry::ConnectionRegistry;
use crate::hub::router::EventRouter;
use crate::upstream::{MemoryBackend, TicketValidator};

/// Runtime settings derived from config at startup.
#[derive(Debug, Clone)]
pub struct HubSettings {
    pub queue_capacity: usize,
    pub offline_grace: Duration,
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
    pub dedup_window: Duration,
    pub dedup_max_entries: usize,
    pub upstream_timeout: Duration,
    pub max_conns_per_user: usize,
    pub ticket_ttl: Duration,
}

/// Shared application state passed to all handlers via axum State extractor.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<HubSettings>,
    /// Live connections per user; the single shared presence funnel
    /// hangs off it.
    pub registry: Arc<ConnectionRegistry>,
    /// Runtime conversation membership (fan-out index, not truth).
    pub membership: Arc<MembershipIndex>,
    pub presence: Arc<PresenceTracker>,
    pub router: Arc<EventRouter>,
    /// Handshake ticket validation.
    pub tickets: Arc<dyn TicketValidator>,
    /// Reference backend, also serving as the ticket issuer and the
    /// conversation directory behind the REST surface.
    pub directory: Arc<MemoryBackend>,
}

impl AppState {
    /// Wire up the hub around the in-memory reference backend.
    pub fn build(settings: HubSettings) -> Self {
        let directory = Arc::new(MemoryBackend::new(settings.ticket_ttl));

        let presence = PresenceTracker::new(settings.offline_grace);
        let registry = ConnectionRegistry::new(presence.clone(), settings.max_conns_per_user);
        let membership = Arc::new(MembershipIndex::new());

        let router = EventRouter::new(
            registry.clone(),
            membership.clone(),
            directory.clone(),
            directory.clone(),
            DedupCache::new(settings.dedup_window, settings.dedup_max_entries),
            settings.upstream_timeout,
        );

        // The router broadcasts presence transitions; a weak reference
        // keeps the subscriber list from pinning it alive.
        let weak = Arc::downgrade(&router);
        presence.subscribe(Arc::new(move |user, online| {
            if let Some(router) = weak.upgrade() {
                router.on_presence_change(user, online);
            }
        }));

        Self {
            settings: Arc::new(settings),
            registry,
            membership,
            presence,
            router,
            tickets: directory.clone(),
            directory,
        }
    }
}
