//! Short-lived memory of recently delivered message IDs.
//!
//! Suppresses double delivery when a direct push and a reconnect-triggered
//! resync race each other. Bounded two ways: entries older than the window
//! are evicted, and a hard size cap bounds memory regardless of traffic.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use crate::protocol::{ConversationId, MessageId};

type Key = (ConversationId, MessageId);

struct DedupInner {
    seen: HashMap<Key, Instant>,
    /// Insertion order for cheap oldest-first eviction.
    order: VecDeque<Key>,
}

pub struct DedupCache {
    inner: Mutex<DedupInner>,
    window: Duration,
    max_entries: usize,
}

impl DedupCache {
    pub fn new(window: Duration, max_entries: usize) -> Self {
        Self {
            inner: Mutex::new(DedupInner {
                seen: HashMap::new(),
                order: VecDeque::new(),
            }),
            window,
            max_entries,
        }
    }

    pub fn seen_recently(&self, conversation: ConversationId, message: MessageId) -> bool {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .seen
            .get(&(conversation, message))
            .map(|t| t.elapsed() < self.window)
            .unwrap_or(false)
    }

    /// Check and record under a single lock acquisition: returns true
    /// only for the first delivery of this message inside the window.
    /// Two dispatchers racing on the same message cannot both win.
    pub fn first_delivery(&self, conversation: ConversationId, message: MessageId) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let key = (conversation, message);
        let fresh = !inner
            .seen
            .get(&key)
            .map(|t| t.elapsed() < self.window)
            .unwrap_or(false);
        if fresh {
            if inner.seen.insert(key, Instant::now()).is_none() {
                inner.order.push_back(key);
            }
            self.evict(&mut inner);
        }
        fresh
    }

    pub fn mark_seen(&self, conversation: ConversationId, message: MessageId) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let key = (conversation, message);
        if inner.seen.insert(key, Instant::now()).is_none() {
            inner.order.push_back(key);
        }
        self.evict(&mut inner);
    }

    /// Drop expired entries from the front, then enforce the size cap by
    /// evicting oldest-first.
    fn evict(&self, inner: &mut DedupInner) {
        while let Some(&key) = inner.order.front() {
            let expired = inner
                .seen
                .get(&key)
                .map(|t| t.elapsed() >= self.window)
                .unwrap_or(true);
            if expired || inner.seen.len() > self.max_entries {
                inner.order.pop_front();
                inner.seen.remove(&key);
            } else {
                break;
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().unwrap().seen.len()
    }
}
