//! Per-destination concurrency controller (C6): slow start, failure
//! backoff, and a short-term dead-destination cache.

use std::{
    collections::VecDeque,
    time::{Duration, SystemTime},
};

use parking_lot::Mutex;

use crate::entity::{DestId, EntityStore};

/// Bounded, insertion-ordered record of recently-dead destinations. Acts
/// as a cache sized by `dead_cache_capacity`, evicting the oldest entry
/// when full — the same `DashMap`-of-state idiom the deleted
/// (internalized) `circuit_breaker.rs` used for its open/half-open/closed
/// states, simplified to a single dead/alive distinction.
#[derive(Default)]
struct DeadCache {
    order: VecDeque<DestId>,
    capacity: usize,
}

impl DeadCache {
    fn new(capacity: usize) -> Self {
        Self { order: VecDeque::new(), capacity: capacity.max(1) }
    }

    fn record(&mut self, dest: DestId) {
        self.order.retain(|d| *d != dest);
        self.order.push_back(dest);
        while self.order.len() > self.capacity {
            self.order.pop_front();
        }
    }

    fn forget(&mut self, dest: DestId) {
        self.order.retain(|d| *d != dest);
    }

    fn clear(&mut self) {
        self.order.clear();
    }
}

pub struct ConcurrencyController {
    cache: Mutex<DeadCache>,
}

impl ConcurrencyController {
    #[must_use]
    pub fn new(dead_cache_capacity: usize) -> Self {
        Self { cache: Mutex::new(DeadCache::new(dead_cache_capacity)) }
    }

    /// Slow start: one successful delivery grows the window by one,
    /// capped at the transport's configured concurrency limit.
    pub fn on_success(&self, store: &EntityStore, dest: DestId, transport_limit: usize) {
        if let Some(mut row) = store.destination_mut(dest) {
            row.in_flight = row.in_flight.saturating_sub(1);
            row.window = (row.window + 1).min(transport_limit.max(1));
            row.blocker = false;
        }
    }

    /// Hard connection failure: mark the destination dead until
    /// `now + min_backoff`, reset its window to the initial concurrency,
    /// and zero its in-flight count (pending recipients are deferred by
    /// the retry/reporter, not here).
    pub fn on_hard_failure(
        &self,
        store: &EntityStore,
        dest: DestId,
        min_backoff: Duration,
        initial_window: usize,
    ) {
        if let Some(mut row) = store.destination_mut(dest) {
            row.in_flight = 0;
            row.window = initial_window.max(1);
            row.dead_until = Some(SystemTime::now() + min_backoff);
            row.blocker = false;
        }
        self.cache.lock().record(dest);
    }

    /// Per-recipient soft failure: window is unchanged; only the
    /// in-flight count for the completed recipient drops.
    pub fn on_soft_failure(&self, store: &EntityStore, dest: DestId) {
        if let Some(mut row) = store.destination_mut(dest) {
            row.in_flight = row.in_flight.saturating_sub(1);
        }
    }

    #[must_use]
    pub fn is_dead(&self, store: &EntityStore, dest: DestId, now: SystemTime) -> bool {
        store.destination(dest).is_some_and(|row| row.is_dead(now))
    }

    /// `FLUSH_DEAD`: immediately clears every dead flag and the cache.
    pub fn flush_dead(&self, store: &EntityStore, destinations: &[DestId]) {
        for &dest in destinations {
            if let Some(mut row) = store.destination_mut(dest) {
                row.dead_until = None;
            }
        }
        self.cache.lock().clear();
    }

    pub fn forget(&self, dest: DestId) {
        self.cache.lock().forget(dest);
    }
}
