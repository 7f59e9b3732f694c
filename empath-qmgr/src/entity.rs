//! Entity store (C1): interned transports and destination queues.
//!
//! The transport ↔ destination-queue ↔ job ↔ message reference cycle is
//! broken at the type level by keying everything off small interned ids
//! rather than direct references, the way the deleted (internalized)
//! `processor/mod.rs`'s `DeliveryQueue` keeps a `DashMap` rather than an
//! owning tree of pointers.

use std::{
    sync::atomic::{AtomicU32, Ordering},
    time::SystemTime,
};

use dashmap::DashMap;

use crate::message::RecipientEntry;

/// Interned transport identity. Small and `Copy` so it can be threaded
/// through the scheduler without borrow-checker friction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransportId(u32);

impl TransportId {
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }
}

/// Interned `(transport, nexthop)` identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DestId(u32);

impl DestId {
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }
}

#[derive(Debug)]
pub struct Transport {
    pub id: TransportId,
    pub name: String,
    pub dead_until: Option<SystemTime>,
    pub destinations: Vec<DestId>,
}

impl Transport {
    #[must_use]
    pub fn is_dead(&self, now: SystemTime) -> bool {
        self.dead_until.is_some_and(|until| now < until)
    }
}

#[derive(Debug)]
pub struct DestinationQueue {
    pub id: DestId,
    pub transport: TransportId,
    pub nexthop: String,
    pub pending: Vec<RecipientEntry>,
    pub in_flight: usize,
    pub window: usize,
    pub dead_until: Option<SystemTime>,
    /// Set when this destination is holding up a job's selection because
    /// it has no spare window; cleared once the window frees up again.
    pub blocker: bool,
}

impl DestinationQueue {
    #[must_use]
    pub fn is_dead(&self, now: SystemTime) -> bool {
        self.dead_until.is_some_and(|until| now < until)
    }

    #[must_use]
    pub fn has_spare_window(&self) -> bool {
        self.in_flight < self.window
    }

    #[must_use]
    pub fn is_empty_and_idle(&self) -> bool {
        self.pending.is_empty() && self.in_flight == 0 && !self.blocker
    }
}

/// Owns the transport and destination-queue graph, keyed by interned ids.
#[derive(Debug, Default)]
pub struct EntityStore {
    transports: DashMap<String, TransportId>,
    transport_rows: DashMap<TransportId, Transport>,
    destinations: DashMap<(TransportId, String), DestId>,
    destination_rows: DashMap<DestId, DestinationQueue>,
    next_transport: AtomicU32,
    next_dest: AtomicU32,
}

impl EntityStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Finds or creates the transport with this name.
    pub fn intern_transport(&self, name: &str) -> TransportId {
        if let Some(id) = self.transports.get(name) {
            return *id;
        }
        let id = TransportId(self.next_transport.fetch_add(1, Ordering::Relaxed));
        self.transports.insert(name.to_string(), id);
        self.transport_rows.insert(
            id,
            Transport {
                id,
                name: name.to_string(),
                dead_until: None,
                destinations: Vec::new(),
            },
        );
        id
    }

    /// Finds or creates the destination queue for `(transport, nexthop)`.
    pub fn intern_destination(
        &self,
        transport: TransportId,
        nexthop: &str,
        initial_window: usize,
    ) -> DestId {
        let key = (transport, nexthop.to_string());
        if let Some(id) = self.destinations.get(&key) {
            return *id;
        }
        let id = DestId(self.next_dest.fetch_add(1, Ordering::Relaxed));
        self.destinations.insert(key, id);
        self.destination_rows.insert(
            id,
            DestinationQueue {
                id,
                transport,
                nexthop: nexthop.to_string(),
                pending: Vec::new(),
                in_flight: 0,
                window: initial_window,
                dead_until: None,
                blocker: false,
            },
        );
        if let Some(mut row) = self.transport_rows.get_mut(&transport) {
            row.destinations.push(id);
        }
        id
    }

    #[must_use]
    pub fn transport(&self, id: TransportId) -> Option<dashmap::mapref::one::Ref<'_, TransportId, Transport>> {
        self.transport_rows.get(&id)
    }

    pub fn transport_mut(
        &self,
        id: TransportId,
    ) -> Option<dashmap::mapref::one::RefMut<'_, TransportId, Transport>> {
        self.transport_rows.get_mut(&id)
    }

    #[must_use]
    pub fn destination(&self, id: DestId) -> Option<dashmap::mapref::one::Ref<'_, DestId, DestinationQueue>> {
        self.destination_rows.get(&id)
    }

    pub fn destination_mut(
        &self,
        id: DestId,
    ) -> Option<dashmap::mapref::one::RefMut<'_, DestId, DestinationQueue>> {
        self.destination_rows.get_mut(&id)
    }

    /// Removes a destination queue if it is empty and not blocking
    /// anything.
    pub fn reap_destination(&self, id: DestId) {
        let should_remove = self
            .destination_rows
            .get(&id)
            .is_some_and(|d| d.is_empty_and_idle());
        if should_remove {
            if let Some((_, dest)) = self.destination_rows.remove(&id) {
                if let Some(mut t) = self.transport_rows.get_mut(&dest.transport) {
                    t.destinations.retain(|d| *d != id);
                }
            }
        }
    }

    #[must_use]
    pub fn transport_count(&self) -> usize {
        self.transport_rows.len()
    }
}
