//! Query-service trait decoupling the trigger/control surface from the
//! concrete [`crate::engine::Engine`] (grounded on the deleted, now
//! internalized `DeliveryQueryService` trait).

use serde::{Deserialize, Serialize};

use crate::trigger::Trigger;

/// A read-only snapshot of one destination queue's scheduling state,
/// returned by the introspection protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationSnapshot {
    pub nexthop: String,
    pub in_flight: usize,
    pub window: usize,
    pub pending: usize,
    pub dead: bool,
}

/// Everything the trigger/control surface needs from the engine, without
/// depending on its concrete type.
pub trait EngineQueryService: Send + Sync {
    /// Applies one decoded trigger byte's effect.
    fn handle_trigger(&self, trigger: Trigger);

    /// Current in-core message count.
    fn active_count(&self) -> usize;

    /// Current job-stack depth (frame count) for a transport.
    fn job_stack_depth(&self, transport: &str) -> usize;

    /// Snapshot of every destination queue under a transport.
    fn destinations(&self, transport: &str) -> Vec<DestinationSnapshot>;
}
