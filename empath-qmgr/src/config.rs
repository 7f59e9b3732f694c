//! Engine configuration.
//!
//! Follows the `<transport>_<name>` / `default_<name>` override pattern: a
//! global [`EngineConfig`] carries the `default_*` values, and a
//! [`TransportConfig`] registry carries per-transport overrides that fall
//! back to the defaults when absent.

use std::{collections::HashMap, time::Duration};

use rand::Rng;
use serde::{Deserialize, Serialize};

fn default_queue_run_delay() -> u64 {
    300
}

fn default_min_backoff_time() -> u64 {
    300
}

fn default_max_backoff_time() -> u64 {
    4000
}

fn default_max_queue_lifetime() -> u64 {
    5 * 24 * 3600
}

fn default_active_limit() -> usize {
    20_000
}

fn default_message_recipient_limit() -> usize {
    50_000
}

fn default_transport_recipient_limit() -> usize {
    50
}

fn default_destination_recipient_limit() -> usize {
    50
}

fn default_destination_concurrency_limit() -> usize {
    20
}

fn default_initial_destination_concurrency() -> usize {
    5
}

fn default_transport_retry_time() -> u64 {
    60
}

fn default_delivery_slot_cost() -> usize {
    5
}

fn default_delivery_slot_loan() -> usize {
    3
}

fn default_delivery_slot_discount() -> u8 {
    10
}

fn default_minimum_delivery_slots() -> usize {
    3
}

/// Exponential backoff and bounded-lifetime policy for deferred recipients,
/// `#[serde(flatten)]`-embedded into [`TransportConfig`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_min_backoff_time")]
    pub min_backoff_secs: u64,
    #[serde(default = "default_max_backoff_time")]
    pub max_backoff_secs: u64,
    #[serde(default = "default_max_queue_lifetime")]
    pub max_queue_lifetime_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            min_backoff_secs: default_min_backoff_time(),
            max_backoff_secs: default_max_backoff_time(),
            max_queue_lifetime_secs: default_max_queue_lifetime(),
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub const fn min_backoff(&self) -> Duration {
        Duration::from_secs(self.min_backoff_secs)
    }

    #[must_use]
    pub const fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }

    /// `min(max_backoff, max(min_backoff, 2 * last_interval))`, jittered by
    /// up to ±10% so a burst of recipients deferred in the same tick don't
    /// all wake for their retry at exactly the same instant.
    #[must_use]
    pub fn next_interval(&self, last_interval: Duration) -> Duration {
        let doubled = last_interval.saturating_mul(2).max(self.min_backoff());
        let base = doubled.min(self.max_backoff());

        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        {
            let jitter_range = base.as_secs_f64() * 0.1;
            let jitter = rand::rng().random_range(-jitter_range..=jitter_range);
            Duration::from_secs_f64((base.as_secs_f64() + jitter).max(0.0))
        }
    }

    #[must_use]
    pub fn lifetime_exceeded(&self, age: Duration) -> bool {
        age.as_secs() >= self.max_queue_lifetime_secs
    }
}

/// The preemption tunables consumed by the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreemptionPolicy {
    #[serde(default = "default_delivery_slot_cost")]
    pub delivery_slot_cost: usize,
    #[serde(default = "default_delivery_slot_loan")]
    pub delivery_slot_loan: usize,
    /// Percent, 0-100.
    #[serde(default = "default_delivery_slot_discount")]
    pub delivery_slot_discount: u8,
    #[serde(default = "default_minimum_delivery_slots")]
    pub minimum_delivery_slots: usize,
}

impl Default for PreemptionPolicy {
    fn default() -> Self {
        Self {
            delivery_slot_cost: default_delivery_slot_cost(),
            delivery_slot_loan: default_delivery_slot_loan(),
            delivery_slot_discount: default_delivery_slot_discount(),
            minimum_delivery_slots: default_minimum_delivery_slots(),
        }
    }
}

/// Per-transport overrides; any field not set here falls back to
/// [`EngineConfig`]'s `default_*` value for the same concern.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TransportConfig {
    pub concurrency_limit: Option<usize>,
    pub initial_destination_concurrency: Option<usize>,
    pub recipient_limit: Option<usize>,
    pub destination_recipient_limit: Option<usize>,
    pub transport_retry_secs: Option<u64>,
    #[serde(flatten)]
    pub retry: Option<RetryPolicy>,
    #[serde(flatten)]
    pub preemption: Option<PreemptionPolicy>,
    /// Recipients bound to this transport are always deferred rather than
    /// delivered.
    #[serde(default)]
    pub always_defer: bool,
}

/// Global engine configuration: the `default_*` values, a per-transport
/// override registry, and the filter tables consulted by the loader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_queue_run_delay")]
    pub queue_run_delay_secs: u64,
    #[serde(default = "default_active_limit")]
    pub active_limit: usize,
    /// Caps how many recipients a single message may bind in-core at once
    /// (enforced by [`crate::loader::MessageLoader::load_recipient`]);
    /// messages with more recipients stream in successive cohorts via
    /// `Message::resume_offset`.
    #[serde(default = "default_message_recipient_limit")]
    pub message_recipient_limit: usize,
    #[serde(default = "default_transport_recipient_limit")]
    pub default_transport_recipient_limit: usize,
    #[serde(default = "default_destination_recipient_limit")]
    pub default_destination_recipient_limit: usize,
    #[serde(default = "default_destination_concurrency_limit")]
    pub default_concurrency_limit: usize,
    #[serde(default = "default_initial_destination_concurrency")]
    pub default_initial_destination_concurrency: usize,
    #[serde(default = "default_transport_retry_time")]
    pub default_transport_retry_secs: u64,
    #[serde(default)]
    pub default_retry: RetryPolicy,
    #[serde(default)]
    pub default_preemption: PreemptionPolicy,
    /// Dead-destination cache capacity; bounded by the same knob as the
    /// per-message recipient limit.
    #[serde(default = "default_message_recipient_limit")]
    pub dead_cache_capacity: usize,
    #[serde(default)]
    pub transports: HashMap<String, TransportConfig>,
    /// Recipients resolving to these transports are deferred, never
    /// delivered.
    #[serde(default)]
    pub deferred_transports: Vec<String>,
    /// `address -> new address` relocated-user table.
    #[serde(default)]
    pub relocated: HashMap<String, String>,
    /// `domain -> rewritten domain` virtual table.
    #[serde(default)]
    pub virtual_domains: HashMap<String, String>,
    /// Distinguished address silently discarded rather than bounced.
    #[serde(default)]
    pub double_bounce_address: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queue_run_delay_secs: default_queue_run_delay(),
            active_limit: default_active_limit(),
            message_recipient_limit: default_message_recipient_limit(),
            default_transport_recipient_limit: default_transport_recipient_limit(),
            default_destination_recipient_limit: default_destination_recipient_limit(),
            default_concurrency_limit: default_destination_concurrency_limit(),
            default_initial_destination_concurrency: default_initial_destination_concurrency(),
            default_transport_retry_secs: default_transport_retry_time(),
            default_retry: RetryPolicy::default(),
            default_preemption: PreemptionPolicy::default(),
            dead_cache_capacity: default_message_recipient_limit(),
            transports: HashMap::new(),
            deferred_transports: Vec::new(),
            relocated: HashMap::new(),
            virtual_domains: HashMap::new(),
            double_bounce_address: None,
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub fn queue_run_delay(&self) -> Duration {
        Duration::from_secs(self.queue_run_delay_secs)
    }

    #[must_use]
    pub fn concurrency_limit(&self, transport: &str) -> usize {
        self.transports
            .get(transport)
            .and_then(|t| t.concurrency_limit)
            .unwrap_or(self.default_concurrency_limit)
    }

    #[must_use]
    pub fn initial_destination_concurrency(&self, transport: &str) -> usize {
        self.transports
            .get(transport)
            .and_then(|t| t.initial_destination_concurrency)
            .unwrap_or(self.default_initial_destination_concurrency)
    }

    #[must_use]
    pub fn transport_recipient_limit(&self, transport: &str) -> usize {
        self.transports
            .get(transport)
            .and_then(|t| t.recipient_limit)
            .unwrap_or(self.default_transport_recipient_limit)
    }

    #[must_use]
    pub fn destination_recipient_limit(&self, transport: &str) -> usize {
        self.transports
            .get(transport)
            .and_then(|t| t.destination_recipient_limit)
            .unwrap_or(self.default_destination_recipient_limit)
    }

    #[must_use]
    pub fn transport_retry(&self, transport: &str) -> Duration {
        let secs = self
            .transports
            .get(transport)
            .and_then(|t| t.transport_retry_secs)
            .unwrap_or(self.default_transport_retry_secs);
        Duration::from_secs(secs)
    }

    #[must_use]
    pub fn retry_policy(&self, transport: &str) -> RetryPolicy {
        self.transports
            .get(transport)
            .and_then(|t| t.retry.clone())
            .unwrap_or_else(|| self.default_retry.clone())
    }

    #[must_use]
    pub fn preemption_policy(&self, transport: &str) -> PreemptionPolicy {
        self.transports
            .get(transport)
            .and_then(|t| t.preemption.clone())
            .unwrap_or_else(|| self.default_preemption.clone())
    }

    #[must_use]
    pub fn is_deferred_transport(&self, transport: &str) -> bool {
        self.transports
            .get(transport)
            .is_some_and(|t| t.always_defer)
            || self.deferred_transports.iter().any(|t| t == transport)
    }
}
