//! Lightweight OpenTelemetry counters/gauges for the queue manager's own
//! bookkeeping (active-set size, job-stack depth, destination window,
//! dead-destination count, admissions by source). Grounded on the
//! instrument-creation and `record_*` conventions from the workspace's
//! metrics crate, scoped down to what this component itself observes —
//! delivery-attempt and SMTP-session metrics stay out of scope here.

use opentelemetry::{
    KeyValue,
    metrics::{Counter, Histogram, Meter, UpDownCounter},
};

pub struct QmgrMetrics {
    admissions_total: Counter<u64>,
    active_set_size: UpDownCounter<i64>,
    stack_depth: Histogram<u64>,
    destination_window: Histogram<u64>,
    dead_destinations_total: Counter<u64>,
}

impl QmgrMetrics {
    #[must_use]
    pub fn new() -> Self {
        let meter = meter();

        let admissions_total = meter
            .u64_counter("empath.qmgr.admissions.total")
            .with_description("Messages admitted into the active queue, by source")
            .build();

        let active_set_size = meter
            .i64_up_down_counter("empath.qmgr.active_set.size")
            .with_description("Current number of messages occupying an active-set slot")
            .build();

        let stack_depth = meter
            .u64_histogram("empath.qmgr.stack.depth")
            .with_description("Distribution of a transport's job-stack frame count over time")
            .build();

        let destination_window = meter
            .u64_histogram("empath.qmgr.destination.window")
            .with_description("Distribution of per-destination concurrency windows")
            .build();

        let dead_destinations_total = meter
            .u64_counter("empath.qmgr.dead_destinations.total")
            .with_description("Destinations marked dead after a hard failure, by transport")
            .build();

        Self { admissions_total, active_set_size, stack_depth, destination_window, dead_destinations_total }
    }

    /// One message admitted from `source` ("incoming" or "deferred").
    pub fn record_admission(&self, source: &str) {
        self.admissions_total.add(1, &[KeyValue::new("source", source.to_string())]);
        self.active_set_size.add(1, &[]);
    }

    /// A message's active-set slot was freed.
    pub fn record_release(&self) {
        self.active_set_size.add(-1, &[]);
    }

    /// Snapshot of a transport's current job-stack frame count.
    #[allow(clippy::cast_possible_truncation)]
    pub fn record_stack_depth(&self, transport: &str, depth: usize) {
        self.stack_depth.record(depth as u64, &[KeyValue::new("transport", transport.to_string())]);
    }

    /// A destination's concurrency window changed to `window`.
    #[allow(clippy::cast_possible_truncation)]
    pub fn record_destination_window(&self, transport: &str, window: usize) {
        self.destination_window.record(window as u64, &[KeyValue::new("transport", transport.to_string())]);
    }

    /// A destination on `transport` was just marked dead.
    pub fn record_dead_destination(&self, transport: &str) {
        self.dead_destinations_total.add(1, &[KeyValue::new("transport", transport.to_string())]);
    }
}

impl Default for QmgrMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for QmgrMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QmgrMetrics").finish_non_exhaustive()
    }
}

fn meter() -> Meter {
    opentelemetry::global::meter("empath.qmgr")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_without_panicking() {
        let metrics = QmgrMetrics::new();
        metrics.record_admission("incoming");
        metrics.record_release();
        metrics.record_stack_depth("smtp", 1);
        metrics.record_stack_depth("smtp", 0);
        metrics.record_destination_window("smtp", 5);
        metrics.record_dead_destination("smtp");
    }
}
