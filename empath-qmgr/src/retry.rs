//! Retry / reporter (C8): applies backoff, bounded lifetime, and hands
//! off bounce/defer requests; also handles the startup left-over move
//! from active back to incoming.

use std::time::{Duration, SystemTime};

use async_trait::async_trait;

use crate::{config::RetryPolicy, message::RecipientStatus};

/// External collaborator: the bounce/defer status-report daemons. The
/// core holds only filenames and reasons; the report format itself is
/// out of scope.
#[async_trait]
pub trait Reporter: Send + Sync {
    async fn bounce(&self, queue_id: &str, recipient: &str, reason: &str) -> std::io::Result<()>;
    async fn defer(&self, queue_id: &str, recipient: &str, reason: &str, retry_at: SystemTime) -> std::io::Result<()>;
    async fn success(&self, queue_id: &str, recipient: &str) -> std::io::Result<()>;
}

/// Decides the next action for one recipient's outcome, given the
/// message's arrival time and the transport's retry policy.
pub struct RetryEngine<'a> {
    policy: &'a RetryPolicy,
}

impl<'a> RetryEngine<'a> {
    #[must_use]
    pub const fn new(policy: &'a RetryPolicy) -> Self {
        Self { policy }
    }

    /// Delivered: success only needs reporting when a DSN success receipt
    /// was requested by the sender; callers pass that flag in.
    #[must_use]
    pub const fn on_delivered(&self, dsn_success_requested: bool) -> Option<()> {
        if dsn_success_requested { Some(()) } else { None }
    }

    /// Soft failure: defer with a new backoff stamp, unless the message's
    /// age has already exceeded the maximal queue lifetime, in which case
    /// it escalates to a hard failure (bounce).
    #[must_use]
    pub fn on_soft_failure(&self, arrival_time: SystemTime, last_interval: Duration) -> RecipientStatus {
        let age = arrival_time.elapsed().unwrap_or_default();
        if self.policy.lifetime_exceeded(age) {
            RecipientStatus::Bounced { reason: "maximal queue lifetime exceeded".into() }
        } else {
            let interval = self.policy.next_interval(last_interval);
            RecipientStatus::Deferred {
                reason: "temporary delivery failure".into(),
                retry_at: SystemTime::now() + interval,
            }
        }
    }

    #[must_use]
    pub fn on_hard_failure(&self, reason: String) -> RecipientStatus {
        RecipientStatus::Bounced { reason }
    }
}

/// Startup left-over handling: anything still in the active queue when
/// the process starts gets moved back to incoming, stamped so it is not
/// retried until any still-live delivery from the prior run would have
/// finished.
#[must_use]
pub fn left_over_stamp(min_backoff: Duration) -> SystemTime {
    SystemTime::now() + min_backoff
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy { min_backoff_secs: 300, max_backoff_secs: 4000, max_queue_lifetime_secs: 432_000 }
    }

    #[test]
    fn soft_failure_defers_within_lifetime() {
        let p = policy();
        let engine = RetryEngine::new(&p);
        let arrival = SystemTime::now() - Duration::from_secs(1000);
        let status = engine.on_soft_failure(arrival, Duration::ZERO);
        assert!(matches!(status, RecipientStatus::Deferred { .. }));
    }

    #[test]
    fn soft_failure_escalates_past_lifetime() {
        let p = policy();
        let engine = RetryEngine::new(&p);
        let arrival = SystemTime::now() - Duration::from_secs(500_000);
        let status = engine.on_soft_failure(arrival, Duration::ZERO);
        assert!(matches!(status, RecipientStatus::Bounced { .. }));
    }

    #[test]
    fn delivered_reports_only_when_dsn_requested() {
        let p = policy();
        let engine = RetryEngine::new(&p);
        assert!(engine.on_delivered(true).is_some());
        assert!(engine.on_delivered(false).is_none());
    }
}
