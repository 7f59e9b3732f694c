//! Error taxonomy for the queue manager engine.
//!
//! Errors are grouped by failure domain rather than by call site, mirroring
//! `empath_common::error`'s layering: each variant carries whatever detail
//! the corresponding scheduling reaction needs, and lower-level collaborator
//! errors convert in via `#[from]` so call sites can use `?`.

use std::io;

use thiserror::Error;

/// Top-level error produced by engine operations.
#[derive(Debug, Error)]
pub enum QmgrError {
    /// A queue file failed to parse; the caller should move it to the
    /// corrupt queue and continue.
    #[error("corrupt queue file {path}: {reason}")]
    Corruption { path: String, reason: String },

    /// The address resolver failed or timed out for a recipient.
    #[error("resolver failure for {recipient}: {0}")]
    Resolver { recipient: String, source: ResolverError },

    /// A delivery-agent batch could not be dispatched at all (as opposed to
    /// a per-recipient failure reported within a batch).
    #[error("dispatch failure: {0}")]
    Delivery(#[from] DispatchError),

    /// A destination is unreachable; it should be marked dead.
    #[error("destination {nexthop} unreachable: {reason}")]
    Destination { nexthop: String, reason: String },

    /// A transport cannot spawn a delivery agent at all.
    #[error("transport {transport} unreachable: {reason}")]
    Transport { transport: String, reason: String },

    /// The configuration/table backing this engine changed; the process
    /// should exit cleanly and let the process manager restart it.
    #[error("configuration changed, restart required")]
    ConfigurationChanged,

    /// A programmer invariant was violated. Fatal: log and abort.
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// I/O error not otherwise classified above.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Failure reported by the external resolver collaborator.
#[derive(Debug, Error)]
pub enum ResolverError {
    #[error("transient lookup failure")]
    Transient,
    #[error("no such user")]
    NoSuchUser,
    #[error("recipient relocated to {0}")]
    Relocated(String),
    #[error("resolver I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Failure reported by the external delivery-agent collaborator for an
/// entire batch (as opposed to a single recipient within the batch).
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("could not connect to delivery agent for transport {transport}")]
    AgentUnavailable { transport: String },
    #[error("delivery agent I/O timed out")]
    Timeout,
    #[error("delivery agent protocol error: {0}")]
    Protocol(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Outcome of a single recipient's delivery attempt, as reported by the
/// delivery agent within a batch response stream. Not an `Error` itself
/// (a soft/hard failure is an expected outcome, not a bug) but classified
/// the same way spec error kinds 3 and 4 are.
#[derive(Debug, Clone)]
pub enum RecipientOutcome {
    Delivered,
    SoftFailed { reason: String },
    HardFailed { reason: String },
}

impl RecipientOutcome {
    #[must_use]
    pub const fn is_terminal_success(&self) -> bool {
        matches!(self, Self::Delivered)
    }

    #[must_use]
    pub const fn is_soft(&self) -> bool {
        matches!(self, Self::SoftFailed { .. })
    }

    #[must_use]
    pub const fn is_hard(&self) -> bool {
        matches!(self, Self::HardFailed { .. })
    }
}

impl QmgrError {
    /// Returns `true` if this error should terminate the process (error
    /// kinds 7 and 8 from the error handling design).
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::ConfigurationChanged | Self::Invariant(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification() {
        assert!(QmgrError::ConfigurationChanged.is_fatal());
        assert!(QmgrError::Invariant("bad state".into()).is_fatal());
        assert!(!QmgrError::Destination {
            nexthop: "mx1".into(),
            reason: "refused".into()
        }
        .is_fatal());
    }

    #[test]
    fn recipient_outcome_classification() {
        assert!(RecipientOutcome::Delivered.is_terminal_success());
        assert!(RecipientOutcome::SoftFailed { reason: "4xx".into() }.is_soft());
        assert!(RecipientOutcome::HardFailed { reason: "5xx".into() }.is_hard());
    }
}
