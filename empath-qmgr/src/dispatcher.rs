//! Delivery dispatcher (C7): hands a selected batch to an external
//! delivery agent and collects its ordered status stream.

use async_trait::async_trait;

use crate::error::DispatchError;

/// One recipient as handed to the delivery agent: original address, file
/// offset (echoed back in the status stream so the reporter can locate
/// the queue-file record), and the resolver's rewritten address.
#[derive(Debug, Clone)]
pub struct DispatchRecipient {
    pub offset: u64,
    pub original_address: String,
    pub rewritten_address: String,
}

/// A batch request as passed to a delivery agent.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub transport: String,
    pub nexthop: String,
    pub sender: String,
    pub recipients: Vec<DispatchRecipient>,
}

/// Per-recipient status as reported by the agent, processed in emission
/// order.
#[derive(Debug, Clone)]
pub struct DeliveryStatusRecord {
    pub offset: u64,
    pub code: u32,
    pub reason: String,
}

/// Transport-level status following the per-recipient stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportStatus {
    Ok,
    Unreachable { reason: String },
}

/// Full response to one dispatched batch.
pub struct DispatchResponse {
    pub recipient_statuses: Vec<DeliveryStatusRecord>,
    pub transport_status: TransportStatus,
}

/// External collaborator: a concrete delivery agent (SMTP, local, pipe,
/// …) reachable over whatever transport-specific channel it uses. Out of
/// scope to implement here; only the trait boundary lives in this crate.
/// No cancellation is supported once a batch is dispatched.
#[async_trait]
pub trait DeliveryAgent: Send + Sync {
    async fn dispatch(&self, request: DispatchRequest) -> Result<DispatchResponse, DispatchError>;
}

/// Thin wrapper applying a per-request I/O timeout, converting a timeout
/// into a hard transport failure for the whole batch.
pub struct Dispatcher<'a> {
    agent: &'a dyn DeliveryAgent,
    timeout: std::time::Duration,
}

impl<'a> Dispatcher<'a> {
    #[must_use]
    pub const fn new(agent: &'a dyn DeliveryAgent, timeout: std::time::Duration) -> Self {
        Self { agent, timeout }
    }

    pub async fn dispatch(&self, request: DispatchRequest) -> Result<DispatchResponse, DispatchError> {
        match tokio::time::timeout(self.timeout, self.agent.dispatch(request)).await {
            Ok(result) => result,
            Err(_elapsed) => Err(DispatchError::Timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoAgent;

    #[async_trait]
    impl DeliveryAgent for EchoAgent {
        async fn dispatch(&self, request: DispatchRequest) -> Result<DispatchResponse, DispatchError> {
            Ok(DispatchResponse {
                recipient_statuses: request
                    .recipients
                    .iter()
                    .map(|r| DeliveryStatusRecord { offset: r.offset, code: 250, reason: "ok".into() })
                    .collect(),
                transport_status: TransportStatus::Ok,
            })
        }
    }

    struct HangingAgent;

    #[async_trait]
    impl DeliveryAgent for HangingAgent {
        async fn dispatch(&self, _request: DispatchRequest) -> Result<DispatchResponse, DispatchError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn dispatch_roundtrips_status() {
        let agent = EchoAgent;
        let dispatcher = Dispatcher::new(&agent, std::time::Duration::from_secs(1));
        let response = dispatcher
            .dispatch(DispatchRequest {
                transport: "smtp".into(),
                nexthop: "mx.example.com".into(),
                sender: "a@b.com".into(),
                recipients: vec![DispatchRecipient {
                    offset: 7,
                    original_address: "c@d.com".into(),
                    rewritten_address: "c@d.com".into(),
                }],
            })
            .await
            .unwrap();
        assert_eq!(response.transport_status, TransportStatus::Ok);
        assert_eq!(response.recipient_statuses[0].offset, 7);
    }

    #[tokio::test]
    async fn timeout_becomes_dispatch_error() {
        let agent = HangingAgent;
        let dispatcher = Dispatcher::new(&agent, std::time::Duration::from_millis(10));
        let result = dispatcher
            .dispatch(DispatchRequest {
                transport: "smtp".into(),
                nexthop: "mx.example.com".into(),
                sender: "a@b.com".into(),
                recipients: vec![],
            })
            .await;
        assert!(matches!(result, Err(DispatchError::Timeout)));
    }
}
