use async_trait::async_trait;

use super::payload::{NotificationPayload, TransactionEvent};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// The destination is gone for good; it must not be attempted again.
    PermanentFailure(String),
    /// Worth another attempt after the configured backoff.
    TransientFailure(String),
}

#[async_trait]
pub trait Destination: Send + Sync {
    /// Metrics and log label.
    fn kind(&self) -> &'static str;

    async fn deliver(&self, event: &TransactionEvent, payload: &NotificationPayload)
        -> DeliveryOutcome;

    /// Whether a successful delivery acknowledges the transaction record.
    fn acknowledges(&self) -> bool {
        false
    }

    /// Recipient row to flag invalid after a permanent failure.
    fn invalidates(&self) -> Option<i64> {
        None
    }
}
