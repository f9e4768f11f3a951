//! Outbound side of the transport: how results get back to the submitter.

use crate::error::DeliveryError;
use async_trait::async_trait;

/// Sends one text message to a transport address.
///
/// Failures are reported but never retried by the worker.
#[async_trait]
pub trait Delivery: Send + Sync {
    async fn send(&self, reply_to: &str, text: &str) -> Result<(), DeliveryError>;
}
