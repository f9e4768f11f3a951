//! In-memory [`Delivery`] used by the HTTP transport.
//!
//! Every message sent to an address is kept in order until the client
//! collects it with `GET /api/v1/jobs/{job_id}/messages`.

use crate::delivery::Delivery;
use crate::error::DeliveryError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Message {
    pub text: String,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct Mailbox {
    boxes: Mutex<HashMap<String, Vec<Message>>>,
}

impl Mailbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `address` so it reads as known before its first message arrives.
    pub fn open(&self, address: &str) {
        self.lock().entry(address.to_string()).or_default();
    }

    /// Messages for `address` in delivery order; `None` for an unknown address.
    pub fn messages(&self, address: &str) -> Option<Vec<Message>> {
        self.lock().get(address).cloned()
    }

    /// Number of known addresses.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<Message>>> {
        match self.boxes.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl Delivery for Mailbox {
    async fn send(&self, reply_to: &str, text: &str) -> Result<(), DeliveryError> {
        debug!(reply_to, chars = text.chars().count(), "Message stored");
        self.lock()
            .entry(reply_to.to_string())
            .or_default()
            .push(Message {
                text: text.to_string(),
                sent_at: Utc::now(),
            });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_messages_kept_in_order_per_address() {
        let mailbox = Mailbox::new();
        mailbox.send("a", "first").await.unwrap();
        mailbox.send("b", "other").await.unwrap();
        mailbox.send("a", "second").await.unwrap();

        let texts: Vec<String> = mailbox
            .messages("a")
            .unwrap()
            .into_iter()
            .map(|m| m.text)
            .collect();
        assert_eq!(texts, vec!["first", "second"]);
        assert_eq!(mailbox.len(), 2);
    }

    #[test]
    fn test_unknown_address() {
        let mailbox = Mailbox::new();
        assert!(mailbox.messages("nobody").is_none());
        assert!(mailbox.is_empty());
    }

    #[test]
    fn test_opened_address_is_known_but_empty() {
        let mailbox = Mailbox::new();
        mailbox.open("job-1");
        assert_eq!(mailbox.messages("job-1"), Some(Vec::new()));
    }
}
