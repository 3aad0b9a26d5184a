//! Local publish/subscribe broker
//!
//! Modules are addressed by topic: `hearth.module.<name>`. Requests carry a
//! one-shot reply subject that the handler publishes its answer to.
//!
//! ```text
//!  bridge ──request(hearth.module.garage-doors)──▶ broker ──▶ router
//!    ▲                                               │
//!    └──────────────── _INBOX.<uuid> ◀───publish─────┘
//! ```
//!
//! Processes outside the hub publish and request through the
//! [`BrokerEndpoint`] socket.

pub mod endpoint;
pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::Result;
use crate::envelope::Envelope;

pub use endpoint::{BrokerClient, BrokerEndpoint};
pub use memory::InMemoryBroker;

/// Topic prefix for module subscriptions
pub const MODULE_PREFIX: &str = "hearth.module.";

/// Announcement topic for responses flagged `Broadcast`
pub const BROADCAST_TOPIC: &str = "hearth.broadcast";

/// Subject prefix for one-shot reply inboxes
pub const INBOX_PREFIX: &str = "_INBOX.";

/// Default per-subscription buffer
pub const DEFAULT_CAPACITY: usize = 64;

/// Topic for a module name
#[must_use]
pub fn module_topic(name: &str) -> String {
    format!("{MODULE_PREFIX}{name}")
}

/// A message delivered to a subscription
#[derive(Debug, Clone)]
pub struct BrokerMessage {
    /// Subject the message was published on
    pub subject: String,
    /// Reply subject, present for requests
    pub reply: Option<String>,
    /// Message payload
    pub envelope: Envelope,
}

/// Publish/subscribe broker with request/reply support
#[async_trait]
pub trait Broker: Send + Sync {
    /// Subscribe to a topic
    ///
    /// # Errors
    ///
    /// Returns error if the broker is closed
    fn subscribe(&self, topic: &str) -> Result<Subscription>;

    /// Publish a message, returning how many subscribers received it
    ///
    /// # Errors
    ///
    /// Returns error if the broker is closed
    async fn publish(&self, subject: &str, envelope: Envelope) -> Result<usize>;

    /// Publish a request and wait up to `timeout` for a single reply
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Timeout`] when no reply arrives in time and
    /// [`crate::Error::Broker`] when the request cannot be delivered
    async fn request(
        &self,
        subject: &str,
        envelope: Envelope,
        timeout: Duration,
    ) -> Result<Envelope>;

    /// Number of active subscriptions on a topic
    fn subscriber_count(&self, topic: &str) -> usize;

    /// Close the broker, ending every subscription stream
    async fn close(&self);
}

/// An active subscription: a handle to cancel it and the message stream
#[derive(Debug)]
pub struct Subscription {
    /// Handle that removes the subscription when unsubscribed or dropped
    pub handle: SubscriptionHandle,
    /// Messages delivered to the topic
    pub messages: mpsc::Receiver<BrokerMessage>,
}

type UnsubscribeFn = Box<dyn FnOnce() + Send + Sync>;

/// Cancels a broker subscription exactly once
///
/// Once unsubscribed, the broker drops its sender so the paired message
/// stream ends after any already-queued messages.
pub struct SubscriptionHandle {
    topic: String,
    unsubscribe: Option<UnsubscribeFn>,
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("topic", &self.topic)
            .field("active", &self.unsubscribe.is_some())
            .finish()
    }
}

impl SubscriptionHandle {
    /// Create a handle that runs `unsubscribe` when cancelled
    pub fn new(topic: impl Into<String>, unsubscribe: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            topic: topic.into(),
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }

    /// Subscribed topic
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Whether the subscription is still active
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.unsubscribe.is_some()
    }

    /// Cancel the subscription; further calls are no-ops
    pub fn unsubscribe(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
            tracing::debug!(topic = %self.topic, "unsubscribed");
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
