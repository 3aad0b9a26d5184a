//! In-process broker
//!
//! Each topic holds the senders of its subscriptions. Requests register a
//! one-shot inbox in a pending map; the inbox is removed when the reply
//! arrives or the wait gives up, so late replies are discarded.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use super::{
    Broker, BrokerMessage, DEFAULT_CAPACITY, INBOX_PREFIX, Subscription, SubscriptionHandle,
};
use crate::envelope::Envelope;
use crate::{Error, Result};

type TopicSenders = Vec<(u64, mpsc::Sender<BrokerMessage>)>;

#[derive(Debug, Default)]
struct Shared {
    topics: RwLock<HashMap<String, TopicSenders>>,
    /// Reply inboxes awaiting an answer, keyed by inbox subject
    pending: Mutex<HashMap<String, oneshot::Sender<Envelope>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl Shared {
    fn senders(&self, topic: &str) -> TopicSenders {
        self.topics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    fn remove_subscriber(&self, topic: &str, id: u64) {
        let mut topics = self.topics.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(senders) = topics.get_mut(topic) {
            senders.retain(|(sub_id, _)| *sub_id != id);
            if senders.is_empty() {
                topics.remove(topic);
            }
        }
    }

    /// Register a reply inbox, returning its subject and receiver
    fn prepare_request(&self) -> (String, oneshot::Receiver<Envelope>) {
        let inbox = format!("{INBOX_PREFIX}{}", Uuid::new_v4());
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(inbox.clone(), tx);
        (inbox, rx)
    }

    /// Resolve a pending inbox; returns false if nobody is waiting anymore
    fn handle_reply(&self, inbox: &str, envelope: Envelope) -> bool {
        let waiter = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(inbox);
        waiter.is_some_and(|tx| tx.send(envelope).is_ok())
    }

    fn forget_request(&self, inbox: &str) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(inbox);
    }

    async fn deliver(&self, message: BrokerMessage) -> usize {
        let mut delivered = 0;
        for (_, sender) in self.senders(&message.subject) {
            if sender.send(message.clone()).await.is_ok() {
                delivered += 1;
            }
        }
        delivered
    }
}

/// Removes a pending inbox when the requester stops waiting
struct PendingGuard<'a> {
    shared: &'a Shared,
    inbox: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.shared.forget_request(&self.inbox);
    }
}

/// Broker living inside the hub process
#[derive(Debug, Clone)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
    capacity: usize,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    /// Create a broker with the default subscription buffer
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a broker with a specific subscription buffer
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared::default()),
            capacity: capacity.max(1),
        }
    }

    /// Number of requests currently waiting for a reply
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.shared
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(Error::Broker("broker closed".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    fn subscribe(&self, topic: &str) -> Result<Subscription> {
        self.ensure_open()?;

        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.capacity);
        self.shared
            .topics
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(topic.to_string())
            .or_default()
            .push((id, tx));

        tracing::debug!(topic, id, "subscribed");

        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        let owned_topic = topic.to_string();
        let handle = SubscriptionHandle::new(topic, move || {
            if let Some(shared) = weak.upgrade() {
                shared.remove_subscriber(&owned_topic, id);
            }
        });

        Ok(Subscription {
            handle,
            messages: rx,
        })
    }

    async fn publish(&self, subject: &str, envelope: Envelope) -> Result<usize> {
        self.ensure_open()?;

        if subject.starts_with(INBOX_PREFIX) {
            if self.shared.handle_reply(subject, envelope) {
                return Ok(1);
            }
            tracing::debug!(subject, "reply arrived after requester stopped waiting");
            return Ok(0);
        }

        let delivered = self
            .shared
            .deliver(BrokerMessage {
                subject: subject.to_string(),
                reply: None,
                envelope,
            })
            .await;

        if delivered == 0 {
            tracing::debug!(subject, "published with no subscribers");
        }
        Ok(delivered)
    }

    async fn request(
        &self,
        subject: &str,
        envelope: Envelope,
        timeout: Duration,
    ) -> Result<Envelope> {
        self.ensure_open()?;

        if self.subscriber_count(subject) == 0 {
            return Err(Error::Broker(format!("no responders on {subject}")));
        }

        let (inbox, rx) = self.shared.prepare_request();
        let _guard = PendingGuard {
            shared: &self.shared,
            inbox: inbox.clone(),
        };

        let wait = async {
            let delivered = self
                .shared
                .deliver(BrokerMessage {
                    subject: subject.to_string(),
                    reply: Some(inbox),
                    envelope,
                })
                .await;
            if delivered == 0 {
                return Err(Error::Broker(format!("no responders on {subject}")));
            }
            rx.await
                .map_err(|_| Error::Broker("broker closed while waiting for reply".to_string()))
        };

        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| Error::Timeout(timeout))?
    }

    fn subscriber_count(&self, topic: &str) -> usize {
        self.shared
            .topics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(topic)
            .map_or(0, Vec::len)
    }

    async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared
            .topics
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.shared
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        tracing::info!("broker closed");
    }
}
