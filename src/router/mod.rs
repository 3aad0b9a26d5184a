//! Local router
//!
//! One router loop runs per module subscription. Each delivered message is
//! handled on its own task:
//!
//! ```text
//! Idle → Decrypting → Decoding → Dispatching → Encoding → Encrypting → Replying → Idle
//! ```
//!
//! A failure at any stage is logged and only that message is dropped.
//! Dispatch never fails: missing modules and invocation errors come back as
//! `Success:false` responses and are replied like any other.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;

use crate::Error;
use crate::broker::{BROADCAST_TOPIC, Broker, BrokerMessage};
use crate::envelope::{Envelope, Request, Response, decode_request, encode_response};
use crate::security::EnvelopeCipher;

/// Routes a decoded request to a module
#[async_trait]
pub trait Dispatch: Send + Sync {
    /// Invoke `module` with `request`; never fails, never blocks on a
    /// missing module
    async fn dispatch(&self, module: &str, request: Request) -> Response;
}

/// Processing stage of one routed message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Decrypting,
    Decoding,
    Dispatching,
    Encoding,
    Encrypting,
    Replying,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Decrypting => "decrypt",
            Self::Decoding => "decode",
            Self::Dispatching => "dispatch",
            Self::Encoding => "encode",
            Self::Encrypting => "encrypt",
            Self::Replying => "reply",
        };
        f.write_str(name)
    }
}

/// Decrypts, dispatches and replies to module topic messages
#[derive(Clone)]
pub struct LocalRouter {
    broker: Arc<dyn Broker>,
    cipher: Arc<dyn EnvelopeCipher>,
}

impl fmt::Debug for LocalRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalRouter").finish_non_exhaustive()
    }
}

impl LocalRouter {
    /// Create a router replying through `broker`
    #[must_use]
    pub fn new(broker: Arc<dyn Broker>, cipher: Arc<dyn EnvelopeCipher>) -> Self {
        Self { broker, cipher }
    }

    /// Serve a module subscription until its stream ends
    ///
    /// The returned task completes after the stream ends and every message
    /// already received has been handled.
    pub fn spawn(
        &self,
        module: String,
        mut messages: mpsc::Receiver<BrokerMessage>,
        dispatcher: Arc<dyn Dispatch>,
    ) -> JoinHandle<()> {
        let router = self.clone();

        tokio::spawn(async move {
            let in_flight = TaskTracker::new();
            tracing::debug!(module = %module, "router started");

            while let Some(message) = messages.recv().await {
                let router = router.clone();
                let dispatcher = Arc::clone(&dispatcher);
                let module = module.clone();
                in_flight.spawn(async move {
                    router.handle(&module, message, dispatcher.as_ref()).await;
                });
            }

            in_flight.close();
            in_flight.wait().await;
            tracing::debug!(module = %module, "router stopped");
        })
    }

    /// Handle one message; failures are logged, never returned
    pub async fn handle(&self, module: &str, message: BrokerMessage, dispatcher: &dyn Dispatch) {
        if let Err((stage, error)) = self.process(module, message, dispatcher).await {
            tracing::warn!(module, stage = %stage, error = %error, "dropped module message");
        }
    }

    async fn process(
        &self,
        module: &str,
        message: BrokerMessage,
        dispatcher: &dyn Dispatch,
    ) -> Result<(), (Stage, Error)> {
        let BrokerMessage {
            subject,
            reply,
            envelope,
        } = message;

        let plaintext = self
            .cipher
            .decrypt(&envelope.contents)
            .map_err(|e| (Stage::Decrypting, e))?;
        let request = decode_request(&plaintext).map_err(|e| (Stage::Decoding, e))?;

        tracing::debug!(module, subject = %subject, method = %request.method, "dispatching");
        let response = dispatcher.dispatch(module, request).await;

        let payload = encode_response(&response).map_err(|e| (Stage::Encoding, e))?;
        let contents = self
            .cipher
            .encrypt(&payload)
            .map_err(|e| (Stage::Encrypting, e))?;

        let outbound = Envelope {
            contents,
            signature: String::new(),
            ..envelope
        };

        if response.broadcast {
            self.broker
                .publish(BROADCAST_TOPIC, outbound.clone())
                .await
                .map_err(|e| (Stage::Replying, e))?;
        }

        match reply {
            Some(reply) => {
                self.broker
                    .publish(&reply, outbound)
                    .await
                    .map_err(|e| (Stage::Replying, e))?;
            }
            None => {
                tracing::debug!(module, "message had no reply subject; response not sent");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use uuid::Uuid;

    use super::*;
    use crate::broker::{InMemoryBroker, SubscriptionHandle, module_topic};
    use crate::envelope::{decode_response, encode_request};
    use crate::security::SharedKeyCipher;

    struct Fixed {
        broadcast: bool,
    }

    #[async_trait]
    impl Dispatch for Fixed {
        async fn dispatch(&self, module: &str, request: Request) -> Response {
            let mut response = Response::ok(module).with("method", request.method);
            response.broadcast = self.broadcast;
            response
        }
    }

    fn setup(broadcast: bool) -> (Arc<InMemoryBroker>, Arc<SharedKeyCipher>, SubscriptionHandle) {
        let broker = Arc::new(InMemoryBroker::new());
        let cipher = Arc::new(SharedKeyCipher::generate());
        let router = LocalRouter::new(
            Arc::clone(&broker) as Arc<dyn Broker>,
            Arc::clone(&cipher) as Arc<dyn EnvelopeCipher>,
        );
        let subscription = broker.subscribe(&module_topic("lights")).unwrap();
        router.spawn(
            "lights".to_string(),
            subscription.messages,
            Arc::new(Fixed { broadcast }),
        );
        (broker, cipher, subscription.handle)
    }

    fn sealed_request(cipher: &SharedKeyCipher, method: &str) -> Envelope {
        let request = Request::new("lights", method, json!({})).unwrap();
        let contents = cipher.encrypt(&encode_request(&request).unwrap()).unwrap();
        Envelope::new(Uuid::new_v4(), Uuid::new_v4(), contents)
    }

    #[tokio::test]
    async fn replies_with_encrypted_response() {
        let (broker, cipher, _subscription) = setup(false);
        let inbound = sealed_request(&cipher, "toggle");

        let reply = broker
            .request(&module_topic("lights"), inbound.clone(), Duration::from_secs(2))
            .await
            .unwrap();

        let response = decode_response(&cipher.decrypt(&reply.contents).unwrap()).unwrap();
        assert!(response.success);
        assert_eq!(response.data["method"], "toggle");
        assert_eq!(reply.from, inbound.from);
        assert!(reply.signature.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn undecryptable_message_gets_no_reply() {
        let (broker, _, _subscription) = setup(false);
        let other = SharedKeyCipher::generate();

        let err = broker
            .request(
                &module_topic("lights"),
                sealed_request(&other, "toggle"),
                Duration::from_secs(2),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[tokio::test]
    async fn broadcast_responses_are_announced() {
        let (broker, cipher, _subscription) = setup(true);
        let mut announcements = broker.subscribe(BROADCAST_TOPIC).unwrap();

        broker
            .request(
                &module_topic("lights"),
                sealed_request(&cipher, "toggle"),
                Duration::from_secs(2),
            )
            .await
            .unwrap();

        let announced = announcements.messages.recv().await.unwrap();
        let response = decode_response(&cipher.decrypt(&announced.envelope.contents).unwrap()).unwrap();
        assert!(response.broadcast);
    }

    #[test]
    fn stage_names_are_short() {
        assert_eq!(Stage::Decrypting.to_string(), "decrypt");
        assert_eq!(Stage::Replying.to_string(), "reply");
    }
}
