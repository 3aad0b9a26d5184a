//! WAN gateway bridge
//!
//! Carries relay envelopes onto the local broker and back:
//!
//! ```text
//! relay ──▶ verify ──▶ decrypt ──▶ decode ──▶ request(hearth.module.<name>, 2s)
//!                                                     │
//! relay ◀── send ◀── sign ◀── swap to/from ◀──────────┘
//! ```
//!
//! A round trip that times out or cannot be delivered is logged and
//! dropped: the remote sender gets no reply.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::broker::{Broker, module_topic};
use crate::envelope::{Envelope, decode_request};
use crate::relay::{RelayEvent, RelaySink};
use crate::security::{EnvelopeCipher, EnvelopeSigner};
use crate::{Error, Result};

/// Upper bound on one relay round trip through the local broker
pub const WAN_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// Bridges the relay connection to module topics
pub struct GatewayBridge {
    broker: Arc<dyn Broker>,
    cipher: Arc<dyn EnvelopeCipher>,
    signer: Arc<dyn EnvelopeSigner>,
    sink: Arc<dyn RelaySink>,
}

impl std::fmt::Debug for GatewayBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayBridge").finish_non_exhaustive()
    }
}

impl GatewayBridge {
    /// Create a bridge sending replies through `sink`
    #[must_use]
    pub fn new(
        broker: Arc<dyn Broker>,
        cipher: Arc<dyn EnvelopeCipher>,
        signer: Arc<dyn EnvelopeSigner>,
        sink: Arc<dyn RelaySink>,
    ) -> Self {
        Self {
            broker,
            cipher,
            signer,
            sink,
        }
    }

    /// Consume relay events until the stream ends or `shutdown` fires
    ///
    /// Each envelope is forwarded on its own task. On exit the task waits
    /// for forwards already in progress.
    pub fn spawn(
        self: Arc<Self>,
        mut events: mpsc::Receiver<RelayEvent>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let in_flight = TaskTracker::new();

            loop {
                let event = tokio::select! {
                    () = shutdown.cancelled() => break,
                    event = events.recv() => event,
                };

                match event {
                    Some(RelayEvent::Connected) => tracing::info!("gateway bridge online"),
                    Some(RelayEvent::Disconnected { reason }) => {
                        tracing::warn!(reason = %reason, "relay connection lost; waiting for reconnect");
                    }
                    Some(RelayEvent::Envelope(envelope)) => {
                        let bridge = Arc::clone(&self);
                        in_flight.spawn(async move { bridge.handle(envelope).await });
                    }
                    None => break,
                }
            }

            in_flight.close();
            in_flight.wait().await;
            tracing::debug!("gateway bridge stopped");
        })
    }

    /// Forward one envelope, logging any failure
    pub async fn handle(&self, inbound: Envelope) {
        let from = inbound.from;
        match self.forward(inbound).await {
            Ok(reply) => tracing::debug!(to = %reply.to, "relayed reply"),
            Err(Error::Timeout(after)) => {
                tracing::warn!(from = %from, timeout_ms = after.as_millis(), "module round trip timed out; no reply sent");
            }
            Err(e) => tracing::warn!(from = %from, error = %e, "dropped relay envelope"),
        }
    }

    /// Forward one envelope and return the reply that was sent
    ///
    /// # Errors
    ///
    /// Returns error if the envelope is rejected, cannot be decrypted or
    /// decoded, the round trip fails or times out, or the reply cannot be
    /// signed or sent
    pub async fn forward(&self, inbound: Envelope) -> Result<Envelope> {
        if !self.signer.verify(&inbound) {
            return Err(Error::Signature("inbound signature rejected".to_string()));
        }

        let plaintext = self.cipher.decrypt(&inbound.contents)?;
        let request = decode_request(&plaintext)?;
        let topic = module_topic(&request.module);

        tracing::debug!(from = %inbound.from, module = %request.module, method = %request.method, "forwarding relay request");

        let reply = self
            .broker
            .request(&topic, inbound.clone(), WAN_REQUEST_TIMEOUT)
            .await?;

        // Contents were encrypted by the module's router; only the
        // addressing and signature change here
        let mut outbound = inbound.reply_with(reply.contents);
        outbound.signature = self.signer.sign(&outbound)?;

        self.sink.send(outbound.clone()).await?;
        Ok(outbound)
    }
}
