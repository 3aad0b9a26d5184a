//! WebSocket relay transport
//!
//! Envelopes travel as JSON text frames. The hub identifies itself with an
//! `id` query parameter. Lost connections are retried with backoff until
//! the relay is closed or the retry budget runs out.

use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use url::Url;
use uuid::Uuid;

use super::retry::{RetryPolicy, delay_for_attempt};
use super::{RelayEvent, RelaySink, RelayStatus};
use crate::envelope::Envelope;
use crate::{Error, Result};

const EVENT_CAPACITY: usize = 64;
const OUTBOUND_CAPACITY: usize = 64;

type RelayStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

enum SessionEnd {
    Shutdown,
    Lost(String),
}

/// Relay connection over a WebSocket
pub struct WebSocketRelay {
    outbound: mpsc::Sender<Envelope>,
    status: Arc<RwLock<RelayStatus>>,
    shutdown: CancellationToken,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for WebSocketRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketRelay")
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

/// Relay endpoint for a hub: `<url>?id=<hub id>`
///
/// # Errors
///
/// Returns [`Error::Config`] if the URL is invalid or not `ws`/`wss`
pub fn relay_endpoint(url: &str, hub_id: Uuid) -> Result<Url> {
    let mut endpoint =
        Url::parse(url).map_err(|e| Error::Config(format!("invalid relay url '{url}': {e}")))?;

    if !matches!(endpoint.scheme(), "ws" | "wss") {
        return Err(Error::Config(format!(
            "relay url '{url}' must use ws:// or wss://"
        )));
    }

    endpoint
        .query_pairs_mut()
        .append_pair("id", &hub_id.to_string());
    Ok(endpoint)
}

impl WebSocketRelay {
    /// Start connecting in the background
    ///
    /// # Errors
    ///
    /// Returns error if the URL is invalid
    pub fn start(
        url: &str,
        hub_id: Uuid,
        policy: RetryPolicy,
    ) -> Result<(Self, mpsc::Receiver<RelayEvent>)> {
        let endpoint = relay_endpoint(url, hub_id)?;
        let (events_tx, events_rx) = mpsc::channel(EVENT_CAPACITY);
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);

        let status = Arc::new(RwLock::new(RelayStatus {
            enabled: true,
            url: Some(url.to_string()),
            ..RelayStatus::default()
        }));
        let shutdown = CancellationToken::new();

        let task = tokio::spawn(connection_loop(
            endpoint,
            policy,
            events_tx,
            outbound_rx,
            Arc::clone(&status),
            shutdown.clone(),
        ));

        let relay = Self {
            outbound: outbound_tx,
            status,
            shutdown,
            task: tokio::sync::Mutex::new(Some(task)),
        };
        Ok((relay, events_rx))
    }

    /// Current connection status
    #[must_use]
    pub fn status(&self) -> RelayStatus {
        self.status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl RelaySink for WebSocketRelay {
    async fn send(&self, envelope: Envelope) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(Error::Relay("relay closed".to_string()));
        }
        if !self.status().connected {
            return Err(Error::Relay("relay not connected".to_string()));
        }
        self.outbound
            .send(envelope)
            .await
            .map_err(|_| Error::Relay("relay closed".to_string()))
    }

    async fn close(&self) {
        self.shutdown.cancel();
        let Some(task) = self.task.lock().await.take() else {
            return;
        };
        if let Err(e) = task.await {
            tracing::warn!(error = %e, "relay task ended abnormally");
        }
    }
}

fn update_status(status: &RwLock<RelayStatus>, update: impl FnOnce(&mut RelayStatus)) {
    update(&mut status.write().unwrap_or_else(PoisonError::into_inner));
}

async fn connection_loop(
    endpoint: Url,
    policy: RetryPolicy,
    events: mpsc::Sender<RelayEvent>,
    mut outbound: mpsc::Receiver<Envelope>,
    status: Arc<RwLock<RelayStatus>>,
    shutdown: CancellationToken,
) {
    let mut failures = 0u32;

    loop {
        let connected = tokio::select! {
            () = shutdown.cancelled() => break,
            result = connect_async(endpoint.as_str()) => result,
        };

        match connected {
            Ok((stream, _)) => {
                failures = 0;
                update_status(&status, |s| {
                    s.connected = true;
                    s.reconnect_attempts = 0;
                    s.last_error = None;
                });
                tracing::info!(host = endpoint.host_str().unwrap_or_default(), "relay connected");
                let _ = events.send(RelayEvent::Connected).await;

                let end = session(stream, &events, &mut outbound, &shutdown).await;
                update_status(&status, |s| s.connected = false);

                match end {
                    SessionEnd::Shutdown => break,
                    SessionEnd::Lost(reason) => {
                        tracing::warn!(reason = %reason, "relay connection lost");
                        update_status(&status, |s| s.last_error = Some(reason.clone()));
                        let _ = events.send(RelayEvent::Disconnected { reason }).await;
                    }
                }
            }
            Err(e) => {
                failures += 1;
                tracing::warn!(error = %e, attempt = failures, "relay connection failed");
                update_status(&status, |s| {
                    s.reconnect_attempts = failures;
                    s.last_error = Some(e.to_string());
                });

                if !policy.should_retry(failures) {
                    tracing::error!(attempts = failures, "giving up on relay connection");
                    let _ = events
                        .send(RelayEvent::Disconnected {
                            reason: format!("gave up after {failures} attempts"),
                        })
                        .await;
                    break;
                }
            }
        }

        let delay = delay_for_attempt(&policy, failures.saturating_sub(1));
        tracing::debug!(delay_ms = delay.as_millis(), "waiting before relay reconnect");
        tokio::select! {
            () = shutdown.cancelled() => break,
            () = tokio::time::sleep(delay) => {}
        }
    }

    update_status(&status, |s| s.connected = false);
    tracing::info!("relay stopped");
}

async fn session(
    stream: RelayStream,
    events: &mpsc::Sender<RelayEvent>,
    outbound: &mut mpsc::Receiver<Envelope>,
    shutdown: &CancellationToken,
) -> SessionEnd {
    let (mut write, mut read) = stream.split();

    loop {
        tokio::select! {
            () = shutdown.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                return SessionEnd::Shutdown;
            }
            envelope = outbound.recv() => {
                let Some(envelope) = envelope else {
                    let _ = write.send(Message::Close(None)).await;
                    return SessionEnd::Shutdown;
                };
                let text = match serde_json::to_string(&envelope) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::error!(error = %e, "failed to serialize outbound envelope");
                        continue;
                    }
                };
                if let Err(e) = write.send(Message::text(text)).await {
                    return SessionEnd::Lost(e.to_string());
                }
            }
            message = read.next() => match message {
                Some(Ok(Message::Text(text))) => deliver(text.as_str().as_bytes(), events).await,
                Some(Ok(Message::Binary(data))) => deliver(&data, events).await,
                Some(Ok(Message::Ping(data))) => {
                    if let Err(e) = write.send(Message::Pong(data)).await {
                        return SessionEnd::Lost(e.to_string());
                    }
                }
                Some(Ok(Message::Close(_))) => {
                    return SessionEnd::Lost("closed by relay".to_string());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return SessionEnd::Lost(e.to_string()),
                None => return SessionEnd::Lost("stream ended".to_string()),
            },
        }
    }
}

async fn deliver(payload: &[u8], events: &mpsc::Sender<RelayEvent>) {
    match serde_json::from_slice::<Envelope>(payload) {
        Ok(envelope) => {
            let _ = events.send(RelayEvent::Envelope(envelope)).await;
        }
        Err(e) => tracing::warn!(error = %e, "dropping malformed relay frame"),
    }
}
