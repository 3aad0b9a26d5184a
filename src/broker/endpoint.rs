//! Broker endpoint for other local processes
//!
//! The broker lives inside the hub. Processes on the same host reach module
//! topics through a Unix socket served by [`BrokerEndpoint`], using the
//! same length-delimited JSON framing as module sockets:
//!
//! ```text
//! client ──{"id":1,"op":"request","subject":"hearth.module.x",..}──▶ endpoint
//! client ◀──{"id":1,"status":"reply","envelope":{..}}───────────────┘
//! ```
//!
//! [`BrokerClient`] is the matching client. Envelope contents stay
//! encrypted with the hub's shared key, exactly as on the relay path.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Mutex;
use tokio_util::bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::Broker;
use crate::envelope::Envelope;
use crate::invoke::rpc::{RpcFramed, bind_socket, framed, to_frame};
use crate::{Error, Result};

/// Longest request wait a client may ask for
pub const MAX_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Operation sent by a client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum EndpointOp {
    /// Fire-and-forget publish
    Publish { subject: String, envelope: Envelope },
    /// Publish and wait for one reply
    Request {
        subject: String,
        envelope: Envelope,
        timeout_ms: u64,
    },
}

/// One framed client call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointCall {
    pub id: u64,
    #[serde(flatten)]
    pub op: EndpointOp,
}

/// Result of one operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EndpointOutcome {
    /// Publish reached `count` subscribers
    Delivered { count: usize },
    /// Request answered
    Reply { envelope: Envelope },
    /// Request got no answer in time
    TimedOut { after_ms: u64 },
    /// Anything else went wrong
    Failed { message: String },
}

/// One framed endpoint answer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointReply {
    pub id: u64,
    #[serde(flatten)]
    pub outcome: EndpointOutcome,
}

/// Unix socket front for a [`Broker`]
pub struct BrokerEndpoint {
    path: PathBuf,
    listener: UnixListener,
    broker: Arc<dyn Broker>,
}

impl std::fmt::Debug for BrokerEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerEndpoint")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl BrokerEndpoint {
    /// Bind the endpoint socket
    ///
    /// # Errors
    ///
    /// Returns error if the socket cannot be bound
    pub fn bind(path: &Path, broker: Arc<dyn Broker>) -> Result<Self> {
        let listener = bind_socket(path)?;
        tracing::info!(path = %path.display(), "broker endpoint listening");
        Ok(Self {
            path: path.to_path_buf(),
            listener,
            broker,
        })
    }

    /// Socket path
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept clients until `shutdown` fires, then remove the socket
    pub async fn run(self, shutdown: CancellationToken) {
        let connections = TaskTracker::new();

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        connections.spawn(serve_client(
                            stream,
                            Arc::clone(&self.broker),
                            shutdown.clone(),
                        ));
                    }
                    Err(e) => tracing::warn!(error = %e, "failed to accept broker client"),
                },
            }
        }

        connections.close();
        connections.wait().await;

        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::debug!(path = %self.path.display(), error = %e, "endpoint socket already removed");
        }
        tracing::info!("broker endpoint closed");
    }
}

async fn serve_client(stream: UnixStream, broker: Arc<dyn Broker>, shutdown: CancellationToken) {
    let mut frames = framed(stream);
    tracing::debug!("broker client connected");

    loop {
        let frame = tokio::select! {
            () = shutdown.cancelled() => break,
            frame = frames.next() => frame,
        };

        let bytes = match frame {
            Some(Ok(bytes)) => bytes,
            Some(Err(e)) => {
                tracing::warn!(error = %e, "failed to read broker client frame");
                break;
            }
            None => break,
        };

        let reply = match serde_json::from_slice::<EndpointCall>(&bytes) {
            Ok(call) => EndpointReply {
                id: call.id,
                outcome: execute(broker.as_ref(), call.op).await,
            },
            Err(e) => EndpointReply {
                id: 0,
                outcome: EndpointOutcome::Failed {
                    message: format!("malformed call: {e}"),
                },
            },
        };

        let sent = match to_frame(&reply) {
            Ok(frame) => frames.send(frame).await.map_err(Error::from),
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            tracing::warn!(error = %e, "failed to answer broker client");
            break;
        }
    }

    tracing::debug!("broker client disconnected");
}

async fn execute(broker: &dyn Broker, op: EndpointOp) -> EndpointOutcome {
    match op {
        EndpointOp::Publish { subject, envelope } => match broker.publish(&subject, envelope).await {
            Ok(count) => EndpointOutcome::Delivered { count },
            Err(e) => EndpointOutcome::Failed {
                message: e.to_string(),
            },
        },
        EndpointOp::Request {
            subject,
            envelope,
            timeout_ms,
        } => {
            let timeout = Duration::from_millis(timeout_ms).min(MAX_REQUEST_TIMEOUT);
            tracing::debug!(subject = %subject, timeout_ms = timeout.as_millis(), "client request");
            match broker.request(&subject, envelope, timeout).await {
                Ok(envelope) => EndpointOutcome::Reply { envelope },
                Err(Error::Timeout(after)) => EndpointOutcome::TimedOut {
                    after_ms: u64::try_from(after.as_millis()).unwrap_or(u64::MAX),
                },
                Err(e) => EndpointOutcome::Failed {
                    message: e.to_string(),
                },
            }
        }
    }
}

/// Client for a [`BrokerEndpoint`]
///
/// Calls are serialized per client.
#[derive(Debug)]
pub struct BrokerClient {
    frames: Mutex<RpcFramed>,
    next_id: AtomicU64,
}

impl BrokerClient {
    /// Connect to the endpoint socket
    ///
    /// # Errors
    ///
    /// Returns [`Error::Broker`] if the socket does not accept the connection
    pub async fn connect(path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(path).await.map_err(|e| {
            Error::Broker(format!("cannot connect to broker at {}: {e}", path.display()))
        })?;
        Ok(Self {
            frames: Mutex::new(framed(stream)),
            next_id: AtomicU64::new(1),
        })
    }

    /// Publish to a subject, returning how many subscribers received it
    ///
    /// # Errors
    ///
    /// Returns error if the endpoint is unreachable or the broker refuses
    pub async fn publish(&self, subject: &str, envelope: Envelope) -> Result<usize> {
        let op = EndpointOp::Publish {
            subject: subject.to_string(),
            envelope,
        };
        match self.call(op).await? {
            EndpointOutcome::Delivered { count } => Ok(count),
            other => Err(unexpected(other)),
        }
    }

    /// Send a request and wait up to `timeout` for its reply
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] when no reply arrives in time and
    /// [`Error::Broker`] for any other failure
    pub async fn request(&self, subject: &str, envelope: Envelope, timeout: Duration) -> Result<Envelope> {
        let op = EndpointOp::Request {
            subject: subject.to_string(),
            envelope,
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        };
        match self.call(op).await? {
            EndpointOutcome::Reply { envelope } => Ok(envelope),
            EndpointOutcome::TimedOut { after_ms } => {
                Err(Error::Timeout(Duration::from_millis(after_ms)))
            }
            other => Err(unexpected(other)),
        }
    }

    /// Close the connection
    pub async fn close(&self) {
        let mut frames = self.frames.lock().await;
        if let Err(e) = SinkExt::<Bytes>::close(&mut *frames).await {
            tracing::debug!(error = %e, "error closing broker connection");
        }
    }

    async fn call(&self, op: EndpointOp) -> Result<EndpointOutcome> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = to_frame(&EndpointCall { id, op })?;

        let mut frames = self.frames.lock().await;
        frames
            .send(frame)
            .await
            .map_err(|e| Error::Broker(format!("broker connection lost: {e}")))?;

        let bytes = match frames.next().await {
            Some(Ok(bytes)) => bytes,
            Some(Err(e)) => return Err(Error::Broker(format!("broker connection lost: {e}"))),
            None => return Err(Error::Broker("broker closed the connection".to_string())),
        };

        let reply: EndpointReply = serde_json::from_slice(&bytes)?;
        if reply.id != id {
            return Err(Error::Broker(format!(
                "reply id {} does not match call id {id}",
                reply.id
            )));
        }
        Ok(reply.outcome)
    }
}

fn unexpected(outcome: EndpointOutcome) -> Error {
    match outcome {
        EndpointOutcome::Failed { message } => Error::Broker(message),
        other => Error::Broker(format!("unexpected broker answer: {other:?}")),
    }
}
