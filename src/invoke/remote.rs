//! Out-of-process invocation over a module socket

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tokio_util::bytes::Bytes;

use super::Invoker;
use super::rpc::{RpcCall, RpcFramed, RpcReply, framed, to_frame};
use crate::envelope::{Request, Response};
use crate::error::InvocationError;
use crate::{Error, Result};

#[derive(Debug)]
enum Connection {
    Open(RpcFramed),
    Broken(String),
    Closed,
}

/// Connection to a module process listening on a local socket
///
/// Calls are serialized per handle: a call holds the connection until its
/// reply has been read.
#[derive(Debug)]
pub struct RemoteHandle {
    module: String,
    socket: PathBuf,
    connection: Mutex<Connection>,
    next_id: AtomicU64,
}

impl RemoteHandle {
    /// Connect to a module socket
    ///
    /// # Errors
    ///
    /// Returns [`Error::Registration`] if the socket does not accept the
    /// connection
    pub async fn connect(module: impl Into<String>, socket: &Path) -> Result<Self> {
        let module = module.into();
        let stream = UnixStream::connect(socket)
            .await
            .map_err(|e| Error::Registration {
                module: module.clone(),
                reason: format!("cannot connect to {}: {e}", socket.display()),
            })?;

        tracing::debug!(module = %module, socket = %socket.display(), "connected to module socket");

        Ok(Self {
            module,
            socket: socket.to_path_buf(),
            connection: Mutex::new(Connection::Open(framed(stream))),
            next_id: AtomicU64::new(1),
        })
    }

    /// Socket this handle is connected to
    #[must_use]
    pub fn socket(&self) -> &Path {
        &self.socket
    }

    async fn round_trip(
        frames: &mut RpcFramed,
        call: &RpcCall,
    ) -> std::result::Result<Response, InvocationError> {
        let frame = to_frame(call).map_err(|e| InvocationError::Connection(e.to_string()))?;
        frames
            .send(frame)
            .await
            .map_err(|e| InvocationError::Connection(e.to_string()))?;

        let bytes = match frames.next().await {
            Some(Ok(bytes)) => bytes,
            Some(Err(e)) => return Err(InvocationError::Connection(e.to_string())),
            None => {
                return Err(InvocationError::Connection(
                    "module closed the connection".to_string(),
                ));
            }
        };

        let reply: RpcReply = serde_json::from_slice(&bytes)
            .map_err(|e| InvocationError::MalformedReply(e.to_string()))?;

        if reply.id != call.id {
            return Err(InvocationError::MalformedReply(format!(
                "reply id {} does not match call id {}",
                reply.id, call.id
            )));
        }

        match (reply.result, reply.error) {
            (_, Some(error)) => Err(InvocationError::Remote(error)),
            (Some(response), None) => Ok(response),
            (None, None) => Err(InvocationError::MalformedReply(
                "reply carries neither result nor error".to_string(),
            )),
        }
    }
}

#[async_trait]
impl Invoker for RemoteHandle {
    fn kind(&self) -> &'static str {
        "remote"
    }

    async fn invoke(&self, request: Request) -> std::result::Result<Response, InvocationError> {
        let mut connection = self.connection.lock().await;

        let frames = match &mut *connection {
            Connection::Open(frames) => frames,
            Connection::Broken(reason) => return Err(InvocationError::Connection(reason.clone())),
            Connection::Closed => return Err(InvocationError::Closed),
        };

        let call = RpcCall {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method: format!("{}.{}", self.module, request.method),
            params: request,
        };

        let result = Self::round_trip(frames, &call).await;

        // Framing is lost once a transport error happens mid-call
        if let Err(InvocationError::Connection(reason)) = &result {
            tracing::warn!(module = %self.module, reason = %reason, "module connection lost");
            *connection = Connection::Broken(reason.clone());
        }
        result
    }

    async fn close(&self) {
        let previous = std::mem::replace(&mut *self.connection.lock().await, Connection::Closed);
        let Connection::Open(mut frames) = previous else {
            return;
        };
        if let Err(e) = SinkExt::<Bytes>::close(&mut frames).await {
            tracing::debug!(module = %self.module, error = %e, "error closing module socket");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_to_missing_socket_is_registration_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = RemoteHandle::connect("garage-doors", &dir.path().join("garage-doors"))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Registration { ref module, .. } if module == "garage-doors"));
    }
}
