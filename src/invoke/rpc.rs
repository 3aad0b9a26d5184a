//! Procedure calls over a module's local socket
//!
//! Frames are length-delimited JSON. A call names its target as
//! `<Module>.<Method>` and carries the full [`Request`]; the reply carries
//! either the module's [`Response`] or an error string.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::bytes::Bytes;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::envelope::{Request, Response};
use crate::modules::Service;
use crate::{Error, Result};

/// Socket file mode; modules and hub may run as different users
pub const SOCKET_MODE: u32 = 0o666;

/// Frame transport over a module socket
pub type RpcFramed = Framed<UnixStream, LengthDelimitedCodec>;

/// One procedure call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcCall {
    /// Correlates the reply on this connection
    pub id: u64,
    /// `<Module>.<Method>`
    pub method: String,
    /// Request passed to the method
    pub params: Request,
}

/// Answer to one procedure call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcReply {
    /// Id of the call being answered
    pub id: u64,
    /// Module response when the call ran
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Response>,
    /// Failure description when it did not
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RpcReply {
    fn ok(id: u64, response: Response) -> Self {
        Self {
            id,
            result: Some(response),
            error: None,
        }
    }

    fn err(id: u64, error: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(error.into()),
        }
    }
}

/// Wrap a socket in the frame codec
#[must_use]
pub fn framed(stream: UnixStream) -> RpcFramed {
    Framed::new(stream, LengthDelimitedCodec::new())
}

/// Serialize a message into one frame
///
/// # Errors
///
/// Returns error if serialization fails
pub fn to_frame<T: Serialize>(message: &T) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(message)?))
}

/// Split `<Module>.<Method>` at the last dot
///
/// Method names never contain a dot; module names may.
#[must_use]
pub fn split_method(qualified: &str) -> Option<(&str, &str)> {
    qualified
        .rsplit_once('.')
        .filter(|(module, method)| !module.is_empty() && !method.is_empty())
}

/// Socket path for a module inside the socket directory
#[must_use]
pub fn socket_path(socket_dir: &Path, module: &str) -> PathBuf {
    socket_dir.join(module)
}

/// Bind a local socket, replacing a stale socket file at `path`
///
/// # Errors
///
/// Returns error if the socket cannot be bound or its mode cannot be set
pub fn bind_socket(path: &Path) -> Result<UnixListener> {
    if path.exists() {
        std::fs::remove_file(path).map_err(|e| {
            Error::Config(format!(
                "failed to remove stale socket '{}': {e}",
                path.display()
            ))
        })?;
    }

    let listener = UnixListener::bind(path).map_err(|e| {
        Error::Config(format!("failed to bind socket '{}': {e}", path.display()))
    })?;

    std::fs::set_permissions(path, std::fs::Permissions::from_mode(SOCKET_MODE)).map_err(|e| {
        Error::Config(format!(
            "failed to set socket permissions on '{}': {e}",
            path.display()
        ))
    })?;

    Ok(listener)
}

/// Serve a module on a local socket until cancelled
///
/// A stale socket at `path` is removed first. The socket file is removed
/// again on shutdown.
///
/// # Errors
///
/// Returns error if the socket cannot be bound or its mode cannot be set
pub async fn serve(
    path: &Path,
    service: Arc<dyn Service>,
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = bind_socket(path)?;
    tracing::info!(module = %service.name(), path = %path.display(), "module listening on socket");

    let connections = TaskTracker::new();
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let service = Arc::clone(&service);
                    let shutdown = shutdown.clone();
                    connections.spawn(serve_connection(stream, service, shutdown));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to accept module connection");
                }
            },
        }
    }

    connections.close();
    connections.wait().await;

    if let Err(e) = std::fs::remove_file(path) {
        tracing::debug!(path = %path.display(), error = %e, "socket already removed");
    }
    tracing::info!(module = %service.name(), "module socket closed");
    Ok(())
}

async fn serve_connection(stream: UnixStream, service: Arc<dyn Service>, shutdown: CancellationToken) {
    let mut frames = framed(stream);
    tracing::debug!(module = %service.name(), "hub connected");

    loop {
        let frame = tokio::select! {
            () = shutdown.cancelled() => break,
            frame = frames.next() => frame,
        };

        let bytes = match frame {
            Some(Ok(bytes)) => bytes,
            Some(Err(e)) => {
                tracing::warn!(error = %e, "failed to read call frame");
                break;
            }
            None => break,
        };

        let reply = match serde_json::from_slice::<RpcCall>(&bytes) {
            Ok(call) => handle_call(call, &service).await,
            Err(e) => RpcReply::err(0, format!("malformed call: {e}")),
        };

        let sent = match to_frame(&reply) {
            Ok(frame) => frames.send(frame).await.map_err(Error::from),
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            tracing::warn!(error = %e, "failed to send reply");
            break;
        }
    }

    tracing::debug!(module = %service.name(), "hub disconnected");
}

async fn handle_call(call: RpcCall, service: &Arc<dyn Service>) -> RpcReply {
    let Some((module, method)) = split_method(&call.method) else {
        return RpcReply::err(call.id, format!("malformed method name '{}'", call.method));
    };

    if !module.eq_ignore_ascii_case(service.name()) {
        return RpcReply::err(call.id, format!("can't find service {module}"));
    }

    let mut request = call.params;
    request.method = method.to_string();

    // Run on its own task so a panicking handler becomes an error reply
    let service = Arc::clone(service);
    match tokio::spawn(async move { service.call(request).await }).await {
        Ok(response) => RpcReply::ok(call.id, response),
        Err(e) => {
            tracing::error!(method = %call.method, error = %e, "module handler failed");
            RpcReply::err(call.id, format!("module handler failed: {e}"))
        }
    }
}
