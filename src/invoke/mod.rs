//! Invocation handles
//!
//! A handle is the live resource used to call into one module. Two kinds
//! exist behind the same [`Invoker`] contract:
//!
//! - [`RemoteHandle`]: a procedure call over the module's local socket
//! - [`LocalHandle`]: a command channel to a worker task inside the hub
//!
//! Handles are owned by their registry entry and closed exactly once.

pub mod local;
pub mod remote;
pub mod rpc;

use async_trait::async_trait;

use crate::envelope::{Request, Response};
use crate::error::InvocationError;

pub use local::{LOCAL_QUEUE_CAPACITY, LocalHandle};
pub use remote::RemoteHandle;

/// Calls into one module
#[async_trait]
pub trait Invoker: Send + Sync + std::fmt::Debug {
    /// Short label for logs (`remote`, `local`)
    fn kind(&self) -> &'static str;

    /// Invoke a method on the module
    ///
    /// # Errors
    ///
    /// Returns [`InvocationError`] if the module cannot be reached or its
    /// reply is unusable
    async fn invoke(&self, request: Request) -> std::result::Result<Response, InvocationError>;

    /// Release the handle; later calls fail with [`InvocationError::Closed`]
    async fn close(&self);
}

/// Convert an invocation failure into a reply for the caller
#[must_use]
pub fn failure_response(request: &Request, error: &InvocationError) -> Response {
    Response::error(request.module.as_str(), &request.method, error.to_string())
}
