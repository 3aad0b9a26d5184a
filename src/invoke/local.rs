//! In-process invocation through a worker task
//!
//! Each module gets one worker that handles one command at a time, so
//! concurrent callers are serialized. Closing the handle drops the command
//! sender: the worker finishes every queued command, then exits.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::Invoker;
use crate::envelope::{Request, Response};
use crate::error::InvocationError;
use crate::modules::Service;

/// Command queue depth per module worker
pub const LOCAL_QUEUE_CAPACITY: usize = 5;

struct Command {
    request: Request,
    reply: oneshot::Sender<Response>,
}

/// Handle to an in-process module worker
#[derive(Debug)]
pub struct LocalHandle {
    module: String,
    commands: Mutex<Option<mpsc::Sender<Command>>>,
    worker: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl LocalHandle {
    /// Spawn a worker for the service
    #[must_use]
    pub fn spawn(service: Arc<dyn Service>) -> Self {
        Self::spawn_with_capacity(service, LOCAL_QUEUE_CAPACITY)
    }

    /// Spawn a worker with a specific queue depth
    #[must_use]
    pub fn spawn_with_capacity(service: Arc<dyn Service>, capacity: usize) -> Self {
        let module = service.name().to_string();
        let (tx, mut rx) = mpsc::channel::<Command>(capacity.max(1));

        let worker_module = module.clone();
        let worker = tokio::spawn(async move {
            tracing::debug!(module = %worker_module, "local worker started");
            while let Some(command) = rx.recv().await {
                let response = service.call(command.request).await;
                if command.reply.send(response).is_err() {
                    tracing::debug!(module = %worker_module, "caller went away before reply");
                }
            }
            tracing::debug!(module = %worker_module, "local worker stopped");
        });

        Self {
            module,
            commands: Mutex::new(Some(tx)),
            worker: tokio::sync::Mutex::new(Some(worker)),
        }
    }

    /// Module served by this worker
    #[must_use]
    pub fn module(&self) -> &str {
        &self.module
    }
}

#[async_trait]
impl Invoker for LocalHandle {
    fn kind(&self) -> &'static str {
        "local"
    }

    async fn invoke(&self, request: Request) -> Result<Response, InvocationError> {
        let sender = self
            .commands
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(InvocationError::Closed)?;

        let (reply, response) = oneshot::channel();
        sender
            .send(Command { request, reply })
            .await
            .map_err(|_| InvocationError::Closed)?;
        drop(sender);

        // A dropped reply means the worker died mid-call
        response.await.map_err(|_| {
            InvocationError::Remote("module worker stopped while handling the call".to_string())
        })
    }

    async fn close(&self) {
        let sender = self
            .commands
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(sender);

        let Some(worker) = self.worker.lock().await.take() else {
            return;
        };
        if let Err(e) = worker.await {
            tracing::warn!(module = %self.module, error = %e, "local worker ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use serde_json::Value;

    use super::*;

    #[derive(Default)]
    struct Counter {
        active: AtomicUsize,
        max_active: AtomicUsize,
        handled: AtomicUsize,
    }

    #[async_trait]
    impl Service for Counter {
        fn name(&self) -> &str {
            "counter"
        }

        async fn call(&self, _request: Request) -> Response {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            let handled = self.handled.fetch_add(1, Ordering::SeqCst) + 1;
            Response::ok("counter").with("handled", handled)
        }
    }

    fn request() -> Request {
        Request::new("counter", "count", Value::Null).unwrap()
    }

    #[tokio::test]
    async fn concurrent_callers_are_serialized() {
        let service = Arc::new(Counter::default());
        let handle = Arc::new(LocalHandle::spawn(Arc::clone(&service) as Arc<dyn Service>));

        let calls: Vec<_> = (0..8)
            .map(|_| {
                let handle = Arc::clone(&handle);
                tokio::spawn(async move { handle.invoke(request()).await })
            })
            .collect();
        for call in calls {
            assert!(call.await.unwrap().unwrap().success);
        }

        assert_eq!(service.max_active.load(Ordering::SeqCst), 1);
        assert_eq!(service.handled.load(Ordering::SeqCst), 8);
    }

    #[tokio::test]
    async fn close_drains_queued_calls() {
        let service = Arc::new(Counter::default());
        let handle = Arc::new(LocalHandle::spawn(Arc::clone(&service) as Arc<dyn Service>));

        let pending: Vec<_> = (0..3)
            .map(|_| {
                let handle = Arc::clone(&handle);
                tokio::spawn(async move { handle.invoke(request()).await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(2)).await;

        handle.close().await;
        for call in pending {
            assert!(call.await.unwrap().is_ok());
        }
    }

    #[tokio::test]
    async fn invoke_after_close_fails() {
        let handle = LocalHandle::spawn(Arc::new(Counter::default()));
        handle.close().await;
        handle.close().await;

        assert_eq!(
            handle.invoke(request()).await.unwrap_err(),
            InvocationError::Closed
        );
    }
}
