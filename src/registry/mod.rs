//! Module registry
//!
//! Maps module names to their invocation handle and broker subscription.
//! There is at most one entry per name: registering a name again tears the
//! old entry down first.
//!
//! Each entry guards its handle with an async read/write lock. A dispatch
//! holds a read guard for the whole call; teardown takes the write guard,
//! so it waits for in-flight calls before closing the handle. The wait is
//! bounded by the drain timeout: calls still running after it are stopped
//! and answer `invocation handle closed`. Calls that reach an entry after
//! teardown get a `module unavailable` response.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::broker::{Broker, SubscriptionHandle, module_topic};
use crate::envelope::{Request, Response};
use crate::error::InvocationError;
use crate::invoke::{Invoker, failure_response};
use crate::router::{Dispatch, LocalRouter};

/// How long teardown lets in-flight calls finish before stopping them
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

struct RegistryEntry {
    name: String,
    kind: &'static str,
    handle: tokio::sync::RwLock<Option<Box<dyn Invoker>>>,
    subscription: Mutex<Option<SubscriptionHandle>>,
    router: Mutex<Option<JoinHandle<()>>>,
    /// Fires when teardown gives up waiting on in-flight calls
    stop: CancellationToken,
}

impl RegistryEntry {
    async fn invoke(&self, request: Request) -> Response {
        let handle = self.handle.read().await;
        let Some(invoker) = handle.as_ref() else {
            return Response::error(
                self.name.as_str(),
                &request.method,
                format!("module unavailable: {}", self.name),
            );
        };

        let result = tokio::select! {
            () = self.stop.cancelled() => Err(InvocationError::Closed),
            result = invoker.invoke(request.clone()) => result,
        };

        match result {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(
                    module = %self.name,
                    kind = self.kind,
                    method = %request.method,
                    error = %e,
                    "invocation failed"
                );
                failure_response(&request, &e)
            }
        }
    }

    /// Unsubscribe, drain in-flight calls, close the handle, then wait for
    /// the router loop to finish
    async fn teardown(&self, drain: Duration) {
        let subscription = self
            .subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut subscription) = subscription {
            subscription.unsubscribe();
        }

        let drained = tokio::time::timeout(drain, self.handle.write()).await;
        let mut guard = if let Ok(guard) = drained {
            guard
        } else {
            tracing::warn!(
                module = %self.name,
                kind = self.kind,
                drain_ms = drain.as_millis(),
                "in-flight calls did not finish; stopping them"
            );
            self.stop.cancel();
            self.handle.write().await
        };
        let handle = guard.take();
        drop(guard);
        if let Some(handle) = handle {
            handle.close().await;
        }

        let router = self
            .router
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(router) = router else {
            return;
        };
        if let Err(e) = router.await {
            tracing::warn!(module = %self.name, error = %e, "router task ended abnormally");
        }
    }
}

/// Live set of reachable modules
pub struct ModuleRegistry {
    broker: Arc<dyn Broker>,
    router: LocalRouter,
    entries: RwLock<HashMap<String, Arc<RegistryEntry>>>,
    drain: Duration,
    /// Serializes register and unregister
    lifecycle: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("modules", &self.names())
            .finish_non_exhaustive()
    }
}

impl ModuleRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new(broker: Arc<dyn Broker>, router: LocalRouter) -> Arc<Self> {
        Self::with_drain_timeout(broker, router, DEFAULT_DRAIN_TIMEOUT)
    }

    /// Create an empty registry whose teardown waits at most `drain` for
    /// in-flight calls
    #[must_use]
    pub fn with_drain_timeout(
        broker: Arc<dyn Broker>,
        router: LocalRouter,
        drain: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            broker,
            router,
            entries: RwLock::new(HashMap::new()),
            drain,
            lifecycle: tokio::sync::Mutex::new(()),
        })
    }

    /// Install a handle and subscribe the module's topic
    ///
    /// An existing entry for `name` is torn down first.
    ///
    /// # Errors
    ///
    /// Returns error if the broker rejects the subscription; the handle is
    /// closed in that case
    pub async fn register(self: &Arc<Self>, name: &str, handle: Box<dyn Invoker>) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;

        if let Some(previous) = self.take_entry(name) {
            tracing::info!(module = name, "replacing existing registration");
            previous.teardown(self.drain).await;
        }

        let topic = module_topic(name);
        let subscription = match self.broker.subscribe(&topic) {
            Ok(subscription) => subscription,
            Err(e) => {
                handle.close().await;
                return Err(e);
            }
        };

        let kind = handle.kind();
        let entry = Arc::new(RegistryEntry {
            name: name.to_string(),
            kind,
            handle: tokio::sync::RwLock::new(Some(handle)),
            subscription: Mutex::new(Some(subscription.handle)),
            router: Mutex::new(None),
            stop: CancellationToken::new(),
        });

        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), Arc::clone(&entry));

        let dispatcher: Arc<dyn Dispatch> = Arc::clone(self) as Arc<dyn Dispatch>;
        let router = self
            .router
            .spawn(name.to_string(), subscription.messages, dispatcher);
        *entry.router.lock().unwrap_or_else(PoisonError::into_inner) = Some(router);

        tracing::info!(module = name, kind, topic = %topic, "registered module");
        Ok(())
    }

    /// Remove a module; unknown names are ignored
    pub async fn unregister(&self, name: &str) {
        let _lifecycle = self.lifecycle.lock().await;

        match self.take_entry(name) {
            Some(entry) => {
                entry.teardown(self.drain).await;
                tracing::info!(module = name, "unregistered module");
            }
            None => tracing::debug!(module = name, "unregister of unknown module ignored"),
        }
    }

    /// Remove every module
    pub async fn unregister_all(&self) {
        for name in self.names() {
            self.unregister(&name).await;
        }
    }

    /// Registered module names, sorted
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort_unstable();
        names
    }

    /// Whether a module is registered
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    /// Number of registered modules
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether no module is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entry(&self, name: &str) -> Option<Arc<RegistryEntry>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    fn take_entry(&self, name: &str) -> Option<Arc<RegistryEntry>> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
    }
}

#[async_trait]
impl Dispatch for ModuleRegistry {
    async fn dispatch(&self, module: &str, request: Request) -> Response {
        match self.entry(module) {
            Some(entry) => entry.invoke(request).await,
            None => {
                tracing::debug!(module, method = %request.method, "dispatch to unknown module");
                Response::error(module, &request.method, format!("module not found: {module}"))
            }
        }
    }
}
