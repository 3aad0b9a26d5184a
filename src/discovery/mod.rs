//! Module discovery
//!
//! Discovery turns "a module appeared" and "a module went away" into a
//! stream of [`DiscoveryEvent`]s that drive registry `register` and
//! `unregister`. Two sources exist:
//!
//! - [`SocketDirSource`]: watches the socket directory; sockets coming and
//!   going become `Added`/`Removed`
//! - [`StaticSource`]: one `Added` per configured module at startup
//!
//! A [`HandleFactory`] opens the invocation handle for an added module.

pub mod socket_dir;
pub mod static_source;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::invoke::rpc::socket_path;
use crate::invoke::{Invoker, LocalHandle, RemoteHandle};
use crate::modules::Service;
use crate::registry::ModuleRegistry;
use crate::{Error, Result};

pub use socket_dir::SocketDirSource;
pub use static_source::StaticSource;

/// Buffer between a discovery source and the registry driver
pub const EVENT_CAPACITY: usize = 32;

/// A module became reachable or unreachable
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    /// Module is available under this name
    Added(String),
    /// Module with this name is gone
    Removed(String),
}

/// Produces discovery events until cancelled or exhausted
#[async_trait]
pub trait DiscoverySource: Send {
    /// Short label for logs
    fn label(&self) -> &'static str;

    /// Emit events into `events`
    ///
    /// # Errors
    ///
    /// Returns error if the source cannot start
    async fn run(
        self: Box<Self>,
        events: mpsc::Sender<DiscoveryEvent>,
        shutdown: CancellationToken,
    ) -> Result<()>;
}

/// Opens invocation handles for discovered modules
#[async_trait]
pub trait HandleFactory: Send + Sync {
    /// Open a handle for `name`
    ///
    /// # Errors
    ///
    /// Returns [`Error::Registration`] if no handle can be established
    async fn open(&self, name: &str) -> Result<Box<dyn Invoker>>;
}

/// Connects to module sockets in a directory
#[derive(Debug, Clone)]
pub struct SocketHandleFactory {
    socket_dir: PathBuf,
    attempts: u32,
    retry_delay: Duration,
}

impl SocketHandleFactory {
    /// Factory for sockets under `socket_dir`
    #[must_use]
    pub fn new(socket_dir: impl Into<PathBuf>) -> Self {
        Self {
            socket_dir: socket_dir.into(),
            attempts: 3,
            retry_delay: Duration::from_millis(100),
        }
    }
}

#[async_trait]
impl HandleFactory for SocketHandleFactory {
    async fn open(&self, name: &str) -> Result<Box<dyn Invoker>> {
        let path = socket_path(&self.socket_dir, name);

        // A socket file can appear a moment before its listener accepts
        let mut attempt = 1;
        loop {
            match RemoteHandle::connect(name, &path).await {
                Ok(handle) => return Ok(Box::new(handle)),
                Err(e) if attempt >= self.attempts => return Err(e),
                Err(e) => {
                    tracing::debug!(module = name, attempt, error = %e, "module socket not ready");
                    attempt += 1;
                    tokio::time::sleep(self.retry_delay).await;
                }
            }
        }
    }
}

/// Spawns in-process workers for configured services
#[derive(Clone, Default)]
pub struct InProcessHandleFactory {
    services: HashMap<String, Arc<dyn Service>>,
}

impl std::fmt::Debug for InProcessHandleFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.services.keys().collect();
        names.sort_unstable();
        f.debug_struct("InProcessHandleFactory")
            .field("services", &names)
            .finish()
    }
}

impl InProcessHandleFactory {
    /// Factory over a set of services, keyed by their names
    #[must_use]
    pub fn new(services: impl IntoIterator<Item = Arc<dyn Service>>) -> Self {
        Self {
            services: services
                .into_iter()
                .map(|service| (service.name().to_string(), service))
                .collect(),
        }
    }

    /// Names of the services this factory can start, sorted
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.keys().cloned().collect();
        names.sort_unstable();
        names
    }
}

#[async_trait]
impl HandleFactory for InProcessHandleFactory {
    async fn open(&self, name: &str) -> Result<Box<dyn Invoker>> {
        let service = self
            .services
            .get(name)
            .ok_or_else(|| Error::Registration {
                module: name.to_string(),
                reason: "no in-process service with this name".to_string(),
            })?;
        Ok(Box::new(LocalHandle::spawn(Arc::clone(service))))
    }
}

/// Apply discovery events to the registry until the stream ends or
/// `shutdown` fires
///
/// Registration failures are logged; the module stays unregistered.
pub async fn drive_registry(
    mut events: mpsc::Receiver<DiscoveryEvent>,
    registry: Arc<ModuleRegistry>,
    factory: Arc<dyn HandleFactory>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            () = shutdown.cancelled() => break,
            event = events.recv() => event,
        };

        match event {
            Some(DiscoveryEvent::Added(name)) => match factory.open(&name).await {
                Ok(handle) => {
                    if let Err(e) = registry.register(&name, handle).await {
                        tracing::error!(module = %name, error = %e, "module registration failed");
                    }
                }
                Err(e) => tracing::error!(module = %name, error = %e, "module registration failed"),
            },
            Some(DiscoveryEvent::Removed(name)) => registry.unregister(&name).await,
            None => break,
        }
    }
    tracing::debug!("discovery driver stopped");
}
