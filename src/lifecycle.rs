//! Hub lifecycle supervision
//!
//! The [`Supervisor`] owns every long-lived piece of the hub: the broker,
//! the module registry, the discovery tasks and the relay bridge. It is
//! built explicitly and handed to whoever needs it.
//!
//! Shutdown runs in a fixed order:
//!
//! 1. stop discovery so no new registrations arrive
//! 2. unregister every module (waits for in-flight calls)
//! 3. close the relay and the bridge
//! 4. close the broker endpoint, then the broker

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::broker::{Broker, BrokerEndpoint, InMemoryBroker};
use crate::config::{Config, DiscoveryMode};
use crate::discovery::{
    self, DiscoverySource, EVENT_CAPACITY, HandleFactory, InProcessHandleFactory,
    SocketDirSource, SocketHandleFactory, StaticSource,
};
use crate::gateway::GatewayBridge;
use crate::modules::build_service;
use crate::registry::{DEFAULT_DRAIN_TIMEOUT, ModuleRegistry};
use crate::relay::{RelayEvent, RelayManager, RelaySink, RelayStatus};
use crate::router::LocalRouter;
use crate::security::{EnvelopeCipher, EnvelopeSigner, HubIdentity, SharedKeyCipher};
use crate::{Error, Result};

/// Owns the hub's broker, registry, discovery and relay
pub struct Supervisor {
    broker: Arc<dyn Broker>,
    cipher: Arc<dyn EnvelopeCipher>,
    signer: Arc<dyn EnvelopeSigner>,
    registry: Arc<ModuleRegistry>,
    relay: RelayManager,
    sink: Option<Arc<dyn RelaySink>>,
    discovery_shutdown: CancellationToken,
    discovery: Vec<JoinHandle<()>>,
    bridge_shutdown: CancellationToken,
    bridge: Option<JoinHandle<()>>,
    endpoint_shutdown: CancellationToken,
    endpoint: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("registry", &self.registry)
            .field("relay", &self.relay)
            .finish_non_exhaustive()
    }
}

impl Supervisor {
    /// Assemble a supervisor from its collaborators
    #[must_use]
    pub fn new(
        broker: Arc<dyn Broker>,
        cipher: Arc<dyn EnvelopeCipher>,
        signer: Arc<dyn EnvelopeSigner>,
        relay: RelayManager,
    ) -> Self {
        Self::with_drain_timeout(broker, cipher, signer, relay, DEFAULT_DRAIN_TIMEOUT)
    }

    /// Assemble a supervisor whose module teardown waits at most `drain`
    /// for in-flight calls
    #[must_use]
    pub fn with_drain_timeout(
        broker: Arc<dyn Broker>,
        cipher: Arc<dyn EnvelopeCipher>,
        signer: Arc<dyn EnvelopeSigner>,
        relay: RelayManager,
        drain: Duration,
    ) -> Self {
        let router = LocalRouter::new(Arc::clone(&broker), Arc::clone(&cipher));
        let registry = ModuleRegistry::with_drain_timeout(Arc::clone(&broker), router, drain);

        Self {
            broker,
            cipher,
            signer,
            registry,
            relay,
            sink: None,
            discovery_shutdown: CancellationToken::new(),
            discovery: Vec::new(),
            bridge_shutdown: CancellationToken::new(),
            bridge: None,
            endpoint_shutdown: CancellationToken::new(),
            endpoint: None,
        }
    }

    /// Build a supervisor from configuration
    ///
    /// Loads the shared key and signing identity and creates the broker.
    ///
    /// # Errors
    ///
    /// Returns error if the key file or identity cannot be loaded
    pub fn from_config(config: &Config) -> Result<Self> {
        let cipher = SharedKeyCipher::load(&config.key_file)?;
        let identity = HubIdentity::load_or_create(&config.identity_file)?;
        tracing::info!(hub_id = %config.id, identity = identity.short_id(), "hub identity loaded");

        let broker = InMemoryBroker::with_capacity(config.broker.capacity);
        let relay = RelayManager::new(config.relay.clone(), config.id);

        Ok(Self::with_drain_timeout(
            Arc::new(broker),
            Arc::new(cipher),
            Arc::new(identity),
            relay,
            config.drain_timeout,
        ))
    }

    /// The module registry
    #[must_use]
    pub const fn registry(&self) -> &Arc<ModuleRegistry> {
        &self.registry
    }

    /// The local broker
    #[must_use]
    pub const fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    /// Relay connection status
    #[must_use]
    pub fn relay_status(&self) -> RelayStatus {
        self.relay.status()
    }

    /// Start feeding a discovery source into the registry
    pub fn start_discovery(
        &mut self,
        source: Box<dyn DiscoverySource>,
        factory: Arc<dyn HandleFactory>,
    ) {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CAPACITY);
        let label = source.label();
        let shutdown = self.discovery_shutdown.clone();

        tracing::info!(source = label, "starting module discovery");

        let source_shutdown = shutdown.clone();
        self.discovery.push(tokio::spawn(async move {
            if let Err(e) = source.run(events_tx, source_shutdown).await {
                tracing::error!(source = label, error = %e, "module discovery failed");
            }
        }));

        self.discovery.push(tokio::spawn(discovery::drive_registry(
            events_rx,
            Arc::clone(&self.registry),
            factory,
            shutdown,
        )));
    }

    /// Start the discovery mode named in the configuration
    ///
    /// # Errors
    ///
    /// Returns error if a statically configured module cannot be built
    pub fn start_configured_discovery(&mut self, config: &Config) -> Result<()> {
        match config.discovery.mode {
            DiscoveryMode::SocketDir => {
                let dir = &config.discovery.socket_dir;
                self.start_discovery(
                    Box::new(SocketDirSource::new(dir)),
                    Arc::new(SocketHandleFactory::new(dir)),
                );
            }
            DiscoveryMode::Static => {
                let services = config
                    .modules
                    .iter()
                    .map(build_service)
                    .collect::<Result<Vec<_>>>()?;
                let factory = InProcessHandleFactory::new(services);
                let source = StaticSource::new(factory.names());
                self.start_discovery(Box::new(source), Arc::new(factory));
            }
        }
        Ok(())
    }

    /// Serve the broker to local processes on `path`
    ///
    /// # Errors
    ///
    /// Returns error if the endpoint is already running or the socket
    /// cannot be bound
    pub fn start_broker_endpoint(&mut self, path: &Path) -> Result<()> {
        if self.endpoint.is_some() {
            return Err(Error::Broker("broker endpoint already started".to_string()));
        }
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let endpoint = BrokerEndpoint::bind(path, Arc::clone(&self.broker))?;
        self.endpoint = Some(tokio::spawn(endpoint.run(self.endpoint_shutdown.clone())));
        Ok(())
    }

    /// Connect the relay if enabled and bridge it to the broker
    ///
    /// # Errors
    ///
    /// Returns error if the relay is enabled but misconfigured
    pub fn start_relay(&mut self) -> Result<()> {
        let Some(events) = self.relay.start()? else {
            return Ok(());
        };
        let Some(sink) = self.relay.sink() else {
            return Ok(());
        };
        self.attach_relay(events, sink);
        Ok(())
    }

    /// Bridge an already established relay connection to the broker
    pub fn attach_relay(&mut self, events: mpsc::Receiver<RelayEvent>, sink: Arc<dyn RelaySink>) {
        let bridge = Arc::new(GatewayBridge::new(
            Arc::clone(&self.broker),
            Arc::clone(&self.cipher),
            Arc::clone(&self.signer),
            Arc::clone(&sink),
        ));
        self.bridge = Some(bridge.spawn(events, self.bridge_shutdown.clone()));
        self.sink = Some(sink);
    }

    /// Run until Ctrl-C, then shut down
    ///
    /// # Errors
    ///
    /// Returns error if the signal handler cannot be installed
    pub async fn run_until_signal(self) -> Result<()> {
        tracing::info!(modules = self.registry.len(), "hub running");
        let signal = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown requested");
        self.shutdown().await;
        signal?;
        Ok(())
    }

    /// Stop everything in order
    pub async fn shutdown(mut self) {
        // 1. discovery
        self.discovery_shutdown.cancel();
        for task in self.discovery.drain(..) {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "discovery task ended abnormally");
            }
        }

        // 2. modules
        self.registry.unregister_all().await;

        // 3. relay
        self.bridge_shutdown.cancel();
        if let Some(bridge) = self.bridge.take() {
            if let Err(e) = bridge.await {
                tracing::warn!(error = %e, "gateway bridge ended abnormally");
            }
        }
        if let Some(sink) = self.sink.take() {
            sink.close().await;
        }
        self.relay.stop().await;

        // 4. broker
        self.endpoint_shutdown.cancel();
        if let Some(endpoint) = self.endpoint.take() {
            if let Err(e) = endpoint.await {
                tracing::warn!(error = %e, "broker endpoint ended abnormally");
            }
        }
        self.broker.close().await;
        tracing::info!("hub stopped");
    }
}
