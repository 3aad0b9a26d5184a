//! WAN relay connection
//!
//! The relay is an opaque bidirectional channel of [`Envelope`]s between the
//! hub and remote senders. Inbound envelopes and connection changes arrive
//! as [`RelayEvent`]s; replies go out through a [`RelaySink`].

pub mod retry;
pub mod websocket;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::envelope::Envelope;
use crate::{Error, Result};

pub use retry::RetryPolicy;
pub use websocket::WebSocketRelay;

/// Relay connection configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Connect to the relay
    pub enabled: bool,
    /// Relay WebSocket URL (`ws://` or `wss://`)
    pub url: Option<String>,
    /// Reconnect backoff
    pub reconnect: RetryPolicy,
}

/// Something that happened on the relay connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    /// Connection established
    Connected,
    /// Envelope received from a remote sender
    Envelope(Envelope),
    /// Connection lost
    Disconnected {
        /// Why the connection ended
        reason: String,
    },
}

/// Outbound side of the relay
#[async_trait]
pub trait RelaySink: Send + Sync {
    /// Send an envelope to the relay
    ///
    /// # Errors
    ///
    /// Returns [`Error::Relay`] if the relay is not connected or is closed
    async fn send(&self, envelope: Envelope) -> Result<()>;

    /// Close the relay connection
    async fn close(&self);
}

/// Relay status information
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RelayStatus {
    /// Whether relay is enabled
    pub enabled: bool,
    /// Relay URL if configured
    pub url: Option<String>,
    /// Whether relay is currently connected
    pub connected: bool,
    /// Consecutive failed connection attempts
    pub reconnect_attempts: u32,
    /// Last connection error
    pub last_error: Option<String>,
}

/// Owns the relay connection for the hub
pub struct RelayManager {
    config: RelayConfig,
    hub_id: Uuid,
    relay: Option<Arc<WebSocketRelay>>,
}

impl std::fmt::Debug for RelayManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayManager")
            .field("config", &self.config)
            .field("hub_id", &self.hub_id)
            .field("running", &self.relay.is_some())
            .finish()
    }
}

impl RelayManager {
    /// Create a manager for the hub's relay
    #[must_use]
    pub const fn new(config: RelayConfig, hub_id: Uuid) -> Self {
        Self {
            config,
            hub_id,
            relay: None,
        }
    }

    /// Start the relay (if enabled), returning its event stream
    ///
    /// # Errors
    ///
    /// Returns error if the relay is enabled without a valid URL
    pub fn start(&mut self) -> Result<Option<mpsc::Receiver<RelayEvent>>> {
        if !self.config.enabled {
            tracing::debug!("relay disabled, skipping start");
            return Ok(None);
        }
        if self.relay.is_some() {
            return Err(Error::Relay("relay already started".to_string()));
        }

        let url = self
            .config
            .url
            .as_deref()
            .ok_or_else(|| Error::Config("relay enabled without a url".to_string()))?;

        let (relay, events) = WebSocketRelay::start(url, self.hub_id, self.config.reconnect.clone())?;
        self.relay = Some(Arc::new(relay));
        Ok(Some(events))
    }

    /// Outbound side of the running relay
    #[must_use]
    pub fn sink(&self) -> Option<Arc<dyn RelaySink>> {
        self.relay
            .as_ref()
            .map(|relay| Arc::clone(relay) as Arc<dyn RelaySink>)
    }

    /// Stop the relay
    pub async fn stop(&mut self) {
        if let Some(relay) = self.relay.take() {
            tracing::info!("stopping relay");
            relay.close().await;
        }
    }

    /// Get current relay status
    #[must_use]
    pub fn status(&self) -> RelayStatus {
        self.relay.as_ref().map_or_else(
            || RelayStatus {
                enabled: self.config.enabled,
                url: self.config.url.clone(),
                ..RelayStatus::default()
            },
            |relay| relay.status(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_relay_does_not_start() {
        let mut manager = RelayManager::new(RelayConfig::default(), Uuid::new_v4());
        assert!(manager.start().unwrap().is_none());
        assert!(manager.sink().is_none());
        assert!(!manager.status().connected);
    }

    #[test]
    fn enabled_relay_needs_url() {
        let config = RelayConfig {
            enabled: true,
            ..RelayConfig::default()
        };
        let mut manager = RelayManager::new(config, Uuid::new_v4());
        assert!(matches!(manager.start(), Err(Error::Config(_))));
    }

    #[test]
    fn relay_config_parses_from_toml() {
        let config: RelayConfig = toml::from_str(
            r#"
            enabled = true
            url = "wss://relay.example.com/hub"

            [reconnect]
            max_retries = 5
            "#,
        )
        .unwrap();

        assert!(config.enabled);
        assert_eq!(config.reconnect.max_retries, 5);
        assert_eq!(config.reconnect.base_delay_ms, 1_000);
    }
}
