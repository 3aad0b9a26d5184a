//! Hearth - home automation hub
//!
//! Bridges an encrypted WAN relay to independently addressable command
//! modules (garage doors and the like) through a local pub/sub broker.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                    WAN Relay                         │
//! │        envelopes in  │  signed replies out           │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │                 Gateway Bridge                       │
//! │   verify  │  decrypt  │  request (2s)  │  sign      │
//! └────────────────────┬────────────────────────────────┘
//!                      │  hearth.module.<name>
//! ┌────────────────────▼────────────────────────────────┐
//! │            Broker  +  Local Router                   │
//! │   decrypt │ decode │ dispatch │ encode │ encrypt    │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │                Module Registry                       │
//! │   remote (unix socket RPC)  │  local (worker task)  │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! Discovery feeds the registry; the [`lifecycle::Supervisor`] owns it all
//! and tears it down in order.

pub mod broker;
pub mod config;
pub mod discovery;
pub mod envelope;
pub mod error;
pub mod gateway;
pub mod invoke;
pub mod lifecycle;
pub mod modules;
pub mod registry;
pub mod relay;
pub mod router;
pub mod security;

pub use config::Config;
pub use envelope::{Envelope, Request, Response};
pub use error::{Error, InvocationError, Result};
pub use lifecycle::Supervisor;
pub use registry::ModuleRegistry;
pub use relay::{RelayConfig, RelayManager, RelayStatus};
