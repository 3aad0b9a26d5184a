//! Error types for the Hearth hub

use thiserror::Error;

/// Result type alias for hub operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the Hearth hub
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Envelope contents could not be decrypted
    #[error("decrypt error: {0}")]
    Decrypt(String),

    /// Envelope contents could not be encrypted
    #[error("encrypt error: {0}")]
    Encrypt(String),

    /// Decrypted payload is not a valid request or response
    #[error("decode error: {0}")]
    Decode(String),

    /// Response could not be serialized
    #[error("encode error: {0}")]
    Encode(String),

    /// No registry entry for the named module
    #[error("module not found: {0}")]
    ModuleNotFound(String),

    /// Invocation of a module failed
    #[error("invocation error: {0}")]
    Invocation(#[from] InvocationError),

    /// An invocation handle could not be established for a module
    #[error("registration of '{module}' failed: {reason}")]
    Registration {
        /// Module name
        module: String,
        /// Why the handle could not be opened
        reason: String,
    },

    /// A bounded round trip did not complete in time
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Broker delivery error
    #[error("broker error: {0}")]
    Broker(String),

    /// Relay connection error
    #[error("relay error: {0}")]
    Relay(String),

    /// Envelope signing error
    #[error("signature error: {0}")]
    Signature(String),

    /// GPIO access error
    #[error("gpio error: {0}")]
    Gpio(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Failures while calling into a module through an invocation handle
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InvocationError {
    /// The connection to the module failed or was lost
    #[error("connection failed: {0}")]
    Connection(String),

    /// The module reported an error while handling the call
    #[error("module reported an error: {0}")]
    Remote(String),

    /// The module answered with something that is not a valid reply
    #[error("malformed reply: {0}")]
    MalformedReply(String),

    /// The handle was closed before or during the call
    #[error("invocation handle closed")]
    Closed,
}
