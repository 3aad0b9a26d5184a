//! Wire envelope and the request/response records it carries
//!
//! An [`Envelope`] is what travels over the relay and the local broker. Its
//! `contents` are an encrypted, serialized [`Request`] on the way in and an
//! encrypted, serialized [`Response`] on the way out.

pub mod codec;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

pub use codec::{decode_request, decode_response, encode_request, encode_response};

/// Identifier of a relay endpoint (hub or remote sender)
pub type EndpointId = Uuid;

/// Outer message unit exchanged with the relay and the local broker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Sender endpoint
    pub from: EndpointId,
    /// Recipient endpoint
    pub to: EndpointId,
    /// Encrypted payload (base64 text)
    #[serde(default)]
    pub contents: String,
    /// Signature over the envelope, empty when unsigned
    #[serde(default)]
    pub signature: String,
}

impl Envelope {
    /// Create an unsigned envelope
    #[must_use]
    pub fn new(from: EndpointId, to: EndpointId, contents: String) -> Self {
        Self {
            from,
            to,
            contents,
            signature: String::new(),
        }
    }

    /// Build a reply to this envelope carrying new contents
    ///
    /// `to`/`from` are swapped and the signature is cleared; the inbound
    /// signature is never carried over.
    #[must_use]
    pub fn reply_with(&self, contents: String) -> Self {
        Self {
            from: self.to,
            to: self.from,
            contents,
            signature: String::new(),
        }
    }
}

/// A command addressed to one module method
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Request {
    /// Target module name
    pub module: String,
    /// Method to invoke on the module
    pub method: String,
    /// Method parameters, left serialized until the handler parses them
    #[serde(default)]
    pub args: Value,
}

impl Request {
    /// Create a request with arbitrary serializable arguments
    ///
    /// # Errors
    ///
    /// Returns error if the arguments cannot be serialized
    pub fn new(
        module: impl Into<String>,
        method: impl Into<String>,
        args: impl Serialize,
    ) -> crate::Result<Self> {
        Ok(Self {
            module: module.into(),
            method: method.into(),
            args: serde_json::to_value(args)?,
        })
    }

    /// Parse the arguments into a typed value
    ///
    /// A missing argument object parses as an empty one.
    ///
    /// # Errors
    ///
    /// Returns error if the arguments do not match `T`
    pub fn parse_args<T: serde::de::DeserializeOwned>(&self) -> crate::Result<T> {
        let args = if self.args.is_null() {
            Value::Object(Map::new())
        } else {
            self.args.clone()
        };
        serde_json::from_value(args).map_err(|e| crate::Error::Decode(e.to_string()))
    }
}

/// Result of a module invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Response {
    /// Module that produced the response
    pub module: String,
    /// Whether the call succeeded
    #[serde(default)]
    pub success: bool,
    /// Whether the reply should also go to the announcement topic
    #[serde(default)]
    pub broadcast: bool,
    /// Result data
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl Response {
    /// Create an empty, unsuccessful response for a module
    #[must_use]
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            success: false,
            broadcast: false,
            data: Map::new(),
        }
    }

    /// Create a successful response
    #[must_use]
    pub fn ok(module: impl Into<String>) -> Self {
        Self {
            success: true,
            ..Self::new(module)
        }
    }

    /// Create a failed response carrying the method name and a message
    #[must_use]
    pub fn error(module: impl Into<String>, method: &str, message: impl Into<String>) -> Self {
        Self::new(module)
            .with("method", method)
            .with("message", message.into())
    }

    /// Add a data entry
    #[must_use]
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.data.insert(key.to_string(), value.into());
        self
    }

    /// The `message` data entry, if present
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.data.get("message").and_then(Value::as_str)
    }
}
