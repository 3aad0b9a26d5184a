//! JSON codec for the inner request/response records
//!
//! Decoding never panics: malformed input surfaces as [`Error::Decode`] so a
//! dispatch loop can log and drop the message. Unknown fields are ignored;
//! missing `Module` or `Method` fields are rejected.

use super::{Request, Response};
use crate::{Error, Result};

/// Decode a decrypted payload into a [`Request`]
///
/// # Errors
///
/// Returns [`Error::Decode`] on malformed JSON or missing fields
pub fn decode_request(bytes: &[u8]) -> Result<Request> {
    serde_json::from_slice(bytes).map_err(|e| Error::Decode(e.to_string()))
}

/// Encode a [`Request`] for encryption
///
/// # Errors
///
/// Returns [`Error::Encode`] if serialization fails
pub fn encode_request(request: &Request) -> Result<Vec<u8>> {
    serde_json::to_vec(request).map_err(|e| Error::Encode(e.to_string()))
}

/// Decode a decrypted payload into a [`Response`]
///
/// # Errors
///
/// Returns [`Error::Decode`] on malformed JSON or a missing `Module` field
pub fn decode_response(bytes: &[u8]) -> Result<Response> {
    serde_json::from_slice(bytes).map_err(|e| Error::Decode(e.to_string()))
}

/// Encode a [`Response`] for encryption
///
/// # Errors
///
/// Returns [`Error::Encode`] if serialization fails
pub fn encode_response(response: &Response) -> Result<Vec<u8>> {
    serde_json::to_vec(response).map_err(|e| Error::Encode(e.to_string()))
}
