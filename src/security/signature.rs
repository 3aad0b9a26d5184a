//! Envelope signature hook

use crate::Result;
use crate::envelope::Envelope;

/// Produces signatures for outbound envelopes and checks inbound ones
pub trait EnvelopeSigner: Send + Sync {
    /// Compute the signature for an outbound envelope
    ///
    /// # Errors
    ///
    /// Returns error if signing fails
    fn sign(&self, envelope: &Envelope) -> Result<String>;

    /// Check an inbound envelope's signature
    ///
    /// Sender authorization is not enforced; the default accepts everything.
    fn verify(&self, envelope: &Envelope) -> bool {
        let _ = envelope;
        true
    }
}

/// Signer that leaves envelopes unsigned
#[derive(Debug, Clone, Copy, Default)]
pub struct Unsigned;

impl EnvelopeSigner for Unsigned {
    fn sign(&self, _envelope: &Envelope) -> Result<String> {
        Ok(String::new())
    }
}

/// Bytes covered by an envelope signature: `from|to|contents`
#[must_use]
pub fn signing_payload(envelope: &Envelope) -> Vec<u8> {
    format!("{}|{}|{}", envelope.from, envelope.to, envelope.contents).into_bytes()
}
