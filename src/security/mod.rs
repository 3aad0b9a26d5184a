//! Envelope encryption and signing

pub mod cipher;
pub mod identity;
pub mod signature;

pub use cipher::{EnvelopeCipher, SharedKeyCipher, write_key_file};
pub use identity::HubIdentity;
pub use signature::{EnvelopeSigner, Unsigned, signing_payload};
