//! Hub identity for signing outbound envelopes
//!
//! Each hub has an Ed25519 keypair persisted as JSON. The identity id is
//! derived from the public key using SHA-256. Signing covers the envelope's
//! `from`, `to` and `contents`.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::signature::{EnvelopeSigner, signing_payload};
use crate::envelope::Envelope;
use crate::{Error, Result};

/// Length of identity id in hex characters (32 = 128 bits)
const IDENTITY_ID_LENGTH: usize = 32;

/// Hub signing identity stored on disk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubIdentity {
    /// Identity id (truncated SHA-256 of public key)
    pub identity_id: String,

    /// Ed25519 public key (base64 encoded)
    pub public_key: String,

    /// Ed25519 private key (base64 encoded)
    #[serde(skip_serializing_if = "Option::is_none")]
    secret_key: Option<String>,

    /// When the identity was created
    pub created_at: DateTime<Utc>,
}

impl HubIdentity {
    /// Generate a new identity with a random keypair
    #[must_use]
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let public_key_bytes = signing_key.verifying_key().to_bytes();

        Self {
            identity_id: compute_identity_id(&public_key_bytes),
            public_key: base64_encode(&public_key_bytes),
            secret_key: Some(base64_encode(signing_key.as_bytes())),
            created_at: Utc::now(),
        }
    }

    /// Load identity from a file, or create a new one if it doesn't exist
    ///
    /// # Errors
    ///
    /// Returns error if file operations fail or JSON is invalid
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = fs::read_to_string(path)?;
            let identity: Self = serde_json::from_str(&content)
                .map_err(|e| Error::Config(format!("invalid hub identity: {e}")))?;
            tracing::debug!(identity_id = %identity.identity_id, "loaded hub identity");
            return Ok(identity);
        }

        let identity = Self::generate();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(&identity)?)?;

        tracing::info!(identity_id = %identity.identity_id, "created new hub identity");
        Ok(identity)
    }

    /// Default identity file path: `<data_dir>/hearth/identity.json`
    #[must_use]
    pub fn default_path() -> PathBuf {
        directories::BaseDirs::new().map_or_else(
            || PathBuf::from(".local/share/hearth/identity.json"),
            |d| d.data_dir().join("hearth").join("identity.json"),
        )
    }

    /// Sign a payload with the identity's secret key
    ///
    /// # Errors
    ///
    /// Returns error if the identity has no usable secret key
    pub fn sign_bytes(&self, payload: &[u8]) -> Result<String> {
        let secret_key = self
            .secret_key
            .as_ref()
            .ok_or_else(|| Error::Signature("identity has no secret key".to_string()))?;

        let key_bytes = base64_decode(secret_key)?;
        let signing_key = SigningKey::try_from(key_bytes.as_slice())
            .map_err(|e| Error::Signature(format!("invalid secret key: {e}")))?;

        Ok(base64_encode(&signing_key.sign(payload).to_bytes()))
    }

    /// Verify a signature against this identity's public key
    ///
    /// # Errors
    ///
    /// Returns error if the public key or signature encoding is invalid
    pub fn verify_bytes(&self, payload: &[u8], signature: &str) -> Result<bool> {
        let public_key_bytes = base64_decode(&self.public_key)?;
        let verifying_key = VerifyingKey::try_from(public_key_bytes.as_slice())
            .map_err(|e| Error::Signature(format!("invalid public key: {e}")))?;

        let sig_bytes = base64_decode(signature)?;
        let signature = Signature::try_from(sig_bytes.as_slice())
            .map_err(|e| Error::Signature(format!("invalid signature format: {e}")))?;

        Ok(verifying_key.verify(payload, &signature).is_ok())
    }

    /// Check that an envelope was signed by this identity
    ///
    /// An unsigned envelope does not verify.
    ///
    /// # Errors
    ///
    /// Returns error if the public key or signature encoding is invalid
    pub fn verify_envelope(&self, envelope: &Envelope) -> Result<bool> {
        if envelope.signature.is_empty() {
            return Ok(false);
        }
        self.verify_bytes(&signing_payload(envelope), &envelope.signature)
    }

    /// Get the short identity id (first 8 characters)
    #[must_use]
    pub fn short_id(&self) -> &str {
        &self.identity_id[..8.min(self.identity_id.len())]
    }
}

impl EnvelopeSigner for HubIdentity {
    fn sign(&self, envelope: &Envelope) -> Result<String> {
        self.sign_bytes(&signing_payload(envelope))
    }
}

/// Compute identity id from public key bytes
fn compute_identity_id(public_key: &[u8]) -> String {
    let hash = Sha256::digest(public_key);
    hex::encode(&hash[..IDENTITY_ID_LENGTH / 2])
}

fn base64_encode(data: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(data)
}

fn base64_decode(data: &str) -> Result<Vec<u8>> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD
        .decode(data)
        .map_err(|e| Error::Signature(format!("invalid base64: {e}")))
}
