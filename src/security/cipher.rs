//! Symmetric encryption of envelope contents
//!
//! Contents are `base64(nonce || ciphertext)` where the cipher is
//! XChaCha20-Poly1305 keyed with the hub's shared key and the nonce is a
//! fresh random 192-bit value per message.

use std::path::Path;

use base64::Engine as _;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use rand::RngCore;
use secrecy::{ExposeSecret, SecretBox};

use crate::{Error, Result};

/// Shared key length in bytes
pub const KEY_LEN: usize = 32;

/// XChaCha20 nonce length in bytes
const NONCE_LEN: usize = 24;

/// Poly1305 tag length in bytes
const TAG_LEN: usize = 16;

/// Encrypts and decrypts envelope contents
pub trait EnvelopeCipher: Send + Sync {
    /// Encrypt a serialized payload into envelope contents
    ///
    /// # Errors
    ///
    /// Returns [`Error::Encrypt`] if encryption fails
    fn encrypt(&self, plaintext: &[u8]) -> Result<String>;

    /// Decrypt envelope contents into the serialized payload
    ///
    /// # Errors
    ///
    /// Returns [`Error::Decrypt`] if the contents are malformed or fail authentication
    fn decrypt(&self, contents: &str) -> Result<Vec<u8>>;
}

/// XChaCha20-Poly1305 cipher keyed from the shared key file
pub struct SharedKeyCipher {
    key: SecretBox<[u8; KEY_LEN]>,
}

impl std::fmt::Debug for SharedKeyCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedKeyCipher").finish_non_exhaustive()
    }
}

impl SharedKeyCipher {
    /// Create a cipher from raw key bytes
    #[must_use]
    pub fn from_bytes(key: [u8; KEY_LEN]) -> Self {
        Self {
            key: SecretBox::new(Box::new(key)),
        }
    }

    /// Create a cipher with a random key
    #[must_use]
    pub fn generate() -> Self {
        Self::from_bytes(random_key())
    }

    /// Load the shared key from a file
    ///
    /// The file holds either the base64 encoding of the key or the raw bytes.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or does not hold a valid key
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read(path).map_err(|e| {
            Error::Config(format!("failed to read key file {}: {e}", path.display()))
        })?;
        let key = parse_key(&data)
            .map_err(|e| Error::Config(format!("invalid key file {}: {e}", path.display())))?;
        tracing::debug!(path = %path.display(), "loaded shared key");
        Ok(Self::from_bytes(key))
    }

    fn cipher(&self) -> XChaCha20Poly1305 {
        XChaCha20Poly1305::new(Key::from_slice(self.key.expose_secret()))
    }
}

impl EnvelopeCipher for SharedKeyCipher {
    fn encrypt(&self, plaintext: &[u8]) -> Result<String> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher()
            .encrypt(XNonce::from_slice(&nonce), plaintext)
            .map_err(|e| Error::Encrypt(e.to_string()))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(base64::engine::general_purpose::STANDARD.encode(sealed))
    }

    fn decrypt(&self, contents: &str) -> Result<Vec<u8>> {
        let sealed = base64::engine::general_purpose::STANDARD
            .decode(contents.trim())
            .map_err(|e| Error::Decrypt(format!("invalid base64: {e}")))?;

        if sealed.len() < NONCE_LEN + TAG_LEN {
            return Err(Error::Decrypt(format!(
                "contents too short ({} bytes)",
                sealed.len()
            )));
        }

        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        self.cipher()
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| Error::Decrypt("authentication failed".to_string()))
    }
}

/// Parse key file contents: base64 text or exactly [`KEY_LEN`] raw bytes
///
/// # Errors
///
/// Returns a description of the problem if neither form matches
pub fn parse_key(data: &[u8]) -> std::result::Result<[u8; KEY_LEN], String> {
    let decoded = std::str::from_utf8(data).ok().and_then(|text| {
        base64::engine::general_purpose::STANDARD
            .decode(text.trim())
            .ok()
    });

    let bytes = match decoded {
        Some(bytes) if bytes.len() == KEY_LEN => bytes,
        _ if data.len() == KEY_LEN => data.to_vec(),
        Some(bytes) => return Err(format!("expected {KEY_LEN} key bytes, got {}", bytes.len())),
        None => return Err("key is neither base64 nor raw bytes".to_string()),
    };

    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(&bytes);
    Ok(key)
}

/// Write a fresh base64 key to `path`, readable by the owner only
///
/// # Errors
///
/// Returns error if the file already exists or cannot be written
pub fn write_key_file(path: &Path) -> Result<()> {
    if path.exists() {
        return Err(Error::Config(format!(
            "refusing to overwrite existing key file {}",
            path.display()
        )));
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let encoded = base64::engine::general_purpose::STANDARD.encode(random_key());
    std::fs::write(path, format!("{encoded}\n"))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }

    tracing::info!(path = %path.display(), "wrote new shared key");
    Ok(())
}

fn random_key() -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    rand::thread_rng().fill_bytes(&mut key);
    key
}
