//! Payload encryption keyed by a shared passphrase
//!
//! Keys are derived with PBKDF2-HMAC-SHA256. Every sealed message carries
//! its own random nonce:
//!
//! - 12 bytes: nonce
//! - N bytes: ChaCha20-Poly1305 ciphertext + tag

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::rngs::OsRng;
use rand::RngCore;
use serde_json::Value;
use sha2::Sha256;
use thiserror::Error;

/// PBKDF2 rounds used for passphrase keys
pub const KDF_ITERATIONS: u32 = 100_000;

/// AEAD nonce length
pub const NONCE_LEN: usize = 12;

/// Poly1305 tag length
const TAG_LEN: usize = 16;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("AEAD encryption failed")]
    Encrypt,
    #[error("AEAD decryption failed (wrong passphrase or corrupted data)")]
    Decrypt,
    #[error("Ciphertext too short: {0} bytes")]
    Truncated(usize),
    #[error("Plaintext encoding error: {0}")]
    Encoding(String),
}

/// Derive a 256-bit key from a passphrase.
///
/// The passphrase doubles as the salt so both peers arrive at the same key
/// without exchanging anything.
pub fn derive_key(passphrase: &str, iterations: u32) -> [u8; 32] {
    let mut key = [0u8; 32];
    pbkdf2::pbkdf2_hmac::<Sha256>(
        passphrase.as_bytes(),
        passphrase.as_bytes(),
        iterations,
        &mut key,
    );
    key
}

/// Symmetric cipher for structured payloads.
///
/// Deriving the key is deliberately slow, so a cipher is built once per
/// session and shared.
#[derive(Clone)]
pub struct PayloadCipher {
    cipher: ChaCha20Poly1305,
}

impl PayloadCipher {
    /// Create a cipher using the standard iteration count
    pub fn new(passphrase: &str) -> Self {
        Self::with_iterations(passphrase, KDF_ITERATIONS)
    }

    /// Create a cipher with a custom PBKDF2 iteration count
    pub fn with_iterations(passphrase: &str, iterations: u32) -> Self {
        Self::from_key(derive_key(passphrase, iterations))
    }

    /// Create a cipher from raw key bytes
    pub fn from_key(key: [u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(&key)),
        }
    }

    /// Encrypt raw bytes
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|_| CryptoError::Encrypt)?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt bytes produced by [`PayloadCipher::seal`]
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < NONCE_LEN + TAG_LEN {
            return Err(CryptoError::Truncated(sealed.len()));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::Decrypt)
    }

    /// Serialize a JSON payload and encrypt it
    pub fn seal_value(&self, payload: &Value) -> Result<Vec<u8>, CryptoError> {
        let plaintext =
            serde_json::to_vec(payload).map_err(|e| CryptoError::Encoding(e.to_string()))?;
        self.seal(&plaintext)
    }

    /// Decrypt and parse a JSON payload
    pub fn open_value(&self, sealed: &[u8]) -> Result<Value, CryptoError> {
        let plaintext = self.open(sealed)?;
        serde_json::from_slice(&plaintext).map_err(|e| CryptoError::Encoding(e.to_string()))
    }

    /// Encrypt a string into hex text
    pub fn seal_text(&self, text: &str) -> Result<String, CryptoError> {
        Ok(hex::encode(self.seal(text.as_bytes())?))
    }

    /// Decrypt hex text produced by [`PayloadCipher::seal_text`]
    pub fn open_text(&self, sealed: &str) -> Result<String, CryptoError> {
        let bytes = hex::decode(sealed).map_err(|e| CryptoError::Encoding(e.to_string()))?;
        let plaintext = self.open(&bytes)?;
        String::from_utf8(plaintext).map_err(|e| CryptoError::Encoding(e.to_string()))
    }
}

impl std::fmt::Debug for PayloadCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PayloadCipher(..)")
    }
}

/// Encrypt a payload under a passphrase
pub fn encrypt(payload: &Value, passphrase: &str) -> Result<Vec<u8>, CryptoError> {
    PayloadCipher::new(passphrase).seal_value(payload)
}

/// Decrypt a payload sealed by [`encrypt`]
pub fn decrypt(sealed: &[u8], passphrase: &str) -> Result<Value, CryptoError> {
    PayloadCipher::new(passphrase).open_value(sealed)
}
