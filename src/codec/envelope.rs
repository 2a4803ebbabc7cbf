//! Authenticated encryption envelope
//!
//! Every message and every outbound response chunk travels as one envelope:
//!
//! ```text
//! version(1) || nonce(12) || ciphertext || tag(16)
//! ```
//!
//! ChaCha20-Poly1305 with a random nonce per envelope; the version byte is
//! bound as associated data. Both peers hold the same 256-bit key.

use super::{random_bytes, CodecError, ENVELOPE_OVERHEAD, ENVELOPE_VERSION, KEY_LEN, NONCE_LEN};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, CHACHA20_POLY1305};
use std::fmt;

/// Pre-shared 256-bit symmetric key
#[derive(Clone)]
pub struct SecretKey([u8; KEY_LEN]);

impl SecretKey {
    /// Generate a new random key
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        random_bytes(&mut bytes);
        Self(bytes)
    }

    /// Create from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() != KEY_LEN {
            return Err(CodecError::Key(format!(
                "expected {} bytes, got {}",
                KEY_LEN,
                bytes.len()
            )));
        }
        let mut arr = [0u8; KEY_LEN];
        arr.copy_from_slice(bytes);
        Ok(Self(arr))
    }

    /// Get as bytes
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Encode as base64 (be careful with this!)
    pub fn to_base64(&self) -> String {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD.encode(self.0)
    }

    /// Decode from base64
    pub fn from_base64(s: &str) -> Result<Self, CodecError> {
        use base64::Engine;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(s.trim())
            .map_err(|e| CodecError::Key(e.to_string()))?;
        Self::from_bytes(&bytes)
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretKey([REDACTED])")
    }
}

impl Drop for SecretKey {
    // The pre-shared key must not outlive the process image longer than
    // needed. A volatile store keeps the wipe from being elided as a
    // dead write; the fence keeps it ordered before deallocation.
    fn drop(&mut self) {
        unsafe {
            std::ptr::write_volatile(&mut self.0, [0u8; KEY_LEN]);
        }
        std::sync::atomic::compiler_fence(std::sync::atomic::Ordering::SeqCst);
    }
}

/// AEAD cipher sealing and opening envelopes
pub struct Cipher {
    key: LessSafeKey,
}

impl Cipher {
    /// Create a new cipher from a pre-shared key
    pub fn new(key: &SecretKey) -> Result<Self, CodecError> {
        let unbound_key = UnboundKey::new(&CHACHA20_POLY1305, key.as_bytes())
            .map_err(|_| CodecError::Key("key rejected by cipher".to_string()))?;

        Ok(Self {
            key: LessSafeKey::new(unbound_key),
        })
    }

    /// Encrypt plaintext into a self-contained envelope
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        random_bytes(&mut nonce_bytes);

        let mut buffer = plaintext.to_vec();
        self.key
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::from([ENVELOPE_VERSION]),
                &mut buffer,
            )
            .map_err(|_| CodecError::Decrypt)?;

        let mut envelope = Vec::with_capacity(1 + NONCE_LEN + buffer.len());
        envelope.push(ENVELOPE_VERSION);
        envelope.extend_from_slice(&nonce_bytes);
        envelope.extend_from_slice(&buffer);
        Ok(envelope)
    }

    /// Verify and decrypt an envelope, returning the plaintext
    pub fn open(&self, envelope: &[u8]) -> Result<Vec<u8>, CodecError> {
        if envelope.len() < ENVELOPE_OVERHEAD || envelope[0] != ENVELOPE_VERSION {
            return Err(CodecError::Decrypt);
        }

        let mut nonce_bytes = [0u8; NONCE_LEN];
        nonce_bytes.copy_from_slice(&envelope[1..1 + NONCE_LEN]);

        let mut buffer = envelope[1 + NONCE_LEN..].to_vec();
        let plaintext = self
            .key
            .open_in_place(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::from([ENVELOPE_VERSION]),
                &mut buffer,
            )
            .map_err(|_| CodecError::Decrypt)?;

        Ok(plaintext.to_vec())
    }
}
