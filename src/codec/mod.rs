//! Message codec
//!
//! This module provides:
//! - ChaCha20-Poly1305 authenticated encryption of message payloads
//! - Optional zlib pre-compression to cut DNS round-trips
//! - base32 chunking of envelopes into DNS-label-safe segments
//! - Secure random number generation

mod chunk;
mod compress;
mod envelope;

pub use chunk::{decode_txt, encode_txt, join, split};
pub use compress::{pack, unpack};
pub use envelope::{Cipher, SecretKey};

use thiserror::Error;

/// Length of the symmetric key in bytes
pub const KEY_LEN: usize = 32;

/// Length of the envelope nonce in bytes
pub const NONCE_LEN: usize = 12;

/// Length of the authentication tag in bytes
pub const TAG_LEN: usize = 16;

/// Envelope format version
pub const ENVELOPE_VERSION: u8 = 1;

/// Bytes an envelope adds on top of its plaintext
pub const ENVELOPE_OVERHEAD: usize = 1 + NONCE_LEN + TAG_LEN;

/// Maximum octets in one DNS label
pub const MAX_LABEL_LEN: usize = 63;

/// Maximum octets in one TXT character-string
pub const MAX_TXT_STRING_LEN: usize = 255;

/// Largest raw byte count whose base32 form fits one TXT string
pub const MAX_TXT_RAW_LEN: usize = MAX_TXT_STRING_LEN * 5 / 8;

/// Largest plaintext unit that compresses, encrypts, and base32-encodes
/// into a single TXT string
pub const MAX_UNIT_LEN: usize = MAX_TXT_RAW_LEN - ENVELOPE_OVERHEAD - 1;

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    /// Deliberately opaque: MAC mismatch, version mismatch, and malformed
    /// envelopes are indistinguishable to callers.
    #[error("decryption failed")]
    Decrypt,

    #[error("reassembly failed: {0}")]
    Reassembly(String),

    #[error("decompression failed: {0}")]
    Decompress(String),

    #[error("invalid key: {0}")]
    Key(String),
}

/// Fill a buffer from the system CSPRNG.
///
/// Used for envelope nonces and client session ids; both must be
/// unpredictable or the tunnel's encryption and session isolation break.
pub fn random_bytes(buf: &mut [u8]) {
    use ring::rand::{SecureRandom, SystemRandom};
    SystemRandom::new()
        .fill(buf)
        .expect("system CSPRNG unavailable");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_bytes() {
        let mut buf1 = [0u8; 32];
        let mut buf2 = [0u8; 32];
        random_bytes(&mut buf1);
        random_bytes(&mut buf2);
        assert_ne!(buf1, buf2);
    }

    #[test]
    fn test_unit_fits_txt_string() {
        // A maximal plaintext unit must round up to at most one TXT string.
        let raw = MAX_UNIT_LEN + 1 + ENVELOPE_OVERHEAD;
        let encoded = (raw * 8).div_ceil(5);
        assert!(encoded <= MAX_TXT_STRING_LEN);
    }
}
