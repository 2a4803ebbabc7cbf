//! Optional pre-compression
//!
//! Plaintext is zlib-compressed before encryption when that actually makes
//! it smaller. A one-byte header tells the receiver which form follows;
//! receivers must honor it.

use super::CodecError;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{Read, Write};

/// Header byte: body is raw plaintext
const HEADER_RAW: u8 = 0;

/// Header byte: body is zlib-compressed
const HEADER_COMPRESSED: u8 = 1;

/// Prefix plaintext with a compression header, compressing when it helps
pub fn pack(plaintext: &[u8]) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    let compressed = match encoder.write_all(plaintext).and_then(|_| encoder.finish()) {
        Ok(out) => out,
        // Writes into a Vec do not fail in practice; fall back to raw anyway
        Err(_) => Vec::new(),
    };

    if !compressed.is_empty() && compressed.len() < plaintext.len() {
        let mut packed = Vec::with_capacity(1 + compressed.len());
        packed.push(HEADER_COMPRESSED);
        packed.extend_from_slice(&compressed);
        packed
    } else {
        let mut packed = Vec::with_capacity(1 + plaintext.len());
        packed.push(HEADER_RAW);
        packed.extend_from_slice(plaintext);
        packed
    }
}

/// Strip the compression header and recover the plaintext
pub fn unpack(packed: &[u8]) -> Result<Vec<u8>, CodecError> {
    let (header, body) = packed
        .split_first()
        .ok_or_else(|| CodecError::Decompress("empty payload".to_string()))?;

    match *header {
        HEADER_RAW => Ok(body.to_vec()),
        HEADER_COMPRESSED => {
            let mut plaintext = Vec::new();
            ZlibDecoder::new(body)
                .read_to_end(&mut plaintext)
                .map_err(|e| CodecError::Decompress(e.to_string()))?;
            Ok(plaintext)
        }
        other => Err(CodecError::Decompress(format!(
            "unknown compression header: {}",
            other
        ))),
    }
}
