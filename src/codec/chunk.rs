//! base32 chunking of envelopes into DNS-safe segments
//!
//! Query payloads ride in subdomain labels, which middle resolvers may
//! case-fold, so the encoding must be case-insensitive: base32 without
//! padding, emitted lowercase. Response chunks reuse the same encoding in
//! TXT strings to keep client parsing uniform.

use super::{CodecError, ENVELOPE_OVERHEAD, ENVELOPE_VERSION};
use data_encoding::BASE32_NOPAD;

/// Encode raw bytes to a lowercase base32 string for one TXT string
pub fn encode_txt(data: &[u8]) -> String {
    BASE32_NOPAD.encode(data).to_lowercase()
}

/// Decode one base32 TXT string back to raw bytes
pub fn decode_txt(encoded: &str) -> Result<Vec<u8>, CodecError> {
    BASE32_NOPAD
        .decode(encoded.to_uppercase().as_bytes())
        .map_err(|e| CodecError::Reassembly(format!("invalid base32: {}", e)))
}

/// Split an envelope into per-query label groups.
///
/// Each inner vector is the payload of one chunk, already cut into labels
/// no longer than `max_label_len`. Concatenating every label of every group
/// in index order reproduces the base32 form of `data`; the split is
/// deterministic for given inputs.
pub fn split(data: &[u8], max_label_len: usize, max_labels_per_query: usize) -> Vec<Vec<String>> {
    assert!(max_label_len > 0 && max_labels_per_query > 0);

    let encoded = encode_txt(data);
    if encoded.is_empty() {
        return Vec::new();
    }

    let per_chunk = max_label_len * max_labels_per_query;
    encoded
        .as_bytes()
        .chunks(per_chunk)
        .map(|chunk| {
            chunk
                .chunks(max_label_len)
                // base32 output is pure ASCII, so byte chunks are valid UTF-8
                .map(|label| String::from_utf8_lossy(label).into_owned())
                .collect()
        })
        .collect()
}

/// Reassemble chunk payloads delivered in index order into envelope bytes.
///
/// Fails with a reassembly error when the concatenation does not decode, or
/// when the decoded stream is not plausibly an encryption envelope.
pub fn join(chunks: &[String]) -> Result<Vec<u8>, CodecError> {
    let combined: String = chunks.iter().flat_map(|c| c.chars()).collect();
    let data = decode_txt(&combined)?;

    if data.len() < ENVELOPE_OVERHEAD {
        return Err(CodecError::Reassembly(format!(
            "{} bytes is too short for an envelope",
            data.len()
        )));
    }
    if data[0] != ENVELOPE_VERSION {
        return Err(CodecError::Reassembly(format!(
            "unknown envelope version: {}",
            data[0]
        )));
    }

    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::super::{random_bytes, MAX_LABEL_LEN};
    use super::*;

    fn envelope_like(len: usize) -> Vec<u8> {
        let mut data = vec![0u8; len];
        random_bytes(&mut data);
        data[0] = ENVELOPE_VERSION;
        data
    }

    #[test]
    fn test_split_join_roundtrip() {
        let data = envelope_like(500);
        let groups = split(&data, MAX_LABEL_LEN, 1);
        assert!(groups.len() > 1);

        let flat: Vec<String> = groups.into_iter().flatten().collect();
        assert_eq!(join(&flat).unwrap(), data);
    }

    #[test]
    fn test_labels_respect_length_and_alphabet() {
        let data = envelope_like(1000);
        for group in split(&data, 45, 2) {
            assert!(group.len() <= 2);
            for label in group {
                assert!(label.len() <= 45);
                assert!(label
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
            }
        }
    }

    #[test]
    fn test_split_is_deterministic() {
        let data = envelope_like(300);
        assert_eq!(split(&data, 63, 1), split(&data, 63, 1));
    }

    #[test]
    fn test_split_empty() {
        assert!(split(&[], 63, 1).is_empty());
    }

    #[test]
    fn test_single_byte_final_chunk() {
        // Sized so the last chunk carries exactly one label character
        let data = envelope_like(100);
        let encoded_len = encode_txt(&data).len();
        let label_len = encoded_len - 1;
        let groups = split(&data, label_len, 1);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[1][0].len(), 1);

        let flat: Vec<String> = groups.into_iter().flatten().collect();
        assert_eq!(join(&flat).unwrap(), data);
    }

    #[test]
    fn test_join_rejects_bad_alphabet() {
        assert!(join(&["not!base32?".to_string()]).is_err());
    }

    #[test]
    fn test_join_rejects_short_stream() {
        let tiny = encode_txt(&[ENVELOPE_VERSION, 2, 3]);
        assert!(join(&[tiny]).is_err());
    }

    #[test]
    fn test_join_rejects_unknown_version() {
        let mut data = envelope_like(64);
        data[0] = 0xAB;
        let flat: Vec<String> = split(&data, 63, 1).into_iter().flatten().collect();
        assert!(join(&flat).is_err());
    }

    #[test]
    fn test_decode_is_case_insensitive() {
        let data = envelope_like(40);
        let encoded = encode_txt(&data);
        assert_eq!(decode_txt(&encoded.to_uppercase()).unwrap(), data);
    }
}
