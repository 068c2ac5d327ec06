//! Extension-script codec.
//!
//! Extension-bearing scripts carry a fixed 9-byte header followed by an
//! opaque payload:
//!
//! ```text
//! byte 0      marker (0xFF)
//! bytes 1..5  extension id   (i32, big-endian)
//! bytes 5..9  mode           (i32, big-endian)
//! bytes 9..   payload
//! ```
//!
//! The STARK-verification extension (id 1) further structures the payload:
//! outputs carry a [`Precondition`], inputs carry a [`Witness`].

use serde::{Deserialize, Serialize};

use crate::error::FormatError;

/// First byte of every extension-bearing script.
pub const EXTENSION_MARKER: u8 = 0xFF;

/// Length of the marker + id + mode header.
pub const HEADER_LEN: usize = 9;

/// Extension id of the STARK-verification extension.
pub const STARK_VERIFY_EXTENSION_ID: i32 = 1;

/// Flags prefix skipped before the precondition hash fields.
const PRECONDITION_FLAGS_LEN: usize = 4;

/// Full precondition length: flags + root + inner program hash + program hash.
pub const PRECONDITION_LEN: usize = PRECONDITION_FLAGS_LEN + 32 * 3;

/// A decoded extension script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionScript {
    pub extension_id: i32,
    pub mode: i32,
    pub payload: Vec<u8>,
}

impl ExtensionScript {
    pub fn new(extension_id: i32, mode: i32, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            extension_id,
            mode,
            payload: payload.into(),
        }
    }

    /// Returns `true` if this script belongs to the STARK-verification extension.
    pub fn is_stark_verify(&self) -> bool {
        self.extension_id == STARK_VERIFY_EXTENSION_ID
    }
}

/// Decode raw script bytes into an [`ExtensionScript`].
pub fn decode(bytes: &[u8]) -> Result<ExtensionScript, FormatError> {
    if bytes.len() < HEADER_LEN {
        return Err(FormatError::TooShort {
            len: bytes.len(),
            min: HEADER_LEN,
        });
    }
    if bytes[0] != EXTENSION_MARKER {
        return Err(FormatError::BadMarker { found: bytes[0] });
    }
    let extension_id = i32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
    let mode = i32::from_be_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]);
    Ok(ExtensionScript {
        extension_id,
        mode,
        payload: bytes[HEADER_LEN..].to_vec(),
    })
}

/// Encode an [`ExtensionScript`]; the exact inverse of [`decode`].
pub fn encode(script: &ExtensionScript) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + script.payload.len());
    out.push(EXTENSION_MARKER);
    out.extend_from_slice(&script.extension_id.to_be_bytes());
    out.extend_from_slice(&script.mode.to_be_bytes());
    out.extend_from_slice(&script.payload);
    out
}

/// Decode a hex-encoded script (as returned by the node).
pub fn decode_hex(script_hex: &str) -> Result<ExtensionScript, FormatError> {
    let bytes = hex::decode(script_hex).map_err(|e| FormatError::InvalidHex(e.to_string()))?;
    decode(&bytes)
}

/// Returns `true` if a hex-encoded script starts with the extension marker.
///
/// Pure prefix check; no decoding is attempted.
pub fn is_extension_script(script_hex: &str) -> bool {
    script_hex
        .get(..2)
        .is_some_and(|b| b.eq_ignore_ascii_case("ff"))
}

// ─── STARK-verification payloads ──────────────────────────────────────────────

/// Precondition carried by a STARK-verification extension output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Precondition {
    pub root: [u8; 32],
    pub inner_program_hash: [u8; 32],
    pub program_hash: [u8; 32],
}

impl Precondition {
    /// Decode a precondition payload.
    ///
    /// Short payloads are right-padded with zeros, so this never fails.
    pub fn decode(payload: &[u8]) -> Self {
        let mut buf = [0u8; PRECONDITION_LEN];
        let n = payload.len().min(PRECONDITION_LEN);
        buf[..n].copy_from_slice(&payload[..n]);

        let field = |i: usize| {
            let start = PRECONDITION_FLAGS_LEN + i * 32;
            let mut out = [0u8; 32];
            out.copy_from_slice(&buf[start..start + 32]);
            out
        };
        Self {
            root: field(0),
            inner_program_hash: field(1),
            program_hash: field(2),
        }
    }

    pub fn root_hex(&self) -> String {
        hex::encode(self.root)
    }

    pub fn inner_program_hash_hex(&self) -> String {
        hex::encode(self.inner_program_hash)
    }

    pub fn program_hash_hex(&self) -> String {
        hex::encode(self.program_hash)
    }
}

/// How the proof bytes inside a [`Witness`] are serialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProofFormat {
    /// Structured text (JSON) proof.
    Text,
    /// Binary proof.
    Binary,
    /// A format byte this indexer does not know about; kept verbatim.
    Other(u8),
}

impl From<u8> for ProofFormat {
    fn from(b: u8) -> Self {
        match b {
            0 => Self::Text,
            1 => Self::Binary,
            other => Self::Other(other),
        }
    }
}

/// Witness carried by a STARK-verification extension input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Witness {
    pub with_pedersen: bool,
    pub proof_format: ProofFormat,
    pub proof_data: Vec<u8>,
}

impl Witness {
    pub fn decode(payload: &[u8]) -> Result<Self, FormatError> {
        if payload.len() < 2 {
            return Err(FormatError::WitnessTooShort { len: payload.len() });
        }
        Ok(Self {
            with_pedersen: payload[0] != 0,
            proof_format: ProofFormat::from(payload[1]),
            proof_data: payload[2..].to_vec(),
        })
    }

    /// Size of the proof in bytes, as reported on proof records.
    pub fn proof_size(&self) -> u64 {
        self.proof_data.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_roundtrip() {
        let cases = [
            ExtensionScript::new(1, 0, vec![]),
            ExtensionScript::new(i32::MIN, i32::MAX, vec![0xde, 0xad]),
            ExtensionScript::new(-1, -7, vec![0u8; 300]),
        ];
        for s in cases {
            assert_eq!(decode(&encode(&s)).unwrap(), s);
        }
    }

    #[test]
    fn header_is_big_endian() {
        let bytes = encode(&ExtensionScript::new(1, 2, vec![0xaa]));
        assert_eq!(bytes, vec![0xff, 0, 0, 0, 1, 0, 0, 0, 2, 0xaa]);
    }

    #[test]
    fn decode_rejects_short_input() {
        let err = decode(&[0xff, 0, 0, 0, 1, 0, 0, 0]).unwrap_err();
        assert_eq!(err, FormatError::TooShort { len: 8, min: 9 });
    }

    #[test]
    fn decode_rejects_wrong_marker() {
        let err = decode(&[0x76, 0, 0, 0, 1, 0, 0, 0, 0]).unwrap_err();
        assert_eq!(err, FormatError::BadMarker { found: 0x76 });
    }

    #[test]
    fn empty_payload_decodes_to_empty_vec() {
        let s = decode(&[0xff, 0, 0, 0, 1, 0, 0, 0, 1]).unwrap();
        assert!(s.payload.is_empty());
        assert!(s.is_stark_verify());
    }

    #[test]
    fn extension_predicate() {
        assert!(is_extension_script("ff0000000100000000"));
        assert!(is_extension_script("FF00"));
        assert!(!is_extension_script("76a914"));
        assert!(!is_extension_script("f"));
        assert!(!is_extension_script(""));
    }

    #[test]
    fn decode_hex_rejects_garbage() {
        assert!(matches!(decode_hex("ffzz"), Err(FormatError::InvalidHex(_))));
    }

    #[test]
    fn precondition_full_payload() {
        let mut payload = vec![0u8; 4];
        payload.extend([1u8; 32]);
        payload.extend([2u8; 32]);
        payload.extend([3u8; 32]);
        let p = Precondition::decode(&payload);
        assert_eq!(p.root, [1u8; 32]);
        assert_eq!(p.inner_program_hash, [2u8; 32]);
        assert_eq!(p.program_hash, [3u8; 32]);
    }

    #[test]
    fn precondition_short_payload_is_zero_padded() {
        let mut payload = vec![0u8; 4];
        payload.extend([9u8; 40]);
        let p = Precondition::decode(&payload);
        assert_eq!(p.root, [9u8; 32]);
        assert_eq!(&p.inner_program_hash[..8], &[9u8; 8]);
        assert_eq!(&p.inner_program_hash[8..], &[0u8; 24]);
        assert_eq!(p.program_hash, [0u8; 32]);

        let empty = Precondition::decode(&[]);
        assert_eq!(empty.root, [0u8; 32]);
    }

    #[test]
    fn witness_decode() {
        let w = Witness::decode(&[1, 1, 0xaa, 0xbb, 0xcc]).unwrap();
        assert!(w.with_pedersen);
        assert_eq!(w.proof_format, ProofFormat::Binary);
        assert_eq!(w.proof_size(), 3);

        let w = Witness::decode(&[0, 0]).unwrap();
        assert!(!w.with_pedersen);
        assert_eq!(w.proof_format, ProofFormat::Text);
        assert_eq!(w.proof_size(), 0);
    }

    #[test]
    fn witness_too_short() {
        assert_eq!(
            Witness::decode(&[1]).unwrap_err(),
            FormatError::WitnessTooShort { len: 1 }
        );
    }
}
