//! Content identifiers
//!
//! A CID is derived from the canonical bytes of a KU with its signature
//! fields removed: SHA-256 digest, wrapped as a CIDv1 (`dag-cbor` codec,
//! `sha2-256` multihash), multibase base32-lower, and finally the legacy
//! string prefix `cid-blake3:`. The "blake3" label is a wire-compatibility
//! artifact; the digest inside is SHA-256. Parsing is strict: any other
//! prefix, codec, or multihash is a hard error, never silently accepted.

use crate::canonical::{canonical_bytes, strip_unsigned};
use crate::error::{Error, Result};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Legacy string prefix carried by every CID
pub const CID_PREFIX: &str = "cid-blake3:";

const CID_VERSION: u8 = 0x01;
const CODEC_DAG_CBOR: u8 = 0x71;
const MULTIHASH_SHA2_256: u8 = 0x12;
const SHA2_256_LEN: u8 = 0x20;
const MULTIBASE_BASE32_LOWER: char = 'b';

/// Compute the CID for a KU value.
///
/// `sig`/`signatures` are stripped before hashing, so signed and unsigned
/// renditions of the same KU share one CID.
pub fn cid_for_value(value: &Value) -> Result<String> {
    let stripped = strip_unsigned(value);
    let bytes = canonical_bytes(&stripped)?;
    Ok(cid_for_canonical_bytes(&bytes))
}

/// Compute the CID string for already-canonical bytes.
pub fn cid_for_canonical_bytes(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut cid = Vec::with_capacity(4 + digest.len());
    cid.push(CID_VERSION);
    cid.push(CODEC_DAG_CBOR);
    cid.push(MULTIHASH_SHA2_256);
    cid.push(SHA2_256_LEN);
    cid.extend_from_slice(&digest);

    let b32 = base32::encode(base32::Alphabet::Rfc4648 { padding: false }, &cid).to_lowercase();
    format!("{CID_PREFIX}{MULTIBASE_BASE32_LOWER}{b32}")
}

/// Strictly parse a CID string, returning the SHA-256 digest it carries.
pub fn parse_cid(cid: &str) -> Result<[u8; 32]> {
    let invalid = |reason: &str| Error::InvalidCid {
        cid: cid.to_string(),
        reason: reason.to_string(),
    };

    let rest = cid.strip_prefix(CID_PREFIX).ok_or_else(|| invalid("missing cid-blake3: prefix"))?;
    let b32 = rest
        .strip_prefix(MULTIBASE_BASE32_LOWER)
        .ok_or_else(|| invalid("missing base32 multibase prefix"))?;

    let bytes = base32::decode(
        base32::Alphabet::Rfc4648 { padding: false },
        &b32.to_uppercase(),
    )
    .ok_or_else(|| invalid("bad base32 payload"))?;

    if bytes.len() != 36 {
        return Err(invalid("wrong length for a sha2-256 CIDv1"));
    }
    if bytes[0] != CID_VERSION {
        return Err(invalid("unsupported CID version"));
    }
    if bytes[1] != CODEC_DAG_CBOR {
        return Err(invalid("unsupported codec, expected dag-cbor"));
    }
    if bytes[2] != MULTIHASH_SHA2_256 || bytes[3] != SHA2_256_LEN {
        return Err(invalid("unsupported multihash, expected sha2-256"));
    }

    let mut digest = [0u8; 32];
    digest.copy_from_slice(&bytes[4..]);
    Ok(digest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn note_ku() -> Value {
        json!({
            "schema_id": "ku.v1",
            "type": "ku.note",
            "content_type": "application/json",
            "payload": {"title": "T", "n": 42},
            "parents": [],
            "sources": [],
            "tests": [],
            "provenance": {"agent_pubkey": null},
            "tags": ["x"],
        })
    }

    #[test]
    fn cid_is_deterministic() {
        let ku = note_ku();
        assert_eq!(cid_for_value(&ku).unwrap(), cid_for_value(&ku).unwrap());
    }

    #[test]
    fn cid_ignores_key_order() {
        let ku = note_ku();
        let shuffled: Value = serde_json::from_str(
            r#"{
                "tags": ["x"],
                "provenance": {"agent_pubkey": null},
                "tests": [],
                "sources": [],
                "parents": [],
                "payload": {"n": 42, "title": "T"},
                "content_type": "application/json",
                "type": "ku.note",
                "schema_id": "ku.v1"
            }"#,
        )
        .unwrap();

        assert_eq!(cid_for_value(&ku).unwrap(), cid_for_value(&shuffled).unwrap());
    }

    #[test]
    fn cid_ignores_signature_fields() {
        let ku = note_ku();
        let mut signed = ku.clone();
        signed["sig"] = json!({"alg": "ed25519", "signature": "AAAA"});

        assert_eq!(cid_for_value(&ku).unwrap(), cid_for_value(&signed).unwrap());
    }

    #[test]
    fn payload_changes_change_the_cid() {
        let ku = note_ku();
        let mut other = ku.clone();
        other["payload"]["n"] = json!(43);

        assert_ne!(cid_for_value(&ku).unwrap(), cid_for_value(&other).unwrap());
    }

    #[test]
    fn cid_string_carries_sha2_cidv1_header() {
        let cid = cid_for_value(&note_ku()).unwrap();
        assert!(cid.starts_with("cid-blake3:b"));

        let digest = parse_cid(&cid).unwrap();
        assert_eq!(digest.len(), 32);

        // Version, codec, and multihash header bytes are fixed
        let body = cid.strip_prefix("cid-blake3:b").unwrap();
        let bytes = base32::decode(
            base32::Alphabet::Rfc4648 { padding: false },
            &body.to_uppercase(),
        )
        .unwrap();
        assert_eq!(hex::encode(&bytes[..4]), "01711220");
    }

    #[test]
    fn parse_rejects_foreign_prefixes() {
        assert!(parse_cid("cid-sha256:babcdef").is_err());
        assert!(parse_cid("bafyreib000").is_err());
        assert!(parse_cid("cid-blake3:zabcdef").is_err());
        assert!(parse_cid("cid-blake3:b!!!").is_err());
    }

    #[test]
    fn parse_rejects_wrong_multihash() {
        // A well-formed base32 body whose codec byte is not dag-cbor
        let mut raw = vec![0x01, 0x70, 0x12, 0x20];
        raw.extend_from_slice(&[0u8; 32]);
        let b32 = base32::encode(base32::Alphabet::Rfc4648 { padding: false }, &raw).to_lowercase();
        assert!(parse_cid(&format!("cid-blake3:b{b32}")).is_err());
    }
}
