//! Ed25519 detached signatures and key identifiers
//!
//! Signing covers the canonical bytes of the KU with signature fields
//! stripped (prehash `none`), so the signature and the CID always agree on
//! what was signed. The key identifier is derived from the public key's
//! SPKI DER form only, never from key metadata.

use crate::canonical::{canonical_bytes, strip_unsigned};
use crate::error::{Error, Result};
use crate::types::{Sig, SIG_ALG, SIG_CONTEXT, SIG_PREHASH};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ed25519_dalek::pkcs8::{DecodePublicKey, EncodePublicKey};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Why a signature failed verification. The snake_case reason strings are
/// stable API surfaced to clients.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VerifyFailure {
    /// No `sig` field present
    MissingSig,
    /// `alg`/`prehash`/`context` mismatch or malformed header
    BadSigHeader,
    /// `sig.key_id` does not match the supplied public key
    KeyMismatch,
    /// Signature bytes do not verify
    BadSignature,
}

impl VerifyFailure {
    pub fn reason(self) -> &'static str {
        match self {
            VerifyFailure::MissingSig => "missing_sig",
            VerifyFailure::BadSigHeader => "bad_sig_header",
            VerifyFailure::KeyMismatch => "key_mismatch",
            VerifyFailure::BadSignature => "bad_signature",
        }
    }
}

/// Verification verdict: outer error for encoding problems, inner for the
/// signature itself.
pub type VerifyResult = std::result::Result<(), VerifyFailure>;

/// Derive the stable key identifier for a public key:
/// `base32lower(sha256(SPKI-DER(pub)))`, unpadded.
pub fn key_id(key: &VerifyingKey) -> Result<String> {
    let der = key
        .to_public_key_der()
        .map_err(|e| Error::InvalidPublicKey(e.to_string()))?;
    let digest = Sha256::digest(der.as_bytes());
    Ok(base32::encode(base32::Alphabet::Rfc4648 { padding: false }, &digest).to_lowercase())
}

/// Decode a verifying key from SPKI PEM (the `pub_pem` API field).
pub fn verifying_key_from_pem(pem: &str) -> Result<VerifyingKey> {
    VerifyingKey::from_public_key_pem(pem).map_err(|e| Error::InvalidPublicKey(e.to_string()))
}

/// Encode a verifying key as SPKI PEM.
pub fn verifying_key_to_pem(key: &VerifyingKey) -> Result<String> {
    key.to_public_key_pem(pkcs8::LineEnding::LF)
        .map_err(|e| Error::InvalidPublicKey(e.to_string()))
}

/// Sign a KU value, returning a copy with the `sig` field attached.
///
/// Any pre-existing `sig`/`signatures` fields are replaced.
pub fn sign_value(value: &Value, key: &SigningKey) -> Result<Value> {
    let mut signed = strip_unsigned(value);
    let obj = signed
        .as_object_mut()
        .ok_or(Error::NotAnObject("ku to sign"))?;

    let bytes = canonical_bytes(&Value::Object(obj.clone()))?;
    let signature = key.sign(&bytes);

    let header = Sig {
        alg: SIG_ALG.to_string(),
        prehash: SIG_PREHASH.to_string(),
        context: SIG_CONTEXT.to_string(),
        key_id: key_id(&key.verifying_key())?,
        signature: URL_SAFE_NO_PAD.encode(signature.to_bytes()),
    };
    obj.insert("sig".to_string(), serde_json::to_value(header)?);
    Ok(signed)
}

/// Verify a signed KU value against the supplied public key.
///
/// Recomputes the canonical bytes with `sig` stripped, checks the header
/// labels, the key identifier, and finally the Ed25519 signature.
pub fn verify_value(value: &Value, key: &VerifyingKey) -> Result<VerifyResult> {
    let sig_value = match value.get("sig") {
        Some(v) => v,
        None => return Ok(Err(VerifyFailure::MissingSig)),
    };
    let header: Sig = match serde_json::from_value(sig_value.clone()) {
        Ok(h) => h,
        Err(_) => return Ok(Err(VerifyFailure::BadSigHeader)),
    };
    if header.alg != SIG_ALG || header.prehash != SIG_PREHASH || header.context != SIG_CONTEXT {
        return Ok(Err(VerifyFailure::BadSigHeader));
    }
    if header.key_id != key_id(key)? {
        return Ok(Err(VerifyFailure::KeyMismatch));
    }

    let bytes = canonical_bytes(&strip_unsigned(value))?;
    Ok(check_detached(&bytes, &header.signature, key))
}

/// Verify a rotation-attestation payload: `prev_sig` (base64url) over the
/// canonical bytes of the payload with `prev_sig` removed.
pub fn verify_rotation_payload(payload: &Value, prev_key: &VerifyingKey) -> Result<VerifyResult> {
    let obj = match payload.as_object() {
        Some(obj) => obj,
        None => return Err(Error::NotAnObject("rotation payload")),
    };
    let sig_b64 = match obj.get("prev_sig").and_then(Value::as_str) {
        Some(s) => s,
        None => return Ok(Err(VerifyFailure::MissingSig)),
    };

    let mut unsigned = obj.clone();
    unsigned.remove("prev_sig");
    let bytes = canonical_bytes(&Value::Object(unsigned))?;
    Ok(check_detached(&bytes, sig_b64, prev_key))
}

fn check_detached(message: &[u8], sig_b64: &str, key: &VerifyingKey) -> VerifyResult {
    let raw = match URL_SAFE_NO_PAD.decode(sig_b64) {
        Ok(raw) => raw,
        Err(_) => return Err(VerifyFailure::BadSignature),
    };
    let raw: [u8; 64] = match raw.try_into() {
        Ok(raw) => raw,
        Err(_) => return Err(VerifyFailure::BadSignature),
    };
    let signature = Signature::from_bytes(&raw);
    key.verify(message, &signature)
        .map_err(|_| VerifyFailure::BadSignature)
}
