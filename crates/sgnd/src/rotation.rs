//! Key-rotation attestation processing
//!
//! A `ku.attestation.rotate_key` KU carries a payload signed by the key
//! being rotated away from. On acceptance the new key enters the allow-list;
//! a rotation reasoned "compromised" also revokes the old key.

use crate::trust::{TrustError, TrustStore};
use serde_json::Value;
use sgn_core::sign::{key_id, verify_rotation_payload, verifying_key_from_pem};
use thiserror::Error;

const REASON_COMPROMISED: &str = "compromised";
const REVOKE_REASON: &str = "rotated_due_to_compromise";

/// Rotation processing errors
#[derive(Debug, Error)]
pub enum RotationError {
    #[error("rotation payload missing field: {0}")]
    MissingField(&'static str),
    #[error("supplied key does not match prev_key_id")]
    KeyMismatch,
    #[error("prev_sig verification failed: {0}")]
    BadSignature(&'static str),
    #[error("previous key is not trusted: {0}")]
    Untrusted(&'static str),
    #[error("trust store error: {0}")]
    Trust(#[from] TrustError),
    #[error(transparent)]
    Core(#[from] sgn_core::Error),
}

/// What a processed rotation did
#[derive(Debug, Clone)]
pub struct RotationOutcome {
    pub prev_key_id: String,
    pub new_key_id: String,
    pub revoked_prev: bool,
}

/// Verify and apply a rotation attestation KU against the trust store.
///
/// `prev_pub_pem` is the caller-supplied public key of the rotating
/// (previous) key; its identity must match the payload's `prev_key_id`.
pub fn process_rotation(
    trust: &TrustStore,
    ku: &Value,
    prev_pub_pem: &str,
) -> Result<RotationOutcome, RotationError> {
    let payload = ku
        .get("payload")
        .ok_or(RotationError::MissingField("payload"))?;
    let prev_key_id = payload
        .get("prev_key_id")
        .and_then(Value::as_str)
        .ok_or(RotationError::MissingField("prev_key_id"))?;
    let new_key_id = payload
        .get("new_key_id")
        .and_then(Value::as_str)
        .ok_or(RotationError::MissingField("new_key_id"))?;
    let reason = payload
        .get("reason")
        .and_then(Value::as_str)
        .unwrap_or_default();

    let prev_key = verifying_key_from_pem(prev_pub_pem)?;
    if key_id(&prev_key)? != prev_key_id {
        return Err(RotationError::KeyMismatch);
    }

    if let Err(failure) = verify_rotation_payload(payload, &prev_key)? {
        return Err(RotationError::BadSignature(failure.reason()));
    }

    let decision = trust.is_trusted(prev_key_id);
    if !decision.trusted {
        return Err(RotationError::Untrusted(
            decision.reason.unwrap_or("untrusted"),
        ));
    }

    trust.add(new_key_id, None)?;
    let revoked_prev = reason == REASON_COMPROMISED;
    if revoked_prev {
        trust.revoke(prev_key_id, REVOKE_REASON)?;
    }

    Ok(RotationOutcome {
        prev_key_id: prev_key_id.to_string(),
        new_key_id: new_key_id.to_string(),
        revoked_prev,
    })
}
