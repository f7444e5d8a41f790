//! Knowledge Unit data model
//!
//! A KU is an ordered JSON record. The CID is computed over the record with
//! the `sig` (and legacy `signatures`) fields removed, so the struct keeps
//! `sig` optional and skips it entirely when absent.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Current KU schema identifier
pub const KU_SCHEMA_V1: &str = "ku.v1";

/// KU type carrying a signing-key rotation attestation
pub const KU_TYPE_ROTATE_KEY: &str = "ku.attestation.rotate_key";

/// Default content type for KU payloads
pub const DEFAULT_CONTENT_TYPE: &str = "application/json";

/// Signature algorithm label
pub const SIG_ALG: &str = "ed25519";
/// Prehash mode label (always plain Ed25519, no prehashing)
pub const SIG_PREHASH: &str = "none";
/// Signing context label, fixed for wire compatibility
pub const SIG_CONTEXT: &str = "sgn-ku-v1";

/// Detached signature header attached to a signed KU
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Sig {
    pub alg: String,
    pub prehash: String,
    pub context: String,
    /// Stable identifier of the signing key (see [`crate::sign::key_id`])
    pub key_id: String,
    /// base64url (no padding) Ed25519 signature over the canonical bytes
    pub signature: String,
}

/// Knowledge Unit: the unit of replication
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Ku {
    pub schema_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub content_type: String,
    /// Free-form JSON object; semantics defined by `kind`
    pub payload: Value,
    /// Parent CIDs (possibly empty DAG)
    pub parents: Vec<String>,
    /// Provenance entries
    pub sources: Vec<Value>,
    /// Test references
    pub tests: Vec<Value>,
    /// Object including `agent_pubkey` and `created_at`
    pub provenance: Value,
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sig: Option<Sig>,
}

impl Ku {
    /// Convert to a JSON value for canonicalization / transport.
    pub fn to_value(&self) -> crate::Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Parse from a JSON value. Call [`validate_ku`] first when the value
    /// comes off the wire and error details are needed.
    pub fn from_value(value: &Value) -> crate::Result<Self> {
        Ok(serde_json::from_value(value.clone())?)
    }
}

/// Top-level fields every KU must carry (besides the optional `sig`).
const REQUIRED_FIELDS: &[&str] = &[
    "schema_id",
    "type",
    "content_type",
    "payload",
    "parents",
    "sources",
    "tests",
    "provenance",
    "tags",
];

const ARRAY_FIELDS: &[&str] = &["parents", "sources", "tests", "tags"];
const OBJECT_FIELDS: &[&str] = &["payload", "provenance"];
const STRING_FIELDS: &[&str] = &["schema_id", "type", "content_type"];

/// Structural validation of a KU value.
///
/// Returns the full list of violations so the ingest API can surface them
/// all at once. Signature verification is separate ([`crate::sign`]).
pub fn validate_ku(value: &Value) -> Result<(), Vec<String>> {
    let obj = match value.as_object() {
        Some(obj) => obj,
        None => return Err(vec!["ku must be a JSON object".to_string()]),
    };

    let mut details = Vec::new();
    for field in REQUIRED_FIELDS {
        if !obj.contains_key(*field) {
            details.push(format!("missing field: {field}"));
        }
    }
    for field in STRING_FIELDS {
        if let Some(v) = obj.get(*field) {
            if !v.is_string() {
                details.push(format!("field {field} must be a string"));
            }
        }
    }
    for field in ARRAY_FIELDS {
        if let Some(v) = obj.get(*field) {
            if !v.is_array() {
                details.push(format!("field {field} must be an array"));
            }
        }
    }
    for field in OBJECT_FIELDS {
        if let Some(v) = obj.get(*field) {
            if !v.is_object() {
                details.push(format!("field {field} must be an object"));
            }
        }
    }

    if details.is_empty() {
        Ok(())
    } else {
        Err(details)
    }
}
