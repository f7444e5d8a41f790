//! Error types for SGN core operations

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// SGN core error types
#[derive(Debug, Error)]
pub enum Error {
    /// Canonical encoding rejected a non-finite float (NaN or ±Inf)
    #[error("non-finite float is not representable in canonical CBOR")]
    NonFiniteFloat,

    /// Value handed to a KU operation was not a JSON object
    #[error("expected a JSON object, got {0}")]
    NotAnObject(&'static str),

    /// CID string failed strict parsing
    #[error("invalid cid {cid:?}: {reason}")]
    InvalidCid { cid: String, reason: String },

    /// Public key could not be decoded (bad SPKI DER / PEM)
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    /// JSON (de)serialization error
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
