//! SGN Core Library
//!
//! This crate provides the data model, canonical encoding, and cryptographic
//! primitives for Knowledge Units (KUs): signed, content-addressed JSON
//! documents replicated between SGN daemons.
//!
//! # Modules
//!
//! - [`types`]: KU record, signature header, structural validation
//! - [`canonical`]: Deterministic CBOR encoding for hashing/signing
//! - [`cid`]: Content identifier derivation and strict parsing
//! - [`sign`]: Ed25519 detached signatures and key identifiers
//! - [`error`]: Error types
//!
//! Everything here is stateless and does no I/O; the daemon crate (`sgnd`)
//! owns all storage and transport.

pub mod canonical;
pub mod cid;
pub mod error;
pub mod sign;
pub mod types;

pub use error::{Error, Result};
pub use sign::VerifyFailure;
pub use types::{Ku, Sig};
