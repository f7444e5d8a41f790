//! sgnd - SGN Knowledge Unit Gossip Daemon
//!
//! This daemon provides:
//! - Durable content-addressed KU storage with an outbox queue
//! - A publish pipeline (validate, verify, policy, dedup, persist, enqueue)
//! - Signing-key trust policy with file-backed reload
//! - HTTP ingestion API and WebSocket subscriber fan-out
//! - ACK-based delivery accounting with per-subscriber cursors

pub mod config;
pub mod http;
pub mod hub;
pub mod metrics;
pub mod peer;
pub mod pipeline;
pub mod rotation;
pub mod seen;
pub mod server;
pub mod storage;
pub mod trust;

pub use config::Config;
pub use metrics::Metrics;
pub use pipeline::Pipeline;
pub use seen::SeenCache;
pub use server::Daemon;
pub use storage::Storage;
pub use trust::TrustStore;
