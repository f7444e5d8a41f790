//! Durable publish pipeline
//!
//! ingest -> validate -> verify -> policy -> cid -> dedup -> persist ->
//! enqueue -> notify fan-out. The HTTP layer maps the typed outcome and
//! error kinds onto status codes; nothing in here touches the transport.

use crate::hub::Hub;
use crate::metrics::Metrics;
use crate::rotation;
use crate::seen::SeenCache;
use crate::storage::{Storage, StorageError};
use crate::trust::{TrustMode, TrustStore};
use serde::Serialize;
use serde_json::Value;
use sgn_core::cid::cid_for_value;
use sgn_core::sign::{key_id, verify_value, verifying_key_from_pem};
use sgn_core::types::{validate_ku, KU_TYPE_ROTATE_KEY};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Transient storage writes are retried this many times with growing delays
const PUT_RETRIES: u32 = 3;
const PUT_BACKOFF_BASE: Duration = Duration::from_millis(50);

/// KUs above this estimated size hash/verify on the blocking pool so the
/// I/O scheduler never stalls on canonicalization
const LARGE_KU_BYTES: usize = 256 * 1024;

/// Publish pipeline errors; the HTTP layer owns the status-code mapping
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("invalid ku")]
    InvalidKu(Vec<String>),
    #[error("bad signature: {0}")]
    BadSignature(&'static str),
    #[error("bad public key: {0}")]
    BadPublicKey(String),
    #[error("untrusted key: {0}")]
    Untrusted(&'static str),
    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Core(#[from] sgn_core::Error),
    #[error("internal: {0}")]
    Internal(String),
}

/// Publish request as received by the ingest API
#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub ku: Value,
    pub verify: bool,
    pub pub_pem: Option<String>,
}

/// Publish outcome; serializes to the `/publish` 200 body
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PublishOutcome {
    pub cid: String,
    pub stored: bool,
    pub enqueued: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub deduplicated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trusted: Option<bool>,
}

/// `/verify` 200 body
#[derive(Debug, Clone, Serialize)]
pub struct VerifyReport {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
    pub trusted: bool,
    pub key_id: String,
}

/// The publish path: single writer over the store, shared by HTTP handlers
/// and peer subscriber tasks.
pub struct Pipeline {
    storage: Arc<Storage>,
    trust: Arc<TrustStore>,
    seen: Arc<SeenCache>,
    metrics: Arc<Metrics>,
    hub: Arc<Hub>,
}

impl Pipeline {
    pub fn new(
        storage: Arc<Storage>,
        trust: Arc<TrustStore>,
        seen: Arc<SeenCache>,
        metrics: Arc<Metrics>,
        hub: Arc<Hub>,
    ) -> Self {
        Self {
            storage,
            trust,
            seen,
            metrics,
            hub,
        }
    }

    /// Run one KU through the full publish pipeline.
    pub async fn publish(&self, request: PublishRequest) -> Result<PublishOutcome, PublishError> {
        validate_ku(&request.ku).map_err(PublishError::InvalidKu)?;
        let large = json_weight(&request.ku) > LARGE_KU_BYTES;

        let mut trusted = None;
        if request.verify {
            trusted = Some(self.check_signature_and_policy(&request, large).await?);
        }

        let cid = if large {
            let ku = request.ku.clone();
            tokio::task::spawn_blocking(move || cid_for_value(&ku))
                .await
                .map_err(|e| PublishError::Internal(e.to_string()))??
        } else {
            cid_for_value(&request.ku)?
        };

        // Fast dedup shortcut; entries only exist for CIDs already persisted
        if self.seen.has_seen(&cid) {
            Metrics::incr(&self.metrics.kus_deduplicated_total);
            return Ok(PublishOutcome {
                cid,
                stored: false,
                enqueued: false,
                deduplicated: true,
                trusted,
            });
        }

        let outcome = self.put_with_retry(&cid, &request.ku).await?;
        self.seen.mark_seen(&cid);

        if let Some(seq) = outcome.seq {
            Metrics::incr(&self.metrics.db_ku_stored_total);
            self.metrics
                .outbox_queue_len
                .store(self.storage.outbox_len() as u64, std::sync::atomic::Ordering::Relaxed);
            self.hub.notify(seq);
            self.apply_rotation_if_any(&request);
        } else {
            Metrics::incr(&self.metrics.kus_deduplicated_total);
        }

        Ok(PublishOutcome {
            cid,
            stored: outcome.stored,
            enqueued: outcome.stored,
            deduplicated: !outcome.stored,
            trusted,
        })
    }

    /// Signature + trust policy for `verify=true` publishes. Returns the
    /// trusted flag; enforce-mode rejections become errors, warn-mode
    /// rejections are logged and accepted.
    async fn check_signature_and_policy(
        &self,
        request: &PublishRequest,
        large: bool,
    ) -> Result<bool, PublishError> {
        let pem = request
            .pub_pem
            .as_deref()
            .ok_or(PublishError::BadSignature("missing_pubkey"))?;
        let key = verifying_key_from_pem(pem)
            .map_err(|e| PublishError::BadPublicKey(e.to_string()))?;

        let verdict = if large {
            let ku = request.ku.clone();
            tokio::task::spawn_blocking(move || verify_value(&ku, &key))
                .await
                .map_err(|e| PublishError::Internal(e.to_string()))??
        } else {
            verify_value(&request.ku, &key)?
        };
        if let Err(failure) = verdict {
            return Err(PublishError::BadSignature(failure.reason()));
        }

        let kid = key_id(&key)?;
        let decision = self.trust.is_trusted(&kid);
        if decision.trusted {
            return Ok(true);
        }

        let reason = decision.reason.unwrap_or("untrusted");
        match self.trust.mode() {
            TrustMode::Enforce => Err(PublishError::Untrusted(reason)),
            TrustMode::Warn => {
                warn!(key_id = %kid, reason, "accepting ku from untrusted key (warn mode)");
                Ok(false)
            }
        }
    }

    async fn put_with_retry(
        &self,
        cid: &str,
        ku: &Value,
    ) -> Result<crate::storage::PutOutcome, StorageError> {
        let mut attempt = 0;
        loop {
            let started = std::time::Instant::now();
            match self.storage.put(cid, ku) {
                Ok(outcome) => {
                    self.metrics.db_write.record_since(started);
                    return Ok(outcome);
                }
                Err(e) if attempt + 1 < PUT_RETRIES => {
                    attempt += 1;
                    let delay = PUT_BACKOFF_BASE * 4u32.pow(attempt - 1);
                    warn!(cid, attempt, error = %e, "storage put failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Key-rotation attestations mutate trust when the caller supplied the
    /// previous key. Failures never unwind an already-persisted publish.
    fn apply_rotation_if_any(&self, request: &PublishRequest) {
        let kind = request.ku.get("type").and_then(Value::as_str);
        if kind != Some(KU_TYPE_ROTATE_KEY) {
            return;
        }
        let Some(pem) = request.pub_pem.as_deref() else {
            debug!("rotation ku stored without pub_pem, trust unchanged");
            return;
        };
        match rotation::process_rotation(&self.trust, &request.ku, pem) {
            Ok(outcome) => {
                debug!(new_key = %outcome.new_key_id, revoked_prev = outcome.revoked_prev,
                    "key rotation applied");
            }
            Err(e) => warn!(error = %e, "rotation attestation rejected"),
        }
    }

    /// Signature + trust report for the `/verify` route.
    pub fn verify(&self, ku: &Value, pub_pem: &str) -> Result<VerifyReport, PublishError> {
        let key = verifying_key_from_pem(pub_pem)
            .map_err(|e| PublishError::BadPublicKey(e.to_string()))?;
        let kid = key_id(&key)?;

        let verdict = verify_value(ku, &key)?;
        let decision = self.trust.is_trusted(&kid);

        Ok(VerifyReport {
            ok: verdict.is_ok(),
            reason: verdict.err().map(|f| f.reason()),
            trusted: decision.trusted,
            key_id: kid,
        })
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub fn trust(&self) -> &Arc<TrustStore> {
        &self.trust
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }
}

/// Cheap lower-bound estimate of a value's serialized size, used to route
/// oversized KUs onto the blocking pool.
fn json_weight(value: &Value) -> usize {
    match value {
        Value::Null | Value::Bool(_) => 4,
        Value::Number(_) => 8,
        Value::String(s) => s.len() + 2,
        Value::Array(items) => 2 + items.iter().map(json_weight).sum::<usize>(),
        Value::Object(map) => {
            2 + map
                .iter()
                .map(|(k, v)| k.len() + 3 + json_weight(v))
                .sum::<usize>()
        }
    }
}
