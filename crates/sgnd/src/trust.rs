//! Signing-key trust policy
//!
//! File-backed allow/revoke lists with per-key expiry. The in-memory view
//! sits under one read-write lock; reads dominate (every verified publish),
//! writes happen on explicit mutation, reload, or the mtime watcher.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use thiserror::Error;
use tracing::{info, warn};

/// Trust errors
#[derive(Debug, Error)]
pub enum TrustError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("trust file parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Policy mode: reject unknown keys, or log and accept
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustMode {
    Enforce,
    #[default]
    Warn,
}

/// Per-key policy entry
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KeyEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub revoked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// On-disk trust document
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TrustFile {
    #[serde(default)]
    pub mode: TrustMode,
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub revoke: Vec<String>,
    #[serde(default)]
    pub keys: HashMap<String, KeyEntry>,
}

/// Outcome of a trust check
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TrustDecision {
    pub trusted: bool,
    pub reason: Option<&'static str>,
}

impl TrustDecision {
    fn ok() -> Self {
        Self {
            trusted: true,
            reason: None,
        }
    }

    fn rejected(reason: &'static str) -> Self {
        Self {
            trusted: false,
            reason: Some(reason),
        }
    }
}

struct Inner {
    file: TrustFile,
    loaded_mtime: Option<SystemTime>,
}

/// Mutable, file-backed trust policy
pub struct TrustStore {
    path: PathBuf,
    inner: RwLock<Inner>,
}

impl TrustStore {
    /// Load the trust file; a missing file yields defaults (`warn`, empty).
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, TrustError> {
        let path = path.into();
        let (file, mtime) = read_trust_file(&path)?;
        Ok(Self {
            path,
            inner: RwLock::new(Inner {
                file,
                loaded_mtime: mtime,
            }),
        })
    }

    /// Current policy mode
    pub fn mode(&self) -> TrustMode {
        self.inner.read().file.mode
    }

    /// Trust check for a signing key, in policy order: revoked, expired,
    /// allow-list (enforce mode only).
    pub fn is_trusted(&self, key_id: &str) -> TrustDecision {
        let inner = self.inner.read();
        let file = &inner.file;

        let entry = file.keys.get(key_id);
        if file.revoke.iter().any(|k| k == key_id) || entry.map(|e| e.revoked).unwrap_or(false) {
            return TrustDecision::rejected("revoked");
        }
        if let Some(expires_at) = entry.and_then(|e| e.expires_at) {
            if expires_at <= Utc::now() {
                return TrustDecision::rejected("expired");
            }
        }
        if file.mode == TrustMode::Enforce && !file.allow.iter().any(|k| k == key_id) {
            return TrustDecision::rejected("not_in_allowlist");
        }
        TrustDecision::ok()
    }

    /// Add a key to the allow-list, optionally with an expiry
    pub fn add(&self, key_id: &str, expires_at: Option<DateTime<Utc>>) -> Result<(), TrustError> {
        let mut inner = self.inner.write();
        if !inner.file.allow.iter().any(|k| k == key_id) {
            inner.file.allow.push(key_id.to_string());
        }
        if expires_at.is_some() {
            inner.file.keys.entry(key_id.to_string()).or_default().expires_at = expires_at;
        }
        self.persist_locked(&mut inner)
    }

    /// Revoke a key with a reason
    pub fn revoke(&self, key_id: &str, reason: &str) -> Result<(), TrustError> {
        let mut inner = self.inner.write();
        if !inner.file.revoke.iter().any(|k| k == key_id) {
            inner.file.revoke.push(key_id.to_string());
        }
        let entry = inner.file.keys.entry(key_id.to_string()).or_default();
        entry.revoked = true;
        entry.reason = Some(reason.to_string());
        self.persist_locked(&mut inner)
    }

    /// Set or replace a key's expiry
    pub fn set_expiry(&self, key_id: &str, ts: DateTime<Utc>) -> Result<(), TrustError> {
        let mut inner = self.inner.write();
        inner.file.keys.entry(key_id.to_string()).or_default().expires_at = Some(ts);
        self.persist_locked(&mut inner)
    }

    /// Re-read the trust file from disk
    pub fn reload(&self) -> Result<(), TrustError> {
        let (file, mtime) = read_trust_file(&self.path)?;
        let mut inner = self.inner.write();
        inner.file = file;
        inner.loaded_mtime = mtime;
        info!(path = %self.path.display(), "trust policy reloaded");
        Ok(())
    }

    /// Reload only when the file's mtime moved since the last load
    pub fn maybe_reload(&self) -> Result<bool, TrustError> {
        let mtime = std::fs::metadata(&self.path)
            .and_then(|m| m.modified())
            .ok();
        let stale = {
            let inner = self.inner.read();
            mtime.is_some() && mtime != inner.loaded_mtime
        };
        if stale {
            self.reload()?;
        }
        Ok(stale)
    }

    fn persist_locked(&self, inner: &mut Inner) -> Result<(), TrustError> {
        let bytes = serde_json::to_vec_pretty(&inner.file)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &self.path)?;
        inner.loaded_mtime = std::fs::metadata(&self.path)
            .and_then(|m| m.modified())
            .ok();
        Ok(())
    }
}

fn read_trust_file(path: &Path) -> Result<(TrustFile, Option<SystemTime>), TrustError> {
    if !path.exists() {
        warn!(path = %path.display(), "trust file missing, starting with warn-mode defaults");
        return Ok((TrustFile::default(), None));
    }
    let bytes = std::fs::read(path)?;
    let file: TrustFile = serde_json::from_slice(&bytes)?;
    let mtime = std::fs::metadata(path).and_then(|m| m.modified()).ok();
    Ok((file, mtime))
}
