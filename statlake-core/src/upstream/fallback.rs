//! On-disk cache of last good payloads, used when the upstream is unavailable.
//!
//! Layout: `{cache_dir}/dataset={ID}/payload.bin` plus a `meta.json` sidecar.
//!
//! - Atomic writes (write to .tmp, rename into place)
//! - BLAKE3 content hash in the sidecar, verified on load
//! - Corrupt payloads are quarantined (`payload.bin.quarantined`)

use super::provider::{Payload, PayloadSource, UpstreamError};
use crate::fingerprint::content_hash;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Sidecar describing a cached payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FallbackMeta {
    pub dataset_id: String,
    pub byte_len: usize,
    pub data_hash: String,
    pub content_type: Option<String>,
    pub fetched_at: DateTime<Utc>,
}

/// Directory of last good payloads, one subdirectory per dataset.
#[derive(Debug, Clone)]
pub struct FallbackCache {
    cache_dir: PathBuf,
}

impl FallbackCache {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// `{cache_dir}/dataset={ID}/`. Callers pass validated ids only.
    fn dataset_dir(&self, dataset_id: &str) -> PathBuf {
        self.cache_dir.join(format!("dataset={dataset_id}"))
    }

    fn payload_path(&self, dataset_id: &str) -> PathBuf {
        self.dataset_dir(dataset_id).join("payload.bin")
    }

    fn meta_path(&self, dataset_id: &str) -> PathBuf {
        self.dataset_dir(dataset_id).join("meta.json")
    }

    /// Store a live payload. The payload file is renamed into place before the
    /// sidecar, so a crash in between leaves a hash mismatch that load() quarantines.
    pub fn store(&self, payload: &Payload) -> Result<(), UpstreamError> {
        let dir = self.dataset_dir(&payload.dataset_id);
        fs::create_dir_all(&dir)
            .map_err(|e| UpstreamError::Fallback(format!("failed to create dir: {e}")))?;

        let meta = FallbackMeta {
            dataset_id: payload.dataset_id.clone(),
            byte_len: payload.body.len(),
            data_hash: content_hash(&payload.body),
            content_type: payload.content_type.clone(),
            fetched_at: payload.fetched_at,
        };
        let meta_json = serde_json::to_vec_pretty(&meta)
            .map_err(|e| UpstreamError::Fallback(format!("meta serialization: {e}")))?;

        write_atomic(&self.payload_path(&payload.dataset_id), &payload.body)?;
        write_atomic(&self.meta_path(&payload.dataset_id), &meta_json)?;
        Ok(())
    }

    /// Load the last good payload for `dataset_id`, if a valid one exists.
    ///
    /// The returned payload is not yet marked degraded; the client does that
    /// with the live failure reason.
    pub fn load(&self, dataset_id: &str) -> Result<Option<Payload>, UpstreamError> {
        let payload_path = self.payload_path(dataset_id);
        if !payload_path.exists() {
            return Ok(None);
        }

        let Some(meta) = self.get_meta(dataset_id) else {
            self.quarantine(&payload_path, "missing or unreadable meta.json");
            return Ok(None);
        };

        let body = fs::read(&payload_path)
            .map_err(|e| UpstreamError::Fallback(format!("read payload: {e}")))?;

        if meta.byte_len != body.len() || meta.data_hash != content_hash(&body) {
            self.quarantine(&payload_path, "content hash mismatch");
            return Ok(None);
        }

        Ok(Some(Payload {
            dataset_id: dataset_id.to_string(),
            body,
            content_type: meta.content_type,
            source: PayloadSource::FallbackCache,
            degraded: false,
            degraded_reason: None,
            fetched_at: meta.fetched_at,
        }))
    }

    pub fn get_meta(&self, dataset_id: &str) -> Option<FallbackMeta> {
        let content = fs::read_to_string(self.meta_path(dataset_id)).ok()?;
        serde_json::from_str(&content).ok()
    }

    pub fn contains(&self, dataset_id: &str) -> bool {
        self.payload_path(dataset_id).exists()
    }

    /// Move a corrupt payload aside. Returns false when it stays in place;
    /// load() keeps rejecting it either way.
    fn quarantine(&self, path: &Path, reason: &str) -> bool {
        let quarantine = path.with_extension("bin.quarantined");
        tracing::warn!(
            path = %path.display(),
            reason,
            "quarantining corrupt fallback payload"
        );
        if let Err(e) = fs::rename(path, &quarantine) {
            tracing::warn!(
                path = %path.display(),
                target = %quarantine.display(),
                error = %e,
                "failed to quarantine fallback payload"
            );
            return false;
        }
        true
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), UpstreamError> {
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, bytes)
        .map_err(|e| UpstreamError::Fallback(format!("write {}: {e}", tmp_path.display())))?;
    fs::rename(&tmp_path, path).map_err(|e| {
        let _ = fs::remove_file(&tmp_path);
        UpstreamError::Fallback(format!("atomic rename failed: {e}"))
    })
}
