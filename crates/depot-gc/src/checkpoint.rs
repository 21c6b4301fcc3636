//! Checkpoint persistence for `mark_only`/`sweep_only` runs: the mark phase's results
//! (candidate blobs, queued layer links, queued untagged manifests) survive a process
//! restart as a single JSON document written atomically (write-tmp-then-rename, the same
//! pattern the backend's upload commit uses for its finalized blob).
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use depot_core::OciDigest;

use crate::errors::{Error, Result};
use crate::mark::MarkResult;

const CHECKPOINT_VERSION: u32 = 1;
const STALE_AFTER_DAYS: i64 = 7;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CheckpointStats {
    pub repositories_marked: usize,
    pub manifests_marked: usize,
    pub blobs_marked: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    pub timestamp: DateTime<Utc>,
    pub mark_phase_complete: bool,
    pub stats: CheckpointStats,
    /// Blob digests not reachable from any mark root, as of the mark phase. Re-verified
    /// against the live mark set before being deleted, so a repository populated after the
    /// checkpoint was written can't lose a blob a concurrent push just referenced.
    pub deletion_candidates: Vec<OciDigest>,
    /// `(repository, digest)` layer links queued for removal because the repository no
    /// longer references that digest.
    pub layer_links_to_delete: Vec<(String, OciDigest)>,
    /// `(repository, digest)` manifest revisions queued for removal because
    /// `remove_untagged` found no current tag pointing at them.
    pub untagged_manifests_to_delete: Vec<(String, OciDigest)>,
}

impl Checkpoint {
    pub fn from_mark_result(result: &MarkResult, mark_phase_complete: bool) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            timestamp: Utc::now(),
            mark_phase_complete,
            stats: CheckpointStats {
                repositories_marked: result.repositories_marked,
                manifests_marked: result.manifests_marked,
                blobs_marked: result.mark_set.len(),
            },
            deletion_candidates: Vec::new(),
            layer_links_to_delete: result.layer_links_to_delete.clone(),
            untagged_manifests_to_delete: result.untagged_manifests_to_delete.clone(),
        }
    }

    fn path(dir: &Path) -> PathBuf {
        dir.join("checkpoint.json")
    }

    pub async fn write(&self, dir: &Path) -> Result<()> {
        tokio::fs::create_dir_all(dir).await?;
        let path = Self::path(dir);
        let bytes = serde_json::to_vec_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    /// Reads and validates a checkpoint for `sweep_only` resume: must exist, must be no
    /// older than [`STALE_AFTER_DAYS`], and must have completed its mark phase.
    pub async fn read_for_sweep(dir: &Path) -> Result<Self> {
        let path = Self::path(dir);
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|_| Error::CheckpointMissing(path.display().to_string()))?;
        let checkpoint: Checkpoint = serde_json::from_slice(&bytes)?;

        if !checkpoint.mark_phase_complete {
            return Err(Error::MarkPhaseIncomplete(path.display().to_string()));
        }
        let age = Utc::now().signed_duration_since(checkpoint.timestamp);
        if age > chrono::Duration::days(STALE_AFTER_DAYS) {
            return Err(Error::CheckpointStale(path.display().to_string()));
        }
        Ok(checkpoint)
    }
}
