//! Phase 2 (candidate enumeration) and phase 3 (sweep): walk the global blob namespace for
//! everything the mark phase didn't reach, then -- unless `dry_run` -- delete it along with
//! the per-repository cleanup candidates the mark phase queued.
use std::collections::HashSet;
use std::sync::Arc;

use depot_backend_fs::{GlobalBlobStore, LinkNamespace};
use depot_core::{OciDigest, PathMapper, PathSpec};
use depot_objectstore::{Key, ObjectStore};
use tokio_util::sync::CancellationToken;

use crate::errors::{Error, Result};
use crate::progress::ProgressCounters;

/// How many blobs may be visited during candidate enumeration between cancellation checks.
const CANCEL_CHECK_INTERVAL: usize = 10_000;

#[derive(Debug, Default)]
pub struct SweepStats {
    pub manifests_deleted: usize,
    pub blobs_deleted: usize,
    pub bytes_freed: u64,
    pub layer_links_deleted: usize,
}

/// Walks every digest in the global blob pool, returning those absent from `mark_set`.
pub async fn enumerate_candidates(
    objects: &Arc<dyn ObjectStore>,
    mark_set: &HashSet<OciDigest>,
    cancel: &CancellationToken,
) -> Result<Vec<OciDigest>> {
    let paths = PathMapper::new();
    let root = Key::try_from(paths.path(&PathSpec::BlobsRoot).as_str())?;

    let mut keys = Vec::new();
    objects
        .walk(&root, &mut |k| {
            keys.push(k);
            Ok(())
        })
        .await?;

    let mut candidates = Vec::new();
    for (i, key) in keys.iter().enumerate() {
        if i % CANCEL_CHECK_INTERVAL == 0 && cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if let Some(digest) = digest_from_blob_data_key(key) {
            if !mark_set.contains(&digest) {
                candidates.push(digest);
            }
        }
    }
    Ok(candidates)
}

/// Parses `v2/blobs/<algo>/<prefix>/<hex>/data` back into its digest. Returns `None` for any
/// other object under the blob namespace (there shouldn't be any, but a foreign file placed
/// there by an operator is simply ignored rather than crashing the walk).
fn digest_from_blob_data_key(key: &Key) -> Option<OciDigest> {
    let s = key.to_string();
    let parts: Vec<&str> = s.split('/').collect();
    if parts.len() < 4 || *parts.last()? != "data" {
        return None;
    }
    let algo = parts[parts.len() - 4];
    let hex = parts[parts.len() - 2];
    OciDigest::try_from(format!("{algo}:{hex}").as_str()).ok()
}

/// Deletes everything the mark and candidate-enumeration phases queued. Skipped entirely
/// when `dry_run` -- callers check that before calling this.
pub async fn sweep(
    objects: &Arc<dyn ObjectStore>,
    delete_set: &[OciDigest],
    layer_links_to_delete: &[(String, OciDigest)],
    untagged_manifests_to_delete: &[(String, OciDigest)],
    cancel: &CancellationToken,
    progress: &ProgressCounters,
) -> Result<SweepStats> {
    let paths = PathMapper::new();
    let global = GlobalBlobStore::new(objects.clone());
    let mut stats = SweepStats::default();

    for (repository, digest) in untagged_manifests_to_delete {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        delete_untagged_manifest(objects, &paths, repository, digest).await?;
        stats.manifests_deleted += 1;
        progress.add_manifest_deleted();
    }

    for (repository, digest) in layer_links_to_delete {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let link = LinkNamespace::Layers.link_key(&paths, repository, digest)?;
        objects.delete(&link).await?;
        stats.layer_links_deleted += 1;
    }

    for digest in delete_set {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let size = global.stat(digest).await.ok().flatten().unwrap_or(0);
        let data_key = Key::try_from(paths.path(&PathSpec::BlobData { digest }).as_str())?;
        objects.delete(&data_key).await?;
        stats.blobs_deleted += 1;
        stats.bytes_freed += size;
        progress.add_blob_deleted();
    }

    Ok(stats)
}

/// Removes a manifest revision's link and every per-tag index entry referencing it, without
/// touching its current tag pointer (there is none, by construction -- the digest is only
/// queued here because [`crate::mark`] found no tag whose current revision is this digest).
async fn delete_untagged_manifest(
    objects: &Arc<dyn ObjectStore>,
    paths: &PathMapper,
    repository: &str,
    digest: &OciDigest,
) -> Result<()> {
    let tags_root = Key::try_from(paths.path(&PathSpec::ManifestTagsRoot { name: repository }).as_str())?;
    for tag in objects.list(&tags_root).await? {
        let entry = Key::try_from(
            paths
                .path(&PathSpec::ManifestTagIndexEntryLink { name: repository, tag: &tag, digest })
                .as_str(),
        )?;
        objects.delete_prefix(&entry).await?;
    }

    let revision_link = LinkNamespace::ManifestRevisions.link_key(paths, repository, digest)?;
    objects.delete(&revision_link).await?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use depot_objectstore::memory::InMemory;

    #[tokio::test]
    async fn digest_round_trips_through_blob_data_key() {
        let paths = PathMapper::new();
        let digest: OciDigest = "sha256:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"
            .try_into()
            .unwrap();
        let key = Key::try_from(paths.path(&PathSpec::BlobData { digest: &digest }).as_str()).unwrap();
        assert_eq!(digest_from_blob_data_key(&key), Some(digest));
    }

    #[tokio::test]
    async fn enumerate_candidates_skips_marked_digests() {
        let objects: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let global = GlobalBlobStore::new(objects.clone());
        let kept = global.put(bytes::Bytes::from("keep")).await.unwrap();
        let orphan = global.put(bytes::Bytes::from("orphan")).await.unwrap();

        let mut mark_set = HashSet::new();
        mark_set.insert(kept);

        let cancel = CancellationToken::new();
        let candidates = enumerate_candidates(&objects, &mark_set, &cancel).await.unwrap();
        assert_eq!(candidates, vec![orphan]);
    }
}
