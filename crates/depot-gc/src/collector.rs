//! Top-level orchestration: validates options, takes the distributed lock (if configured),
//! runs whichever phases `GcOptions` selects, and reports progress via `tracing` the way the
//! teacher's request-handling paths do.
use std::sync::Arc;
use std::time::{Duration, Instant};

use depot_backend_fs::FsRepositoryStoreManager;
use depot_objectstore::ObjectStore;
use tokio_util::sync::CancellationToken;

use crate::checkpoint::Checkpoint;
use crate::errors::{Error, Result};
use crate::lock::GcLock;
use crate::mark::{self, MarkResult};
use crate::options::GcOptions;
use crate::progress::{self, ProgressCounters};
use crate::sweep::{self, SweepStats};

/// Summary of one collector run, returned to the caller (and what the CLI prints).
#[derive(Debug, Default)]
pub struct GcReport {
    pub repositories_marked: usize,
    pub manifests_marked: usize,
    pub blobs_marked: usize,
    pub manifests_deleted: usize,
    pub layer_links_deleted: usize,
    pub blobs_deleted: usize,
    pub bytes_freed: u64,
    pub dry_run: bool,
}

pub struct GarbageCollector {
    manager: FsRepositoryStoreManager,
    objects: Arc<dyn ObjectStore>,
    options: GcOptions,
}

impl GarbageCollector {
    pub fn new(manager: FsRepositoryStoreManager, objects: Arc<dyn ObjectStore>, options: GcOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self { manager, objects, options })
    }

    pub async fn run(&self, cancel: CancellationToken) -> Result<GcReport> {
        let lock = match &self.options.checkpoint_dir {
            Some(dir) => Some(GcLock::acquire(dir, self.options.timeout).await?),
            None => None,
        };

        let result = self.run_inner(&cancel).await;

        if let Some(lock) = lock {
            lock.release().await?;
        }
        result
    }

    async fn run_inner(&self, cancel: &CancellationToken) -> Result<GcReport> {
        let deadline = Instant::now() + self.options.timeout;
        let counters = Arc::new(ProgressCounters::default());
        let progress = tokio::spawn(progress::report(
            counters.clone(),
            self.options.progress_interval,
            cancel.clone(),
        ));

        let outcome = self.execute(cancel, deadline, &counters).await;

        progress.abort();
        outcome
    }

    async fn execute(&self, cancel: &CancellationToken, deadline: Instant, progress: &ProgressCounters) -> Result<GcReport> {
        if self.options.sweep_only {
            return self.sweep_only(cancel, progress).await;
        }

        let mark_result = mark::mark(&self.manager, &self.objects, &self.options, cancel, progress).await?;
        check_deadline(deadline)?;

        let delete_set = sweep::enumerate_candidates(&self.objects, &mark_result.mark_set, cancel).await?;
        check_deadline(deadline)?;

        if self.options.mark_only {
            let dir = self
                .options
                .checkpoint_dir
                .as_ref()
                .expect("validated: mark_only requires checkpoint_dir");
            let mut checkpoint = Checkpoint::from_mark_result(&mark_result, true);
            checkpoint.deletion_candidates = delete_set;
            checkpoint.write(dir).await?;
            return Ok(report_from_mark(&mark_result, delete_set_len(&checkpoint)));
        }

        self.finish(cancel, mark_result, delete_set, progress).await
    }

    async fn sweep_only(&self, cancel: &CancellationToken, progress: &ProgressCounters) -> Result<GcReport> {
        let dir = self
            .options
            .checkpoint_dir
            .as_ref()
            .expect("validated: sweep_only requires checkpoint_dir");
        let checkpoint = Checkpoint::read_for_sweep(dir).await?;

        // Re-mark so a blob referenced by a push that landed after the checkpoint was
        // written is never swept out from under it (the race-safe resume case).
        let fresh = mark::mark(&self.manager, &self.objects, &self.options, cancel, progress).await?;
        let delete_set: Vec<_> = checkpoint
            .deletion_candidates
            .into_iter()
            .filter(|d| !fresh.mark_set.contains(d))
            .collect();

        self.finish(cancel, fresh, delete_set, progress).await
    }

    async fn finish(
        &self,
        cancel: &CancellationToken,
        mark_result: MarkResult,
        delete_set: Vec<depot_core::OciDigest>,
        progress: &ProgressCounters,
    ) -> Result<GcReport> {
        let mut report = GcReport {
            repositories_marked: mark_result.repositories_marked,
            manifests_marked: mark_result.manifests_marked,
            blobs_marked: mark_result.mark_set.len(),
            dry_run: self.options.dry_run,
            ..Default::default()
        };

        if self.options.dry_run {
            report.manifests_deleted = mark_result.untagged_manifests_to_delete.len();
            report.layer_links_deleted = mark_result.layer_links_to_delete.len();
            report.blobs_deleted = delete_set.len();
            return Ok(report);
        }

        let sweep_stats: SweepStats = sweep::sweep(
            &self.objects,
            &delete_set,
            &mark_result.layer_links_to_delete,
            &mark_result.untagged_manifests_to_delete,
            cancel,
            progress,
        )
        .await?;

        report.manifests_deleted = sweep_stats.manifests_deleted;
        report.layer_links_deleted = sweep_stats.layer_links_deleted;
        report.blobs_deleted = sweep_stats.blobs_deleted;
        report.bytes_freed = sweep_stats.bytes_freed;
        Ok(report)
    }
}

fn delete_set_len(checkpoint: &Checkpoint) -> usize {
    checkpoint.deletion_candidates.len()
}

fn report_from_mark(mark_result: &MarkResult, candidates: usize) -> GcReport {
    GcReport {
        repositories_marked: mark_result.repositories_marked,
        manifests_marked: mark_result.manifests_marked,
        blobs_marked: mark_result.mark_set.len(),
        blobs_deleted: candidates,
        dry_run: true,
        ..Default::default()
    }
}

fn check_deadline(deadline: Instant) -> Result<()> {
    if Instant::now() > deadline {
        return Err(Error::Timeout);
    }
    Ok(())
}

/// End-to-end mark-and-sweep scenarios run against an in-memory object store, exercising
/// [`GarbageCollector`] the way an operator would: build up repository content with the same
/// stores `depot-backend-fs` exposes to callers, then run GC and assert on what survives.
#[cfg(test)]
mod test {
    use super::*;
    use bytes::Bytes;
    use oci_spec::image::{ConfigBuilder, Descriptor, ImageIndexBuilder, ImageManifestBuilder, MediaType};

    use depot_backend_fs::{FsManifestStore, FsRepositoryStoreManager, FsTagStore, GlobalBlobStore, LinkedBlobStore};
    use depot_core::registry::{BlobStore, ManifestRef, ManifestSpec, ManifestStore, RepositoryStoreManager, TagStore};
    use depot_core::{NoopCache, OciDigest, Options, PathMapper, PathSpec};
    use depot_objectstore::memory::InMemory;
    use depot_objectstore::Key;

    fn objects() -> Arc<dyn ObjectStore> {
        Arc::new(InMemory::new())
    }

    fn manager(objects: Arc<dyn ObjectStore>) -> FsRepositoryStoreManager {
        FsRepositoryStoreManager::new(objects, Options::default())
    }

    /// Writes `content` as a layer/config blob linked into `repo`'s layer namespace,
    /// returning its digest -- the same path a config or layer PUT takes before the manifest
    /// referencing it is ever built.
    async fn put_layer(objects: &Arc<dyn ObjectStore>, repo: &str, content: &str) -> OciDigest {
        let mut blobs = LinkedBlobStore::new(
            objects.clone(),
            repo.to_string(),
            Arc::new(NoopCache),
            true,
            Options::default(),
        );
        blobs.put(Bytes::from(content.to_string())).await.unwrap()
    }

    fn image_manifest(config: &Descriptor, layers: Vec<Descriptor>) -> (ManifestSpec, Bytes) {
        let manifest = ImageManifestBuilder::default()
            .schema_version(2_u32)
            .media_type(MediaType::ImageManifest)
            .config(config.clone())
            .layers(layers)
            .build()
            .unwrap();
        let bytes = Bytes::from(serde_json::to_vec(&manifest).unwrap());
        (ManifestSpec::Image(manifest), bytes)
    }

    fn descriptor_for(digest: &OciDigest, size: i64, media_type: MediaType) -> Descriptor {
        ConfigBuilder::default()
            .media_type(media_type)
            .size(size)
            .digest(digest.to_string())
            .build()
            .unwrap()
    }

    async fn put_image(objects: &Arc<dyn ObjectStore>, repo: &str, tag: Option<&str>, layer_contents: &[&str]) -> OciDigest {
        let config_digest = put_layer(objects, repo, &format!("config-for-{repo}-{layer_contents:?}")).await;
        let config_size = layer_contents.join("").len() as i64 + 1;
        let config = descriptor_for(&config_digest, config_size, MediaType::ImageConfig);

        let mut layers = Vec::new();
        for content in layer_contents {
            let digest = put_layer(objects, repo, content).await;
            layers.push(descriptor_for(&digest, content.len() as i64, MediaType::ImageLayer));
        }

        let (spec, bytes) = image_manifest(&config, layers);
        let mut manifests = FsManifestStore::new(objects.clone(), repo.to_string(), Arc::new(NoopCache), Options::default());
        let key: ManifestRef = tag.unwrap_or("untagged-placeholder").parse().unwrap();
        let digest = manifests.put(&key, &spec, bytes).await.unwrap();

        if tag.is_none() {
            // `put` above already tagged "untagged-placeholder" to create the revision link
            // via the tag path; untag it so the revision is reachable only through the
            // repository's manifest-revisions link, exactly like pushing a manifest by digest
            // without ever tagging it.
            let mut tags = FsTagStore::new(objects.clone(), repo.to_string());
            tags.untag("untagged-placeholder").await.unwrap();
        }

        digest
    }

    async fn revision_exists(objects: &Arc<dyn ObjectStore>, repo: &str, digest: &OciDigest) -> bool {
        let paths = PathMapper::new();
        let key = Key::try_from(paths.path(&PathSpec::ManifestRevisionLink { name: repo, digest }).as_str()).unwrap();
        objects.exists(&key).await.unwrap()
    }

    async fn blob_exists(objects: &Arc<dyn ObjectStore>, digest: &OciDigest) -> bool {
        GlobalBlobStore::new(objects.clone()).exists(digest).await.unwrap()
    }

    fn run_options() -> GcOptions {
        GcOptions {
            max_concurrency: 4,
            progress_interval: Duration::from_secs(3600),
            timeout: Duration::from_secs(60),
            ..GcOptions::default()
        }
    }

    /// Scenario 4 (§8): a shared layer between two manifests, one of which is untagged. With
    /// `remove_untagged = false`, GC marks from every manifest revision regardless of tag, so
    /// nothing is removed even though `m2` has no tag.
    #[tokio::test]
    async fn gc_keeps_all_revisions_when_remove_untagged_is_false() {
        let objects = objects();
        let manager_inst = manager(objects.clone());
        manager_inst.create("library/shared").await.unwrap();

        let m1 = put_image(&objects, "library/shared", Some("latest"), &["layer-1", "layer-2", "layer-3"]).await;
        let m2 = put_image(&objects, "library/shared", None, &["layer-2", "layer-4", "layer-5"]).await;

        let mut options = run_options();
        options.remove_untagged = false;
        let gc = GarbageCollector::new(manager_inst, objects.clone(), options).unwrap();
        let report = gc.run(CancellationToken::new()).await.unwrap();

        assert_eq!(report.manifests_deleted, 0);
        assert_eq!(report.blobs_deleted, 0);
        assert!(revision_exists(&objects, "library/shared", &m1).await);
        assert!(revision_exists(&objects, "library/shared", &m2).await);
    }

    /// Same shared-layer setup, but `m2`'s revision link is explicitly deleted (simulating
    /// the manifest having been deleted via the manifest store's own `delete`) before GC runs
    /// with `remove_untagged = false`: `m2`'s now-exclusive layers are swept, the layer
    /// shared with `m1` survives.
    #[tokio::test]
    async fn gc_sweeps_deleted_manifest_and_its_exclusive_layers() {
        let objects = objects();
        let manager_inst = manager(objects.clone());
        manager_inst.create("library/shared").await.unwrap();

        let m1 = put_image(&objects, "library/shared", Some("latest"), &["layer-1", "layer-2", "layer-3"]).await;
        let m2 = put_image(&objects, "library/shared", Some("old"), &["layer-2", "layer-4", "layer-5"]).await;

        let mut manifests = FsManifestStore::new(objects.clone(), "library/shared".to_string(), Arc::new(NoopCache), Options::default());
        manifests.delete(&ManifestRef::Digest(m2.clone())).await.unwrap();

        let mut options = run_options();
        options.remove_untagged = false;
        let gc = GarbageCollector::new(manager_inst, objects.clone(), options).unwrap();
        let report = gc.run(CancellationToken::new()).await.unwrap();

        assert!(revision_exists(&objects, "library/shared", &m1).await);
        assert!(!revision_exists(&objects, "library/shared", &m2).await);
        // m2's manifest blob, config, and its two exclusive layers are swept; layer-2
        // (shared with m1) is kept marked and not counted.
        assert_eq!(report.blobs_deleted, 4);
    }

    /// Scenario 5 (§8): an untagged image index referencing two tagged child manifests. With
    /// `remove_untagged = true` the index itself is removed (it was never tagged) while both
    /// children and their layers, still reachable through their own tags, survive.
    #[tokio::test]
    async fn gc_removes_untagged_index_but_keeps_tagged_children() {
        let objects = objects();
        let manager_inst = manager(objects.clone());
        manager_inst.create("library/multiarch").await.unwrap();

        let m1 = put_image(&objects, "library/multiarch", Some("amd64"), &["amd64-layer"]).await;
        let m2 = put_image(&objects, "library/multiarch", Some("arm64"), &["arm64-layer"]).await;

        let index = ImageIndexBuilder::default()
            .schema_version(2_u32)
            .media_type(MediaType::ImageIndex)
            .manifests(vec![
                Descriptor::new(MediaType::ImageManifest, 0, m1.to_string()),
                Descriptor::new(MediaType::ImageManifest, 0, m2.to_string()),
            ])
            .build()
            .unwrap();
        let index_bytes = Bytes::from(serde_json::to_vec(&index).unwrap());
        let spec = ManifestSpec::Index(index);

        let mut manifests =
            FsManifestStore::new(objects.clone(), "library/multiarch".to_string(), Arc::new(NoopCache), Options::default());
        let untagged_key = ManifestRef::Tag("placeholder".to_string());
        let index_digest = manifests.put(&untagged_key, &spec, index_bytes).await.unwrap();
        // The placeholder tag created the revision link through `put`; remove the tag so the
        // index is reachable only by digest, matching "pushed, never tagged".
        let mut tags = FsTagStore::new(objects.clone(), "library/multiarch".to_string());
        tags.untag("placeholder").await.ok();

        let mut options = run_options();
        options.remove_untagged = true;
        let gc = GarbageCollector::new(manager_inst, objects.clone(), options).unwrap();
        let report = gc.run(CancellationToken::new()).await.unwrap();

        assert!(!revision_exists(&objects, "library/multiarch", &index_digest).await);
        assert!(revision_exists(&objects, "library/multiarch", &m1).await);
        assert!(revision_exists(&objects, "library/multiarch", &m2).await);
        assert_eq!(report.manifests_deleted, 1);
    }

    /// Scenario 6 (§8): a mark-only run checkpoints reachability, then a push lands a brand
    /// new blob before sweep-only runs. Because sweep-only re-marks from the current state
    /// before filtering the checkpointed candidate set, the new blob survives even though it
    /// postdates the checkpoint.
    #[tokio::test]
    async fn sweep_only_re_marks_and_protects_blobs_pushed_after_checkpoint() {
        let objects = objects();
        let manager_inst = manager(objects.clone());
        manager_inst.create("library/resume").await.unwrap();

        let _m1 = put_image(&objects, "library/resume", Some("latest"), &["layer-1"]).await;
        let m2 = put_image(&objects, "library/resume", Some("old"), &["layer-2"]).await;

        let checkpoint_dir = tempfile::tempdir().unwrap();

        let mut manifests = FsManifestStore::new(objects.clone(), "library/resume".to_string(), Arc::new(NoopCache), Options::default());
        manifests.delete(&ManifestRef::Digest(m2.clone())).await.unwrap();

        let mut mark_options = run_options();
        mark_options.mark_only = true;
        mark_options.checkpoint_dir = Some(checkpoint_dir.path().to_path_buf());
        let mark_gc = GarbageCollector::new(manager_inst.clone(), objects.clone(), mark_options).unwrap();
        mark_gc.run(CancellationToken::new()).await.unwrap();

        // A push lands after the checkpoint: a brand new tagged manifest with its own layer.
        let new_manifest = put_image(&objects, "library/resume", Some("brand-new"), &["layer-new"]).await;
        assert!(revision_exists(&objects, "library/resume", &new_manifest).await);

        let mut sweep_options = run_options();
        sweep_options.sweep_only = true;
        sweep_options.checkpoint_dir = Some(checkpoint_dir.path().to_path_buf());
        let sweep_gc = GarbageCollector::new(manager_inst, objects.clone(), sweep_options).unwrap();
        let report = sweep_gc.run(CancellationToken::new()).await.unwrap();

        assert!(
            revision_exists(&objects, "library/resume", &new_manifest).await,
            "blob pushed after mark-only checkpoint must survive sweep-only"
        );
        assert!(!revision_exists(&objects, "library/resume", &m2).await);
        assert_eq!(report.manifests_deleted, 0, "m2's link was already removed directly, not via GC's untagged sweep");
    }

    #[tokio::test]
    async fn dry_run_reports_without_deleting() {
        let objects = objects();
        let manager_inst = manager(objects.clone());
        manager_inst.create("library/dryrun").await.unwrap();

        let m1 = put_image(&objects, "library/dryrun", Some("latest"), &["layer-1"]).await;
        let m2 = put_image(&objects, "library/dryrun", Some("old"), &["layer-2"]).await;

        let mut manifests = FsManifestStore::new(objects.clone(), "library/dryrun".to_string(), Arc::new(NoopCache), Options::default());
        manifests.delete(&ManifestRef::Digest(m2.clone())).await.unwrap();

        let mut options = run_options();
        options.dry_run = true;
        options.remove_untagged = false;
        let gc = GarbageCollector::new(manager_inst, objects.clone(), options).unwrap();
        let report = gc.run(CancellationToken::new()).await.unwrap();

        assert!(report.dry_run);
        assert!(report.blobs_deleted > 0, "dry run should still report what would be deleted");
        // Nothing actually removed: m1's tagged manifest and m2's now-dangling layer both
        // remain on disk (computing the dangling layer's digest directly, rather than
        // re-writing it, since re-writing would restore a deletion the dry run was supposed
        // to have skipped).
        assert!(blob_exists(&objects, &m1).await);
        let dangling_layer: OciDigest = "layer-2".as_bytes().try_into().unwrap();
        assert!(blob_exists(&objects, &dangling_layer).await);
    }
}
