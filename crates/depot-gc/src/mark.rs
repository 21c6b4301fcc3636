//! Phase 1 -- mark: walk every repository's tag map and manifest reference graph to build the
//! set of digests still reachable from a root, plus the per-repository cleanup candidates
//! (stale layer links, untagged manifest revisions) that fall out of the same walk.
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use depot_backend_fs::{FsRepositoryStoreManager, GlobalBlobStore, LinkNamespace};
use depot_core::registry::{ManifestSpec, RepositoryStoreManager};
use depot_core::{OciDigest, PathMapper, PathSpec};
use depot_objectstore::{Key, ObjectStore};
use tokio_util::sync::CancellationToken;

use crate::errors::{Error, Result};
use crate::options::GcOptions;
use crate::progress::ProgressCounters;

#[derive(Debug, Default)]
pub struct MarkResult {
    pub mark_set: HashSet<OciDigest>,
    pub repositories_marked: usize,
    pub manifests_marked: usize,
    pub layer_links_to_delete: Vec<(String, OciDigest)>,
    pub untagged_manifests_to_delete: Vec<(String, OciDigest)>,
}

struct RepoMark {
    mark_set: HashSet<OciDigest>,
    manifests_marked: usize,
    layer_links_to_delete: Vec<(String, OciDigest)>,
    untagged_manifests_to_delete: Vec<(String, OciDigest)>,
}

/// Walks every repository's manifest reference graph, bounded to `options.max_concurrency`
/// concurrent repositories via a manually-capped `JoinSet`, the same pattern
/// `PgManifestStore::get_referrers` uses for concurrent per-digest lookups.
pub async fn mark(
    manager: &FsRepositoryStoreManager,
    objects: &Arc<dyn ObjectStore>,
    options: &GcOptions,
    cancel: &CancellationToken,
    progress: &ProgressCounters,
) -> Result<MarkResult> {
    let mut names = Vec::new();
    let mut last: Option<String> = None;
    loop {
        let mut page = Vec::new();
        let more = manager.repositories(&mut page, 1000, last.as_deref()).await?;
        let done = page.is_empty() || !more;
        if let Some(n) = page.last() {
            last = Some(n.clone());
        }
        names.extend(page);
        if done {
            break;
        }
    }

    let mut result = MarkResult::default();
    let mut set = tokio::task::JoinSet::new();

    for name in names {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if set.len() >= options.max_concurrency {
            if let Some(joined) = set.join_next().await {
                merge(&mut result, joined??, progress);
            }
        }
        let objects = objects.clone();
        let remove_untagged = options.remove_untagged;
        set.spawn(async move { mark_repository(objects, name, remove_untagged).await });
    }

    while let Some(joined) = set.join_next().await {
        merge(&mut result, joined??, progress);
    }

    Ok(result)
}

fn merge(result: &mut MarkResult, repo: Option<RepoMark>, progress: &ProgressCounters) {
    let Some(repo) = repo else {
        // Repository vanished mid-walk: non-fatal, simply contributes nothing.
        return;
    };
    progress.add_repository(repo.manifests_marked as u64);
    result.repositories_marked += 1;
    result.manifests_marked += repo.manifests_marked;
    result.mark_set.extend(repo.mark_set);
    result.layer_links_to_delete.extend(repo.layer_links_to_delete);
    result.untagged_manifests_to_delete.extend(repo.untagged_manifests_to_delete);
}

/// Marks one repository's reachable digests. Returns `None` if the repository's namespace
/// disappeared while being walked (a concurrent delete), which the caller treats as a
/// non-fatal, empty contribution rather than failing the whole run.
async fn mark_repository(
    objects: Arc<dyn ObjectStore>,
    name: String,
    remove_untagged: bool,
) -> Result<Option<RepoMark>> {
    let paths = PathMapper::new();
    let global = GlobalBlobStore::new(objects.clone());

    let tags_root = Key::try_from(paths.path(&PathSpec::ManifestTagsRoot { name: &name }).as_str())?;
    let tags = objects.list(&tags_root).await?;

    let mut current_by_tag = Vec::new();
    for tag in &tags {
        let current_key = Key::try_from(
            paths
                .path(&PathSpec::ManifestTagCurrentLink { name: &name, tag })
                .as_str(),
        )?;
        if let Ok(digest) = global.readlink(&current_key).await {
            current_by_tag.push(digest);
        }
    }
    let current_digests: HashSet<OciDigest> = current_by_tag.iter().cloned().collect();

    let revisions_root = LinkNamespace::ManifestRevisions.root_key(&paths, &name)?;
    let mut revision_keys = Vec::new();
    objects
        .walk(&revisions_root, &mut |k| {
            revision_keys.push(k);
            Ok(())
        })
        .await?;

    let mut all_revisions = Vec::with_capacity(revision_keys.len());
    for key in &revision_keys {
        match global.readlink(key).await {
            Ok(digest) => all_revisions.push(digest),
            Err(_) => continue, // dangling link, repository mutated mid-walk
        }
    }

    let mark_set = Arc::new(Mutex::new(HashSet::new()));
    let mut untagged_manifests_to_delete = Vec::new();

    let roots: Vec<OciDigest> = if remove_untagged {
        current_digests.iter().cloned().collect()
    } else {
        all_revisions.clone()
    };

    for digest in &roots {
        mark_digest(&global, &paths, &name, digest.clone(), &mark_set).await?;
    }

    if remove_untagged {
        for digest in &all_revisions {
            if !current_digests.contains(digest) && !mark_set.lock().expect("lock poisoned").contains(digest) {
                untagged_manifests_to_delete.push((name.clone(), digest.clone()));
            }
        }
    }

    let layers_root = LinkNamespace::Layers.root_key(&paths, &name)?;
    let mut layer_keys = Vec::new();
    objects
        .walk(&layers_root, &mut |k| {
            layer_keys.push(k);
            Ok(())
        })
        .await?;

    let mut layer_links_to_delete = Vec::new();
    {
        let marked = mark_set.lock().expect("lock poisoned");
        for key in &layer_keys {
            if let Ok(digest) = global.readlink(key).await {
                if !marked.contains(&digest) {
                    layer_links_to_delete.push((name.clone(), digest));
                }
            }
        }
    }

    let manifests_marked = all_revisions.len();
    let mark_set = Arc::try_unwrap(mark_set).expect("no outstanding references").into_inner().expect("lock poisoned");

    Ok(Some(RepoMark {
        mark_set,
        manifests_marked,
        layer_links_to_delete,
        untagged_manifests_to_delete,
    }))
}

/// Adds `digest` to `mark_set` and, if it resolves as a manifest revision in this repository,
/// recursively marks everything it references. A descriptor that doesn't resolve as a
/// manifest (a config blob, a layer) is marked but never descended into.
fn mark_digest<'a>(
    global: &'a GlobalBlobStore,
    paths: &'a PathMapper,
    repository: &'a str,
    digest: OciDigest,
    mark_set: &'a Arc<Mutex<HashSet<OciDigest>>>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
    Box::pin(async move {
        let already_marked = !mark_set.lock().expect("lock poisoned").insert(digest.clone());
        if already_marked {
            return Ok(());
        }

        let revision_link = LinkNamespace::ManifestRevisions.link_key(paths, repository, &digest)?;
        if !global.objects().exists(&revision_link).await? {
            return Ok(());
        }

        let bytes = match global.get_bytes(&digest).await {
            Ok(b) => b,
            Err(_) => return Ok(()),
        };
        let spec = match ManifestSpec::try_from(&bytes) {
            Ok(s) => s,
            Err(_) => return Ok(()),
        };

        for desc in spec.references() {
            let Ok(child) = OciDigest::try_from(desc.digest().as_str()) else {
                continue;
            };
            mark_digest(global, paths, repository, child, mark_set).await?;
        }
        Ok(())
    })
}
