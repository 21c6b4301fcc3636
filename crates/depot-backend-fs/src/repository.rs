//! Repository namespace (component H) and the `RepositoryStore` glue tying the other
//! per-repository stores together (component J).
//!
//! A repository "exists" once its marker file, or any content under its namespace, is
//! present: the repository IS the directory tree rooted at `v2/repositories/<name>`.
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::StreamExt;
use once_cell::sync::Lazy;
use regex::Regex;

use depot_core::registry::{self as reg};
use depot_core::{DescriptorCache, NoopCache, Options, PathMapper, PathSpec};
use depot_objectstore::{Key, ObjectStore};

use crate::errors::{Error, Result};
use crate::linked::LinkedBlobStore;
use crate::manifests::FsManifestStore;
use crate::tags::FsTagStore;
use crate::upload::FsUploadSessionStore;

/// Distribution spec repository name grammar: one or more `[a-z0-9]` components, each
/// optionally interspersed with `.`, `_`, `__`, or `-+` separators, joined by `/`.
static NAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9]+((\.|_|__|-+)[a-z0-9]+)*(/[a-z0-9]+((\.|_|__|-+)[a-z0-9]+)*)*$").unwrap()
});

pub fn validate_repository_name(name: &str) -> Result<()> {
    if NAME_RE.is_match(name) {
        Ok(())
    } else {
        Err(Error::RepositoryNameInvalid(name.to_string()))
    }
}

/// The well-known child directory names that distinguish "this is a populated repository
/// node" from "this is a namespace segment, keep descending" while walking the repository
/// tree -- see [`FsRepositoryStoreManager::collect_repositories`].
const REPOSITORY_MARKERS: [&str; 4] = ["_manifests", "_layers", "_uploads", "repository"];

#[derive(Clone)]
pub struct FsRepositoryStore {
    objects: Arc<dyn ObjectStore>,
    name: String,
    cache: Arc<dyn DescriptorCache>,
    options: Options,
    resumable_digest_enabled: bool,
}

#[async_trait]
impl reg::RepositoryStore for FsRepositoryStore {
    type ManifestStore = FsManifestStore;
    type BlobStore = LinkedBlobStore;
    type TagStore = FsTagStore;
    type UploadSessionStore = FsUploadSessionStore;
    type Error = Error;

    fn name(&self) -> &str {
        &self.name
    }

    fn get_manifest_store(&self) -> FsManifestStore {
        FsManifestStore::new(
            self.objects.clone(),
            self.name.clone(),
            self.cache.clone(),
            self.options.clone(),
        )
    }

    fn get_blob_store(&self) -> LinkedBlobStore {
        LinkedBlobStore::new(
            self.objects.clone(),
            self.name.clone(),
            self.cache.clone(),
            self.resumable_digest_enabled,
            self.options.clone(),
        )
    }

    fn get_tag_store(&self) -> FsTagStore {
        FsTagStore::new(self.objects.clone(), self.name.clone())
    }

    fn get_upload_session_store(&self) -> FsUploadSessionStore {
        FsUploadSessionStore::new(self.objects.clone(), self.name.clone())
    }
}

#[derive(Clone)]
pub struct FsRepositoryStoreManager {
    objects: Arc<dyn ObjectStore>,
    paths: PathMapper,
    cache: Arc<dyn DescriptorCache>,
    options: Options,
    resumable_digest_enabled: bool,
}

impl FsRepositoryStoreManager {
    pub fn new(objects: Arc<dyn ObjectStore>, options: Options) -> Self {
        Self::with_cache(objects, Arc::new(NoopCache), options)
    }

    pub fn with_cache(objects: Arc<dyn ObjectStore>, cache: Arc<dyn DescriptorCache>, options: Options) -> Self {
        Self {
            objects,
            paths: PathMapper::new(),
            cache,
            options,
            resumable_digest_enabled: true,
        }
    }

    pub fn resumable_digest_enabled(mut self, enabled: bool) -> Self {
        self.resumable_digest_enabled = enabled;
        self
    }

    fn marker_key(&self, name: &str) -> Result<Key> {
        Ok(Key::try_from(
            self.paths.path(&PathSpec::RepositoryMarker { name }).as_str(),
        )?)
    }

    fn dir_key(&self, prefix: &[String]) -> Result<Key> {
        let s = if prefix.is_empty() {
            self.paths.path(&PathSpec::RepositoriesRoot)
        } else {
            self.paths.path(&PathSpec::RepositoryRoot { name: &prefix.join("/") })
        };
        Ok(Key::try_from(s.as_str())?)
    }

    fn store_for(&self, name: &str) -> FsRepositoryStore {
        FsRepositoryStore {
            objects: self.objects.clone(),
            name: name.to_string(),
            cache: self.cache.clone(),
            options: self.options.clone(),
            resumable_digest_enabled: self.resumable_digest_enabled,
        }
    }

    /// A repository exists if it has a marker file, or -- for repositories populated before
    /// the marker existed, or written to directly by another process sharing this backend --
    /// any manifest revision or layer link.
    async fn exists(&self, name: &str) -> Result<bool> {
        if self.objects.exists(&self.marker_key(name)?).await? {
            return Ok(true);
        }
        let layers_root = Key::try_from(self.paths.path(&PathSpec::LayersRoot { name }).as_str())?;
        if !self.objects.list(&layers_root).await?.is_empty() {
            return Ok(true);
        }
        let revisions_root =
            Key::try_from(self.paths.path(&PathSpec::ManifestRevisionsRoot { name }).as_str())?;
        Ok(!self.objects.list(&revisions_root).await?.is_empty())
    }

    /// Recursively descend the `v2/repositories/` tree, in the lexicographic order
    /// [`ObjectStore::list`] already returns, appending a full repository name to `out`
    /// whenever a directory's children include one of [`REPOSITORY_MARKERS`] rather than
    /// descending further as a namespace segment (eg the `library` in `library/alpine`).
    fn collect_repositories<'a>(
        &'a self,
        prefix: Vec<String>,
        out: &'a mut Vec<String>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let key = self.dir_key(&prefix)?;
            let mut children = self.objects.list(&key).await?;
            children.sort();

            if children.iter().any(|c| REPOSITORY_MARKERS.contains(&c.as_str())) {
                out.push(prefix.join("/"));
                return Ok(());
            }

            for child in children {
                let mut next = prefix.clone();
                next.push(child);
                self.collect_repositories(next, out).await?;
            }
            Ok(())
        })
    }
}

#[async_trait]
impl reg::RepositoryStoreManager for FsRepositoryStoreManager {
    type RepositoryStore = FsRepositoryStore;
    type Error = Error;

    async fn get(&self, name: &str) -> Result<Option<FsRepositoryStore>> {
        if !self.exists(name).await? {
            return Ok(None);
        }
        Ok(Some(self.store_for(name)))
    }

    async fn create(&self, name: &str) -> Result<FsRepositoryStore> {
        validate_repository_name(name)?;
        let marker = self.marker_key(name)?;
        if !self.objects.exists(&marker).await? {
            let content = Bytes::from(chrono::Utc::now().to_rfc3339());
            let len = content.len() as u64;
            let body = futures::stream::once(async move { Ok(content) }).boxed();
            self.objects.put(&marker, body, len).await?;
        }
        Ok(self.store_for(name))
    }

    async fn repositories(&self, buf: &mut Vec<String>, n: usize, last: Option<&str>) -> Result<bool> {
        let mut all = Vec::new();
        self.collect_repositories(Vec::new(), &mut all).await?;
        all.sort();

        let start = match last {
            Some(last) => all.iter().position(|r| r.as_str() > last).unwrap_or(all.len()),
            None => 0,
        };
        let remaining = &all[start..];
        let more = remaining.len() > n;
        buf.extend(remaining.iter().take(n).cloned());
        Ok(more)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use depot_core::registry::{RepositoryStore, RepositoryStoreManager};
    use depot_objectstore::memory::InMemory;

    fn manager() -> FsRepositoryStoreManager {
        FsRepositoryStoreManager::new(Arc::new(InMemory::new()), Options::default())
    }

    #[test]
    fn validates_distribution_spec_names() {
        assert!(validate_repository_name("library/alpine").is_ok());
        assert!(validate_repository_name("Library/Alpine").is_err());
        assert!(validate_repository_name("/leading-slash").is_err());
    }

    #[tokio::test]
    async fn get_on_unknown_repository_is_none() {
        let manager = manager();
        assert!(manager.get("library/alpine").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn create_then_get_roundtrips() {
        let manager = manager();
        let repo = manager.create("library/alpine").await.unwrap();
        assert_eq!(repo.name(), "library/alpine");
        assert!(manager.get("library/alpine").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn create_rejects_invalid_name() {
        let manager = manager();
        let err = manager.create("Invalid_Name!").await.unwrap_err();
        assert!(matches!(err, Error::RepositoryNameInvalid(_)));
    }

    #[tokio::test]
    async fn repositories_paginates_in_lexicographic_order() {
        let manager = manager();
        for name in ["library/alpine", "library/busybox", "team/tool"] {
            manager.create(name).await.unwrap();
        }

        let mut buf = Vec::new();
        let more = manager.repositories(&mut buf, 2, None).await.unwrap();
        assert_eq!(buf, vec!["library/alpine".to_string(), "library/busybox".to_string()]);
        assert!(more);

        let mut rest = Vec::new();
        let more = manager.repositories(&mut rest, 2, Some(buf.last().unwrap())).await.unwrap();
        assert_eq!(rest, vec!["team/tool".to_string()]);
        assert!(!more);
    }
}
