//! Tag store (component G): a tag is a mutable pointer (`current/link`) plus an
//! append-only revision index (`index/<algo>/<hex>/link`) recording every digest the tag
//! has ever pointed at.
use std::sync::Arc;

use async_trait::async_trait;
use oci_spec::distribution::{TagList, TagListBuilder};
use oci_spec::image::{Descriptor, MediaType};

use depot_core::registry::{self as reg, ManifestSpec};
use depot_core::{OciDigest, PathMapper, PathSpec};
use depot_objectstore::{Key, ObjectStore};

use crate::blobstore::GlobalBlobStore;
use crate::errors::{Error, Result};

#[derive(Clone)]
pub struct FsTagStore {
    objects: Arc<dyn ObjectStore>,
    paths: PathMapper,
    repository: String,
    global: GlobalBlobStore,
}

impl FsTagStore {
    pub fn new(objects: Arc<dyn ObjectStore>, repository: String) -> Self {
        Self {
            global: GlobalBlobStore::new(objects.clone()),
            objects,
            paths: PathMapper::new(),
            repository,
        }
    }

    fn current_key(&self, tag: &str) -> Result<Key> {
        Ok(Key::try_from(
            self.paths
                .path(&PathSpec::ManifestTagCurrentLink { name: &self.repository, tag })
                .as_str(),
        )?)
    }

    fn tag_root_key(&self, tag: &str) -> Result<Key> {
        Ok(Key::try_from(
            self.paths
                .path(&PathSpec::ManifestTag { name: &self.repository, tag })
                .as_str(),
        )?)
    }

    fn index_root_key(&self, tag: &str) -> Result<Key> {
        Ok(Key::try_from(
            self.paths
                .path(&PathSpec::ManifestTagIndexRoot { name: &self.repository, tag })
                .as_str(),
        )?)
    }

    fn index_entry_key(&self, tag: &str, digest: &OciDigest) -> Result<Key> {
        Ok(Key::try_from(
            self.paths
                .path(&PathSpec::ManifestTagIndexEntryLink {
                    name: &self.repository,
                    tag,
                    digest,
                })
                .as_str(),
        )?)
    }

    fn tags_root_key(&self) -> Result<Key> {
        Ok(Key::try_from(
            self.paths.path(&PathSpec::ManifestTagsRoot { name: &self.repository }).as_str(),
        )?)
    }

    pub async fn current_digest(&self, tag: &str) -> Result<Option<OciDigest>> {
        let current = self.current_key(tag)?;
        if !self.objects.exists(&current).await? {
            return Ok(None);
        }
        Ok(Some(self.global.readlink(&current).await?))
    }

    async fn list_tags(&self) -> Result<Vec<String>> {
        let mut tags = self.objects.list(&self.tags_root_key()?).await?;
        tags.sort();
        Ok(tags)
    }
}

#[async_trait]
impl reg::TagStore for FsTagStore {
    type Error = Error;

    async fn tag(&mut self, tag: &str, descriptor: Descriptor) -> Result<()> {
        let digest: OciDigest = descriptor.digest().as_str().try_into().map_err(Error::Core)?;
        self.global.link(&self.index_entry_key(tag, &digest)?, &digest).await?;
        self.global.link(&self.current_key(tag)?, &digest).await?;
        Ok(())
    }

    async fn get(&self, tag: &str) -> Result<Option<Descriptor>> {
        let Some(digest) = self.current_digest(tag).await? else {
            return Ok(None);
        };
        let bytes = self.global.get_bytes(&digest).await?;
        let media_type = ManifestSpec::try_from(&bytes)
            .ok()
            .and_then(|s| s.media_type())
            .unwrap_or(MediaType::OctetStream);
        Ok(Some(Descriptor::new(media_type, bytes.len() as i64, digest.to_string())))
    }

    async fn untag(&mut self, tag: &str) -> Result<()> {
        self.objects.delete_prefix(&self.tag_root_key(tag)?).await?;
        Ok(())
    }

    async fn get_tags(&self, n: Option<usize>, last: Option<String>) -> Result<TagList> {
        let tags = self.list_tags().await?;
        let start = match &last {
            Some(last) => tags.iter().position(|t| t > last).unwrap_or(tags.len()),
            None => 0,
        };
        let page: Vec<String> = match n {
            Some(n) => tags[start..].iter().take(n).cloned().collect(),
            None => tags[start..].to_vec(),
        };
        Ok(TagListBuilder::default()
            .name(self.repository.as_str())
            .tags(page)
            .build()
            .map_err(|e| Error::ManifestInvalid(e.to_string()))?)
    }

    async fn lookup(&self, descriptor: &Descriptor) -> Result<Vec<String>> {
        let mut matches = Vec::new();
        for tag in self.list_tags().await? {
            if let Some(digest) = self.current_digest(&tag).await? {
                if digest.to_string() == descriptor.digest().as_str() {
                    matches.push(tag);
                }
            }
        }
        Ok(matches)
    }

    async fn manifest_digests(&self, tag: &str) -> Result<Vec<OciDigest>> {
        let root = self.index_root_key(tag)?;
        let mut keys = Vec::new();
        self.objects
            .walk(&root, &mut |k| {
                keys.push(k);
                Ok(())
            })
            .await?;
        let mut digests = Vec::with_capacity(keys.len());
        for key in keys {
            digests.push(self.global.readlink(&key).await?);
        }
        Ok(digests)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use bytes::Bytes;
    use depot_core::registry::TagStore;
    use depot_objectstore::memory::InMemory;

    fn digest_a() -> OciDigest {
        "sha256:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"
            .try_into()
            .unwrap()
    }

    async fn store_with_manifest(digest: &OciDigest) -> FsTagStore {
        let objects: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let global = GlobalBlobStore::new(objects.clone());
        global.put(Bytes::from(r#"{"schemaVersion":2}"#)).await.ok();
        let _ = digest;
        FsTagStore::new(objects, "library/alpine".to_string())
    }

    #[tokio::test]
    async fn tag_then_get_roundtrips() {
        let digest = digest_a();
        let mut store = store_with_manifest(&digest).await;
        store.global.put_empty(&digest).await.unwrap();
        let descriptor = Descriptor::new(MediaType::ImageManifest, 0, digest.to_string());
        store.tag("latest", descriptor).await.unwrap();

        let got = store.get("latest").await.unwrap().unwrap();
        assert_eq!(got.digest(), &digest.to_string());
        assert_eq!(store.manifest_digests("latest").await.unwrap(), vec![digest.clone()]);
        assert_eq!(store.lookup(&Descriptor::new(MediaType::ImageManifest, 0, digest.to_string())).await.unwrap(), vec!["latest".to_string()]);
    }

    #[tokio::test]
    async fn untag_removes_current_and_index() {
        let digest = digest_a();
        let mut store = store_with_manifest(&digest).await;
        store.global.put_empty(&digest).await.unwrap();
        let descriptor = Descriptor::new(MediaType::ImageManifest, 0, digest.to_string());
        store.tag("latest", descriptor).await.unwrap();
        store.untag("latest").await.unwrap();
        assert!(store.get("latest").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn get_tags_paginates_after_last() {
        let digest = digest_a();
        let mut store = store_with_manifest(&digest).await;
        store.global.put_empty(&digest).await.unwrap();
        for tag in ["a", "b", "c"] {
            store
                .tag(tag, Descriptor::new(MediaType::ImageManifest, 0, digest.to_string()))
                .await
                .unwrap();
        }
        let list = store.get_tags(Some(1), Some("a".to_string())).await.unwrap();
        assert_eq!(list.tags(), &vec!["b".to_string()]);
    }
}
