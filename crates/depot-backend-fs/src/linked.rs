//! Repository-scoped blob store (component E): the `LinkedBlobStore` wraps
//! [`GlobalBlobStore`] with a `_layers/` link namespace -- a repository never addresses blob
//! content directly, only through its own link.
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use oci_spec::image::{Descriptor, MediaType};
use uuid::Uuid;

use depot_core::registry::{self as reg, CreateBlobWriterOutcome};
use depot_core::{DescriptorCache, OciDigest, Options, PathMapper};
use depot_objectstore::{Key, ObjectStore};

use crate::blobstore::GlobalBlobStore;
use crate::errors::{Error, Result};
use crate::links::LinkNamespace;
use crate::statter::{BackendStatter, BlobStatter, CachingStatter};
use crate::upload::{FsBlobWriter, FsUploadSession, FsUploadSessionStore};

type TryBytes = std::result::Result<Bytes, Box<dyn std::error::Error + Send + Sync>>;

/// A blob as seen through one repository's link namespace.
#[derive(Clone, Debug)]
pub struct FsBlob {
    digest: OciDigest,
    size: u64,
    media_type: Option<MediaType>,
}

impl reg::Blob for FsBlob {
    fn digest(&self) -> &OciDigest {
        &self.digest
    }

    fn bytes_on_disk(&self) -> u64 {
        self.size
    }

    fn media_type(&self) -> &Option<MediaType> {
        &self.media_type
    }
}

#[derive(Clone)]
pub struct LinkedBlobStore {
    objects: Arc<dyn ObjectStore>,
    paths: PathMapper,
    repository: String,
    global: GlobalBlobStore,
    statter: Arc<dyn BlobStatter>,
    cache: Arc<dyn DescriptorCache>,
    sessions: FsUploadSessionStore,
    resumable_digest_enabled: bool,
    options: Options,
}

impl LinkedBlobStore {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        repository: String,
        cache: Arc<dyn DescriptorCache>,
        resumable_digest_enabled: bool,
        options: Options,
    ) -> Self {
        let global = GlobalBlobStore::new(objects.clone());
        let statter: Arc<dyn BlobStatter> = Arc::new(CachingStatter::new(
            cache.clone(),
            BackendStatter::new(global.clone()),
        ));
        let sessions = FsUploadSessionStore::new(objects.clone(), repository.clone());
        Self {
            objects,
            paths: PathMapper::new(),
            repository,
            global,
            statter,
            cache,
            sessions,
            resumable_digest_enabled,
            options,
        }
    }

    fn link_key(&self, digest: &OciDigest) -> Result<Key> {
        LinkNamespace::Layers.link_key(&self.paths, &self.repository, digest)
    }

    async fn linked(&self, digest: &OciDigest) -> Result<bool> {
        Ok(self.objects.exists(&self.link_key(digest)?).await?)
    }
}

#[async_trait]
impl reg::BlobStore for LinkedBlobStore {
    type BlobWriter = FsBlobWriter;
    type Error = Error;
    type UploadSession = FsUploadSession;
    type Blob = FsBlob;
    type BlobBody = BoxStream<'static, TryBytes>;

    async fn head(&self, key: &OciDigest) -> Result<Option<FsBlob>> {
        if !self.linked(key).await? {
            return Ok(None);
        }
        Ok(self.statter.stat(key).await?.map(|d| FsBlob {
            digest: key.clone(),
            size: d.size() as u64,
            media_type: Some(d.media_type().clone()),
        }))
    }

    async fn get(&self, key: &OciDigest) -> Result<Option<(FsBlob, Self::BlobBody)>> {
        if !self.linked(key).await? {
            return Ok(None);
        }
        let Some(d) = self.statter.stat(key).await? else {
            return Ok(None);
        };
        let body = self.global.get(key).await?;
        let blob = FsBlob {
            digest: key.clone(),
            size: d.size() as u64,
            media_type: Some(d.media_type().clone()),
        };
        Ok(Some((blob, body.map_err(|e| e.into()).boxed())))
    }

    async fn put(&mut self, bytes: Bytes) -> Result<OciDigest> {
        let digest = self.global.put(bytes).await?;
        self.global.link(&self.link_key(&digest)?, &digest).await?;
        Ok(digest)
    }

    async fn delete(&mut self, digest: &OciDigest) -> Result<()> {
        if !self.options.delete_enabled {
            return Err(Error::Unsupported);
        }
        self.objects.delete(&self.link_key(digest)?).await?;
        self.cache.invalidate(digest).await;
        Ok(())
    }

    /// Mount support (§4.E): `mount_from` names another repository whose link namespace is
    /// checked for `digest` before falling back to a fresh upload session -- a same-backend
    /// mount never copies bytes, it only writes this repository's own link.
    async fn create(
        &mut self,
        mount_from: Option<&str>,
        digest: Option<&OciDigest>,
    ) -> Result<CreateBlobWriterOutcome<FsBlobWriter>> {
        if let (Some(from), Some(digest)) = (mount_from, digest) {
            let source_link = LinkNamespace::Layers.link_key(&self.paths, from, digest)?;
            if self.objects.exists(&source_link).await? && self.global.exists(digest).await? {
                self.global.link(&self.link_key(digest)?, digest).await?;
                let size = self.global.stat(digest).await?.unwrap_or(0);
                let descriptor = Descriptor::new(MediaType::OctetStream, size as i64, digest.to_string());
                self.cache.put(digest.clone(), descriptor.clone()).await;
                return Ok(CreateBlobWriterOutcome::Mounted(descriptor));
            }
        }

        let session = reg::UploadSessionStore::new_upload_session(&self.sessions).await?;
        let writer = FsBlobWriter::new(
            self.objects.clone(),
            self.global.clone(),
            self.repository.clone(),
            session,
            self.resumable_digest_enabled,
            self.cache.clone(),
        );
        Ok(CreateBlobWriterOutcome::Writer(writer))
    }

    async fn resume(&self, session_uuid: &Uuid) -> Result<FsBlobWriter> {
        let session = reg::UploadSessionStore::get_upload_session(&self.sessions, session_uuid).await?;
        Ok(FsBlobWriter::new(
            self.objects.clone(),
            self.global.clone(),
            self.repository.clone(),
            session,
            false,
            self.cache.clone(),
        ))
    }

    async fn enumerate(
        &self,
        f: &mut (dyn FnMut(OciDigest) -> Result<()> + Send),
    ) -> Result<()> {
        let root = LinkNamespace::Layers.root_key(&self.paths, &self.repository)?;
        let mut keys = Vec::new();
        self.objects
            .walk(&root, &mut |k| {
                keys.push(k);
                Ok(())
            })
            .await?;
        for key in keys {
            let digest = self.global.readlink(&key).await?;
            f(digest)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use depot_core::registry::{Blob, BlobStore};
    use depot_core::NoopCache;
    use depot_objectstore::memory::InMemory;

    fn store() -> LinkedBlobStore {
        let objects: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        LinkedBlobStore::new(
            objects,
            "library/alpine".to_string(),
            Arc::new(NoopCache),
            true,
            Options::default(),
        )
    }

    #[tokio::test]
    async fn put_then_head_reports_linked_blob() {
        let mut store = store();
        let digest = store.put(Bytes::from("config")).await.unwrap();
        let blob = store.head(&digest).await.unwrap().unwrap();
        assert_eq!(blob.digest(), &digest);
        assert_eq!(blob.bytes_on_disk(), 7);
    }

    #[tokio::test]
    async fn head_unlinked_digest_is_none() {
        let store = store();
        let digest: OciDigest = "sha256:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"
            .try_into()
            .unwrap();
        assert!(store.head(&digest).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_removes_link_but_keeps_global_blob() {
        let mut store = store();
        let digest = store.put(Bytes::from("payload")).await.unwrap();
        store.delete(&digest).await.unwrap();
        assert!(store.head(&digest).await.unwrap().is_none());
        assert!(store.global.exists(&digest).await.unwrap());
    }

    #[tokio::test]
    async fn delete_disabled_by_options_is_unsupported() {
        let objects: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let mut store = LinkedBlobStore::new(
            objects,
            "library/alpine".to_string(),
            Arc::new(NoopCache),
            true,
            Options {
                delete_enabled: false,
                ..Options::default()
            },
        );
        let digest = store.put(Bytes::from("payload")).await.unwrap();
        let err = store.delete(&digest).await.unwrap_err();
        assert!(matches!(err, Error::Unsupported));
        assert!(store.head(&digest).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn mount_from_requires_source_link_and_existing_blob() {
        let mut source = store();
        let digest = source.put(Bytes::from("shared layer")).await.unwrap();

        let objects = source.objects.clone();
        let mut dest = LinkedBlobStore::new(
            objects,
            "library/busybox".to_string(),
            Arc::new(NoopCache),
            true,
            Options::default(),
        );
        match dest
            .create(Some("library/alpine"), Some(&digest))
            .await
            .unwrap()
        {
            CreateBlobWriterOutcome::Mounted(d) => assert_eq!(d.digest(), &digest.to_string()),
            CreateBlobWriterOutcome::Writer(_) => panic!("expected a mount"),
        }
        assert!(dest.head(&digest).await.unwrap().is_some());
    }
}
