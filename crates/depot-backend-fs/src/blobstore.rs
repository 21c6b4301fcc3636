//! Global, content-addressed blob store (component B).
//!
//! There is exactly one of these per registry process; every repository-scoped view
//! ([`crate::linked::LinkedBlobStore`]) funnels its reads and writes through it. Nothing
//! here knows about repository namespacing -- that is entirely the linked store's job.
use bytes::Bytes;
use futures::stream::{StreamExt, TryStreamExt};
use std::sync::Arc;

use depot_core::{OciDigest, PathMapper, PathSpec};
use depot_objectstore::{Key, ObjectBody, ObjectStore};

use crate::errors::{Error, Result};

/// Reads, put-small, and link-file management over the configured [`ObjectStore`], rooted
/// at the [`PathMapper`]'s `blobs/` namespace.
#[derive(Clone)]
pub struct GlobalBlobStore {
    objects: Arc<dyn ObjectStore>,
    paths: PathMapper,
}

impl GlobalBlobStore {
    pub fn new(objects: Arc<dyn ObjectStore>) -> Self {
        Self {
            objects,
            paths: PathMapper::new(),
        }
    }

    pub fn objects(&self) -> &Arc<dyn ObjectStore> {
        &self.objects
    }

    pub fn key(&self, spec: &PathSpec<'_>) -> Result<Key> {
        Ok(Key::try_from(self.paths.path(spec).as_str())?)
    }

    fn blob_data_key(&self, digest: &OciDigest) -> Result<Key> {
        self.key(&PathSpec::BlobData { digest })
    }

    /// `exists(ctx, digest) -> bool` -- never an error; backend "not found" collapses to
    /// `false` the same way a `PathNotFound` does everywhere else in this crate.
    pub async fn exists(&self, digest: &OciDigest) -> Result<bool> {
        Ok(self.objects.exists(&self.blob_data_key(digest)?).await?)
    }

    pub async fn stat(&self, digest: &OciDigest) -> Result<Option<u64>> {
        Ok(self
            .objects
            .stat(&self.blob_data_key(digest)?)
            .await?
            .map(|s| s.size))
    }

    /// Whole-object read. Intended for small objects: manifests and link files, never raw
    /// layer data (callers stream that through [`Self::get`] instead).
    pub async fn get_bytes(&self, digest: &OciDigest) -> Result<Bytes> {
        let body = self.objects.get(&self.blob_data_key(digest)?).await?;
        let chunks: Vec<Bytes> = body.try_collect().await?;
        Ok(chunks.concat().into())
    }

    pub async fn get(&self, digest: &OciDigest) -> Result<ObjectBody> {
        Ok(self.objects.get(&self.blob_data_key(digest)?).await?)
    }

    /// `put(ctx, bytes) -> digest` -- compute digest, write only if the canonical path does
    /// not already exist (idempotent; satisfies I6, at-most-one-copy-per-digest).
    pub async fn put(&self, bytes: Bytes) -> Result<OciDigest> {
        let digest: OciDigest = bytes.as_ref().try_into().map_err(Error::Core)?;
        let key = self.blob_data_key(&digest)?;
        if !self.objects.exists(&key).await? {
            let len = bytes.len() as u64;
            let body = futures::stream::once(async move { Ok(bytes) }).boxed();
            self.objects.put(&key, body, len).await?;
        }
        Ok(digest)
    }

    /// `link(ctx, path, digest)` -- writes the ASCII digest as the content of `path`, only
    /// after verifying the target blob exists. Safe to call again with the same digest (the
    /// written bytes are identical); used both for create-once layer/revision links and for
    /// the tag store's mutable `current` pointer.
    pub async fn link(&self, path: &Key, digest: &OciDigest) -> Result<()> {
        if !self.exists(digest).await? {
            return Err(Error::LinkTargetMissing(digest.to_string()));
        }
        let content = Bytes::from(digest.to_string());
        let len = content.len() as u64;
        let body = futures::stream::once(async move { Ok(content) }).boxed();
        self.objects.put(path, body, len).await?;
        Ok(())
    }

    /// `readlink(ctx, path) -> digest` -- reads the link file, parses and validates the
    /// digest, and verifies the target blob still exists.
    pub async fn readlink(&self, path: &Key) -> Result<OciDigest> {
        let body = self.objects.get(path).await?;
        let chunks: Vec<Bytes> = body.try_collect().await?;
        let content = chunks.concat();
        let s = std::str::from_utf8(&content)
            .map_err(|_| Error::ManifestInvalid("link file is not valid utf-8".to_string()))?;
        let digest: OciDigest = s.trim().try_into().map_err(Error::Core)?;
        if !self.exists(&digest).await? {
            return Err(Error::BlobUnknown);
        }
        Ok(digest)
    }

    /// Move `src` into the blob pool at `digest`'s canonical path, unless something is
    /// already there (content-addressing makes the second writer's move redundant -- I6).
    pub async fn promote(&self, src: &Key, digest: &OciDigest) -> Result<()> {
        let dst = self.blob_data_key(digest)?;
        if self.objects.exists(&dst).await? {
            self.objects.delete(src).await?;
            return Ok(());
        }
        self.objects.r#move(src, &dst).await?;
        Ok(())
    }

    /// Write an empty object directly at `digest`'s canonical path. Used for the
    /// empty-blob commit special case (§4.D step 7): an upload that never received any
    /// bytes and is being committed against the empty-blob digest has no temp file to move.
    pub async fn put_empty(&self, digest: &OciDigest) -> Result<()> {
        let dst = self.blob_data_key(digest)?;
        if self.objects.exists(&dst).await? {
            return Ok(());
        }
        let body = futures::stream::once(async move { Ok(Bytes::new()) }).boxed();
        self.objects.put(&dst, body, 0).await?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use depot_objectstore::memory::InMemory;

    fn store() -> GlobalBlobStore {
        GlobalBlobStore::new(Arc::new(InMemory::new()))
    }

    #[tokio::test]
    async fn put_is_idempotent_and_content_addressed() {
        let gbs = store();
        let d1 = gbs.put(Bytes::from("hello")).await.unwrap();
        let d2 = gbs.put(Bytes::from("hello")).await.unwrap();
        assert_eq!(d1, d2);
        assert!(gbs.exists(&d1).await.unwrap());
        assert_eq!(gbs.get_bytes(&d1).await.unwrap(), Bytes::from("hello"));
    }

    #[tokio::test]
    async fn link_fails_when_target_missing() {
        let gbs = store();
        let digest: OciDigest = "sha256:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"
            .try_into()
            .unwrap();
        let key = Key::from("v2/repositories/foo/_layers/sha256/aa/aaaa/link");
        let err = gbs.link(&key, &digest).await.unwrap_err();
        assert!(matches!(err, Error::LinkTargetMissing(_)));
    }

    #[tokio::test]
    async fn link_then_readlink_roundtrips() {
        let gbs = store();
        let digest = gbs.put(Bytes::from("payload")).await.unwrap();
        let key = Key::from("v2/repositories/foo/_layers/sha256/aa/aaaa/link");
        gbs.link(&key, &digest).await.unwrap();
        let read = gbs.readlink(&key).await.unwrap();
        assert_eq!(read, digest);
    }
}
