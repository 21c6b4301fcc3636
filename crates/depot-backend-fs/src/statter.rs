//! Blob statter and caching chain (component C).
//!
//! Composed as described in [`depot_core::registry`]'s module doc comment: optional cache
//! -> optional middleware -> backend statter. This crate only ships the backend statter and
//! a thin cache-decorating wrapper; the middleware seam is the `Arc<dyn DescriptorCache>`
//! itself plus whatever a caller layers in front of a [`BlobStatter`] trait object.
use std::sync::Arc;

use async_trait::async_trait;
use oci_spec::image::{Descriptor, MediaType};

use depot_core::{DescriptorCache, OciDigest};

use crate::blobstore::GlobalBlobStore;
use crate::errors::Result;

/// `stat(ctx, digest) -> Descriptor | None`. Implementations resolve a bare digest to its
/// size and (best-effort) media type.
#[async_trait]
pub trait BlobStatter: Send + Sync {
    async fn stat(&self, digest: &OciDigest) -> Result<Option<Descriptor>>;
}

/// Resolves via `BlobData{digest}` stat. The blob pool itself carries no media-type
/// metadata -- a digest's content type is only ever known by whatever manifest descriptor
/// referenced it -- so a bare stat reports [`MediaType::OctetStream`], exactly as a
/// `docker manifest inspect`-less blob GET would.
pub struct BackendStatter {
    blobs: GlobalBlobStore,
}

impl BackendStatter {
    pub fn new(blobs: GlobalBlobStore) -> Self {
        Self { blobs }
    }
}

#[async_trait]
impl BlobStatter for BackendStatter {
    async fn stat(&self, digest: &OciDigest) -> Result<Option<Descriptor>> {
        match self.blobs.stat(digest).await? {
            Some(size) => Ok(Some(Descriptor::new(
                MediaType::OctetStream,
                size as i64,
                digest.to_string(),
            ))),
            None => Ok(None),
        }
    }
}

/// Writes through to `inner` on miss; swallows cache read errors and falls back to `inner`
/// rather than failing a request the backend could have served.
pub struct CachingStatter<S> {
    cache: Arc<dyn DescriptorCache>,
    inner: S,
}

impl<S: BlobStatter> CachingStatter<S> {
    pub fn new(cache: Arc<dyn DescriptorCache>, inner: S) -> Self {
        Self { cache, inner }
    }
}

#[async_trait]
impl<S: BlobStatter + Send + Sync> BlobStatter for CachingStatter<S> {
    async fn stat(&self, digest: &OciDigest) -> Result<Option<Descriptor>> {
        if let Some(d) = self.cache.get(digest).await {
            return Ok(Some(d));
        }
        match self.inner.stat(digest).await? {
            Some(d) => {
                self.cache.put(digest.clone(), d.clone()).await;
                Ok(Some(d))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use depot_core::MemoryCache;
    use depot_objectstore::memory::InMemory;
    use std::sync::Arc as StdArc;

    #[tokio::test]
    async fn backend_statter_reports_size() {
        let blobs = GlobalBlobStore::new(StdArc::new(InMemory::new()));
        let digest = blobs.put(bytes::Bytes::from("hello world")).await.unwrap();
        let statter = BackendStatter::new(blobs);
        let d = statter.stat(&digest).await.unwrap().unwrap();
        assert_eq!(d.size(), 11);
    }

    #[tokio::test]
    async fn backend_statter_unknown_digest_is_none() {
        let blobs = GlobalBlobStore::new(StdArc::new(InMemory::new()));
        let statter = BackendStatter::new(blobs);
        let digest: OciDigest = "sha256:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"
            .try_into()
            .unwrap();
        assert!(statter.stat(&digest).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn caching_statter_writes_through_on_miss() {
        let blobs = GlobalBlobStore::new(StdArc::new(InMemory::new()));
        let digest = blobs.put(bytes::Bytes::from("cached")).await.unwrap();
        let cache = StdArc::new(MemoryCache::new());
        let statter = CachingStatter::new(cache.clone(), BackendStatter::new(blobs));
        assert!(cache.get(&digest).await.is_none());
        let d = statter.stat(&digest).await.unwrap().unwrap();
        assert_eq!(d.size(), 6);
        assert!(cache.get(&digest).await.is_some());
    }
}
