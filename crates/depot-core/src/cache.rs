//! Blob descriptor caching chain (component C, the "optional cache" in front of a backend
//! statter described in [`crate::registry::BlobStore`]'s doc comment).
//!
//! A cache sits in front of a backend statter: `stat` writes through on miss, and any error
//! raised by the cache itself is swallowed and treated as a miss -- a broken cache degrades
//! to "no cache", it never turns into a hard failure for a read that the backend could have
//! served. Entries are invalidated explicitly (eg on manifest delete) rather than expired.
use async_trait::async_trait;
use oci_spec::image::Descriptor;

use crate::oci_digest::OciDigest;

/// A descriptor cache keyed by digest. Implementations must be safe to share across
/// concurrently-running `Repository` handles.
#[async_trait]
pub trait DescriptorCache: Send + Sync + 'static {
    async fn get(&self, digest: &OciDigest) -> Option<Descriptor>;
    async fn put(&self, digest: OciDigest, descriptor: Descriptor);
    async fn invalidate(&self, digest: &OciDigest);
}

/// The no-op cache: every lookup misses. Used when no cache provider is configured.
#[derive(Clone, Debug, Default)]
pub struct NoopCache;

#[async_trait]
impl DescriptorCache for NoopCache {
    async fn get(&self, _digest: &OciDigest) -> Option<Descriptor> {
        None
    }

    async fn put(&self, _digest: OciDigest, _descriptor: Descriptor) {}

    async fn invalidate(&self, _digest: &OciDigest) {}
}

/// A simple in-process descriptor cache backed by a mutex-guarded map. Sufficient for a
/// single registry process; a multi-node deployment would supply its own
/// [`DescriptorCache`] (eg backed by a shared cache service).
#[derive(Default)]
pub struct MemoryCache {
    entries: std::sync::Mutex<std::collections::HashMap<OciDigest, Descriptor>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DescriptorCache for MemoryCache {
    async fn get(&self, digest: &OciDigest) -> Option<Descriptor> {
        self.entries
            .lock()
            .expect("lock poisoned")
            .get(digest)
            .cloned()
    }

    async fn put(&self, digest: OciDigest, descriptor: Descriptor) {
        self.entries
            .lock()
            .expect("lock poisoned")
            .insert(digest, descriptor);
    }

    async fn invalidate(&self, digest: &OciDigest) {
        self.entries.lock().expect("lock poisoned").remove(digest);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use oci_spec::image::MediaType;

    fn digest() -> OciDigest {
        "sha256:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"
            .try_into()
            .unwrap()
    }

    #[tokio::test]
    async fn noop_cache_always_misses() {
        let cache = NoopCache;
        cache
            .put(digest(), Descriptor::new(MediaType::ImageConfig, 0, digest().to_string()))
            .await;
        assert!(cache.get(&digest()).await.is_none());
    }

    #[tokio::test]
    async fn memory_cache_roundtrips_and_invalidates() {
        let cache = MemoryCache::new();
        let d = Descriptor::new(MediaType::ImageConfig, 12, digest().to_string());
        cache.put(digest(), d.clone()).await;
        assert_eq!(cache.get(&digest()).await.unwrap().digest(), d.digest());

        cache.invalidate(&digest()).await;
        assert!(cache.get(&digest()).await.is_none());
    }
}
