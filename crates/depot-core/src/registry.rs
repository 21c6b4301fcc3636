//! # Registry abstractions
//!
//! Defines the interoperability layer between the storage-agnostic registry facade
//! ([`crate`]'s consumers) and backend implementations.
//!
//! ## Known implementations
//!
//! ### depot-backend-fs
//!
//! Implementation of the traits defined here over a pluggable [`ObjectStore`]-backed
//! (`depot_objectstore`) content-addressable store, with repository namespacing expressed
//! entirely as link files rather than a metadata database -- there is no external metadata
//! store distinguishing relationships between images, manifests, blobs, layers, and tags:
//! every one of those relationships is a small object in the backend itself.
use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_core::Stream;
use oci_spec::distribution::TagList;
use oci_spec::image::{Descriptor, ImageIndex, ImageManifest, MediaType};
use once_cell::sync::Lazy;
use regex::Regex;
use uuid::Uuid;

use crate::errors::{DistributionErrorCode, Error, RepositoryError, Result};
use crate::oci_digest::OciDigest;
use crate::options::Options;

/// Provides access to [`RepositoryStore`] instances.
///
/// Backend implementations may impose their own access control and repository limit
/// policies.
#[async_trait]
pub trait RepositoryStoreManager: Clone + Send + Sync + 'static {
    type RepositoryStore: RepositoryStore;
    type Error: std::error::Error + Into<crate::errors::RepositoryError> + Send + Sync;

    /// Get the `RepositoryStore` corresponding to the given name, if it already exists.
    async fn get(
        &self,
        name: &str,
    ) -> std::result::Result<Option<Self::RepositoryStore>, Self::Error>;

    /// Create a new `RepositoryStore` with the given name.
    async fn create(&self, name: &str) -> std::result::Result<Self::RepositoryStore, Self::Error>;

    /// Enumerate every repository name known to the backend, in lexicographic order, for use
    /// by the catalog endpoint and the garbage collector. `last` restricts results to names
    /// strictly greater than it (pagination cursor); returns `true` if more names remain
    /// beyond what was appended to `buf`.
    async fn repositories(
        &self,
        buf: &mut Vec<String>,
        n: usize,
        last: Option<&str>,
    ) -> std::result::Result<bool, Self::Error>;
}

/// Provides access to a [`ManifestStore`], [`BlobStore`], [`TagStore`], and
/// [`UploadSessionStore`] scoped to a single repository.
#[async_trait]
pub trait RepositoryStore: Clone + Send + Sync + 'static {
    type ManifestStore: ManifestStore;
    type BlobStore: BlobStore;
    type TagStore: TagStore;
    type UploadSessionStore: UploadSessionStore;

    type Error: std::error::Error + Into<crate::errors::RepositoryError> + Send + Sync;

    /// The name of the repository accessed by this `RepositoryStore`.
    fn name(&self) -> &str;

    fn get_manifest_store(&self) -> Self::ManifestStore;
    fn get_blob_store(&self) -> Self::BlobStore;
    fn get_tag_store(&self) -> Self::TagStore;
    fn get_upload_session_store(&self) -> Self::UploadSessionStore;
}

/// Provides access to upload sessions.
#[async_trait]
pub trait UploadSessionStore: Clone + Send + Sync + 'static {
    type UploadSession: UploadSession + Send + Sync + 'static;
    type Error: std::error::Error + Into<crate::errors::BlobError> + Send + Sync;

    async fn new_upload_session(&self) -> std::result::Result<Self::UploadSession, Self::Error>;

    async fn get_upload_session(
        &self,
        session_uuid: &Uuid,
    ) -> std::result::Result<Self::UploadSession, Self::Error>;

    async fn delete_session(&self, session_uuid: &Uuid) -> std::result::Result<(), Self::Error>;
}

/// Provides access to registry manifests within a repository.
#[async_trait]
pub trait ManifestStore: Send + Sync + 'static {
    type Manifest: Manifest;
    type Error: std::error::Error + Into<crate::errors::ManifestError> + Send + Sync;
    type ManifestBody: Stream<Item = std::result::Result<Bytes, Box<dyn std::error::Error + Send + Sync>>>
        + Send;

    async fn head(
        &self,
        key: &ManifestRef,
    ) -> std::result::Result<Option<Self::Manifest>, Self::Error>;

    async fn get(
        &self,
        key: &ManifestRef,
    ) -> std::result::Result<Option<(Self::Manifest, Self::ManifestBody)>, Self::Error>;

    async fn put(
        &mut self,
        key: &ManifestRef,
        spec: &ManifestSpec,
        bytes: Bytes,
    ) -> std::result::Result<OciDigest, Self::Error>;

    async fn delete(&mut self, key: &ManifestRef) -> std::result::Result<(), Self::Error>;

    /// Returns an [`ImageIndex`] of manifests whose `subject` descriptor references `subject`,
    /// optionally restricted to `artifact_type`.
    async fn get_referrers(
        &self,
        subject: &OciDigest,
        artifact_type: Option<String>,
    ) -> std::result::Result<ImageIndex, Self::Error>;
}

/// Provides access to tag references within a repository.
#[async_trait]
pub trait TagStore: Send + Sync + 'static {
    type Error: std::error::Error + Into<crate::errors::ManifestError> + Send + Sync;

    /// Record `descriptor` as a new revision of `tag`, then overwrite `tag`'s current
    /// pointer. The index entry is written before the current pointer so that a reader
    /// which observes the new current pointer can always resolve it via the index.
    async fn tag(&mut self, tag: &str, descriptor: Descriptor) -> std::result::Result<(), Self::Error>;

    /// Resolve a tag's current revision, if the tag exists.
    async fn get(&self, tag: &str) -> std::result::Result<Option<Descriptor>, Self::Error>;

    /// Remove a tag (and its revision index) entirely.
    async fn untag(&mut self, tag: &str) -> std::result::Result<(), Self::Error>;

    /// Return an OCI [`TagList`] of tags in this repository, lexicographically sorted and
    /// paginated the way the manifest store's `get_tags` used to be.
    async fn get_tags(
        &self,
        n: Option<usize>,
        last: Option<String>,
    ) -> std::result::Result<TagList, Self::Error>;

    /// Return every tag whose current revision equals `descriptor`.
    async fn lookup(
        &self,
        descriptor: &Descriptor,
    ) -> std::result::Result<Vec<String>, Self::Error>;

    /// Return every digest ever recorded as a revision of `tag`.
    async fn manifest_digests(
        &self,
        tag: &str,
    ) -> std::result::Result<Vec<OciDigest>, Self::Error>;
}

/// Provides access to registry blobs within a repository.
#[async_trait]
pub trait BlobStore: Send + Sync + 'static {
    type BlobWriter: BlobWriter;
    type Error: std::error::Error + Into<crate::errors::BlobError> + Send + Sync;
    type UploadSession: UploadSession + Send + Sync + 'static;
    type Blob: Blob;
    type BlobBody: Stream<Item = std::result::Result<Bytes, Box<dyn std::error::Error + Send + Sync>>>
        + Send;

    async fn head(&self, key: &OciDigest) -> std::result::Result<Option<Self::Blob>, Self::Error>;

    async fn get(
        &self,
        key: &OciDigest,
    ) -> std::result::Result<Option<(Self::Blob, Self::BlobBody)>, Self::Error>;

    /// Small-object write: digest, store, and link in one step. Used for config blobs and
    /// other objects a caller already holds entirely in memory.
    async fn put(&mut self, bytes: Bytes) -> std::result::Result<OciDigest, Self::Error>;

    /// Remove this repository's link to `digest`. Never removes the underlying blob data --
    /// that is solely the garbage collector's responsibility.
    async fn delete(&mut self, digest: &OciDigest) -> std::result::Result<(), Self::Error>;

    /// Start a new upload session, or -- if `mount_from` is set -- mount an existing blob
    /// from another repository directly, short-circuiting the writer entirely.
    async fn create(
        &mut self,
        mount_from: Option<&str>,
        digest: Option<&OciDigest>,
    ) -> std::result::Result<CreateBlobWriterOutcome<Self::BlobWriter>, Self::Error>;

    async fn resume(
        &self,
        session_uuid: &Uuid,
    ) -> std::result::Result<Self::BlobWriter, Self::Error>;

    /// Remove every link-file this repository holds into the global blob pool. Used by the
    /// garbage collector's candidate-enumeration phase, and by repository deletion.
    async fn enumerate(
        &self,
        f: &mut (dyn FnMut(OciDigest) -> std::result::Result<(), Self::Error> + Send),
    ) -> std::result::Result<(), Self::Error>;
}

/// Outcome of [`BlobStore::create`]: either a writer to stream bytes into, or -- for a
/// successful mount -- the descriptor of the blob that was mounted without copying any
/// bytes.
pub enum CreateBlobWriterOutcome<W> {
    Writer(W),
    Mounted(Descriptor),
}

/// Implements resumable, chunked blob uploads.
#[async_trait]
pub trait BlobWriter: Send + Sync + 'static {
    type Error: std::error::Error + Into<crate::errors::BlobError> + Send + Sync;
    type UploadSession: UploadSession + Send + Sync + 'static;

    async fn write(
        &mut self,
        content_length: u64,
        body: crate::stream::InputBody,
    ) -> std::result::Result<(), Self::Error>;

    async fn write_chunked(
        &mut self,
        body: crate::stream::InputBody,
    ) -> std::result::Result<(), Self::Error>;

    /// Flush, verify against `provided` (if given) -- both its size and its digest -- move
    /// the temp file into the content-addressed blob pool, and create this repository's
    /// link. Returns the canonical descriptor on success.
    async fn commit(
        self,
        provided: Option<&Descriptor>,
    ) -> std::result::Result<Descriptor, Self::Error>;

    /// Abort the upload, deleting all upload-scoped resources. Idempotent.
    async fn cancel(self) -> std::result::Result<(), Self::Error>;

    fn session(&self) -> &Self::UploadSession;
}

/// Provides access to blob metadata.
pub trait Blob {
    fn digest(&self) -> &OciDigest;
    fn bytes_on_disk(&self) -> u64;
    fn media_type(&self) -> &Option<MediaType>;
}

/// Provides access to manifest metadata.
pub trait Manifest {
    fn bytes_on_disk(&self) -> u64;
    fn digest(&self) -> &OciDigest;
    fn media_type(&self) -> &Option<MediaType>;
}

/// Provides access to blob upload session metadata.
pub trait UploadSession {
    fn uuid(&self) -> &Uuid;
    fn started_at(&self) -> DateTime<Utc>;
    fn last_range_end(&self) -> u64;
}

/// Abstraction over [`ImageManifest`] and [`ImageIndex`].
pub enum ManifestSpec {
    Image(ImageManifest),
    Index(ImageIndex),
}

impl TryFrom<&Bytes> for ManifestSpec {
    type Error = Error;

    fn try_from(bs: &Bytes) -> Result<Self> {
        let img_rej_err = match serde_json::from_slice::<ImageManifest>(bs) {
            Ok(m) => return Ok(ManifestSpec::Image(m)),
            Err(e) => e,
        };
        match serde_json::from_slice::<ImageIndex>(bs) {
            Ok(m) => Ok(ManifestSpec::Index(m)),
            Err(ind_rej_err) => {
                tracing::warn!("unable to deserialize manifest as image: {img_rej_err:?}");
                tracing::warn!("unable to deserialize manifest as index: {ind_rej_err:?}");
                Err(Error::DistributionSpecError(
                    DistributionErrorCode::ManifestInvalid,
                ))
            }
        }
    }
}

impl ManifestSpec {
    #[inline(always)]
    pub fn media_type(&self) -> Option<MediaType> {
        match self {
            ManifestSpec::Image(im) => im.media_type().clone(),
            ManifestSpec::Index(ii) => ii.media_type().clone(),
        }
    }

    #[inline(always)]
    pub fn artifact_type(&self) -> Option<MediaType> {
        match self {
            ManifestSpec::Image(im) => im.artifact_type().clone(),
            ManifestSpec::Index(ii) => ii.artifact_type().clone(),
        }
    }

    #[inline(always)]
    pub fn annotations(&self) -> Option<HashMap<String, String>> {
        match self {
            ManifestSpec::Image(im) => im.annotations().clone(),
            ManifestSpec::Index(ii) => ii.annotations().clone(),
        }
    }

    #[inline(always)]
    pub fn subject(&self) -> Option<Descriptor> {
        match self {
            ManifestSpec::Image(im) => im.subject().clone(),
            ManifestSpec::Index(ii) => ii.subject().clone(),
        }
    }

    /// Descriptors this manifest directly references: the config blob and layers for an
    /// image manifest, or the child manifests for an index. Used to validate referenced
    /// content exists, and by the garbage collector's mark phase to walk the reference
    /// graph.
    pub fn references(&self) -> Vec<Descriptor> {
        match self {
            ManifestSpec::Image(im) => {
                let mut refs = vec![im.config().clone()];
                refs.extend(im.layers().iter().cloned());
                refs
            }
            ManifestSpec::Index(ii) => ii.manifests().clone(),
        }
    }

    #[inline(always)]
    pub fn set_media_type(&mut self, s: &str) {
        let mt: MediaType = s.into();
        match self {
            ManifestSpec::Image(im) => {
                im.set_media_type(Some(mt));
            }
            ManifestSpec::Index(ii) => {
                ii.set_media_type(Some(mt));
            }
        }
    }

    /// Infer the media type of the manifest if not present, per the rules in the OCI image
    /// manifest specification.
    pub fn infer_media_type(&mut self) -> Result<()> {
        match self {
            ManifestSpec::Image(im) => {
                if im.artifact_type().is_some() {
                    im.set_media_type(Some(MediaType::ImageManifest));
                    return Ok(());
                } else if im.config().media_type() == &MediaType::EmptyJSON {
                    return Err(Error::DistributionSpecError(
                        DistributionErrorCode::ManifestInvalid,
                    ));
                }

                if im.config().media_type() == &MediaType::ImageConfig {
                    im.set_media_type(Some(MediaType::ImageManifest));
                    return Ok(());
                }

                Err(Error::DistributionSpecError(
                    DistributionErrorCode::ManifestInvalid,
                ))
            }
            ManifestSpec::Index(ii) => {
                ii.set_media_type(Some(MediaType::ImageIndex));
                Ok(())
            }
        }
    }
}

/// Reference to an [OCI manifest](https://github.com/opencontainers/image-spec/blob/main/manifest.md),
/// as specified by the distribution spec's `<reference>` path segment: either the digest of
/// the manifest or a tag name, and no other format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestRef {
    Digest(OciDigest),
    Tag(String),
}

impl std::str::FromStr for ManifestRef {
    type Err = Error;

    /// Tries [`OciDigest`] first; if that fails, validates the distribution spec tag regex
    /// `[a-zA-Z0-9_][a-zA-Z0-9._-]{0,127}`.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if let Ok(dgst) = OciDigest::try_from(s) {
            return Ok(Self::Digest(dgst));
        }
        static RE: Lazy<Regex> =
            Lazy::new(|| Regex::new(r"^[a-zA-Z0-9_][a-zA-Z0-9._-]{0,127}$").unwrap());

        if RE.is_match(s) {
            return Ok(Self::Tag(String::from(s)));
        }

        Err(Error::DistributionSpecError(
            DistributionErrorCode::ManifestInvalid,
        ))
    }
}

/// Composes a [`RepositoryStoreManager`] with registry-wide [`Options`] behind the
/// `Namespace -> Repository -> {Blobs, Manifests, Tags}` facade (component J). This is the
/// type application code is expected to construct once at startup and share (it is cheap to
/// clone -- the manager itself is `Clone` and options are wrapped for sharing by the
/// manager's own construction).
///
/// An `Arc`-shared manager plus static-repository bootstrapping, with no HTTP router
/// responsibility -- this crate exposes a library surface only.
#[derive(Clone)]
pub struct Registry<M: RepositoryStoreManager> {
    manager: M,
    options: Options,
}

impl<M: RepositoryStoreManager> Registry<M> {
    pub fn new(manager: M, options: Options) -> Self {
        Self { manager, options }
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn manager(&self) -> &M {
        &self.manager
    }

    /// Fetch a repository handle by name, if it already exists.
    pub async fn repository(&self, name: &str) -> std::result::Result<Option<M::RepositoryStore>, RepositoryError> {
        self.manager.get(name).await.map_err(Into::into)
    }

    /// Fetch or lazily create a repository handle.
    pub async fn repository_or_create(
        &self,
        name: &str,
    ) -> std::result::Result<M::RepositoryStore, RepositoryError> {
        match self.manager.get(name).await.map_err(Into::into)? {
            Some(repo) => Ok(repo),
            None => self.manager.create(name).await.map_err(Into::into),
        }
    }

    /// Enumerate every known repository name, paginated. See
    /// [`RepositoryStoreManager::repositories`].
    pub async fn repositories(
        &self,
        buf: &mut Vec<String>,
        n: usize,
        last: Option<&str>,
    ) -> std::result::Result<bool, RepositoryError> {
        self.manager.repositories(buf, n, last).await.map_err(Into::into)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn manifest_ref_digest() {
        let r: ManifestRef =
            "sha256:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"
                .parse()
                .unwrap();
        assert!(matches!(r, ManifestRef::Digest(_)));
    }

    #[test]
    fn manifest_ref_tag() {
        let r: ManifestRef = "latest".parse().unwrap();
        assert_eq!(r, ManifestRef::Tag("latest".to_string()));
    }

    #[test]
    fn manifest_ref_rejects_invalid_tag() {
        let r: Result<ManifestRef> = "".parse();
        assert!(r.is_err());
    }
}
