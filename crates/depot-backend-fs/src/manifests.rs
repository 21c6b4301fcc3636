//! Manifest store (component F): manifests are stored as ordinary content-addressed blobs
//! (§2, the backend layout diagram puts `_manifests/revisions` and `_layers` side by side,
//! both linking into the same `blobs/` pool) and distinguished from layer blobs only by
//! which link namespace references them.
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use oci_spec::image::{Descriptor, ImageIndex, MediaType};

use depot_core::registry::{self as reg, ManifestRef, ManifestSpec};
use depot_core::{DescriptorCache, Options, OciDigest, PathMapper, PathSpec};
use depot_objectstore::{Key, ObjectStore};

use crate::blobstore::GlobalBlobStore;
use crate::errors::{Error, Result};
use crate::links::LinkNamespace;

type TryBytes = std::result::Result<Bytes, Box<dyn std::error::Error + Send + Sync>>;

#[derive(Clone, Debug)]
pub struct FsManifest {
    digest: OciDigest,
    size: u64,
    media_type: Option<MediaType>,
}

impl reg::Manifest for FsManifest {
    fn bytes_on_disk(&self) -> u64 {
        self.size
    }

    fn digest(&self) -> &OciDigest {
        &self.digest
    }

    fn media_type(&self) -> &Option<MediaType> {
        &self.media_type
    }
}

#[derive(Clone)]
pub struct FsManifestStore {
    objects: Arc<dyn ObjectStore>,
    paths: PathMapper,
    repository: String,
    global: GlobalBlobStore,
    cache: Arc<dyn DescriptorCache>,
    options: Options,
}

impl FsManifestStore {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        repository: String,
        cache: Arc<dyn DescriptorCache>,
        options: Options,
    ) -> Self {
        Self {
            global: GlobalBlobStore::new(objects.clone()),
            objects,
            paths: PathMapper::new(),
            repository,
            cache,
            options,
        }
    }

    fn revision_link_key(&self, digest: &OciDigest) -> Result<Key> {
        LinkNamespace::ManifestRevisions.link_key(&self.paths, &self.repository, digest)
    }

    fn layer_link_key(&self, digest: &OciDigest) -> Result<Key> {
        LinkNamespace::Layers.link_key(&self.paths, &self.repository, digest)
    }

    async fn is_revision(&self, digest: &OciDigest) -> Result<bool> {
        Ok(self.objects.exists(&self.revision_link_key(digest)?).await?)
    }

    async fn resolve_ref(&self, key: &ManifestRef) -> Result<Option<OciDigest>> {
        match key {
            ManifestRef::Digest(d) => {
                if self.is_revision(d).await? {
                    Ok(Some(d.clone()))
                } else {
                    Ok(None)
                }
            }
            ManifestRef::Tag(tag) => {
                let current = Key::try_from(
                    self.paths
                        .path(&PathSpec::ManifestTagCurrentLink {
                            name: &self.repository,
                            tag,
                        })
                        .as_str(),
                )?;
                if !self.objects.exists(&current).await? {
                    return Ok(None);
                }
                Ok(Some(self.global.readlink(&current).await?))
            }
        }
    }

    async fn load(&self, digest: &OciDigest) -> Result<(FsManifest, Bytes)> {
        let bytes = self.global.get_bytes(digest).await?;
        let spec = ManifestSpec::try_from(&bytes).map_err(Error::Core)?;
        let manifest = FsManifest {
            digest: digest.clone(),
            size: bytes.len() as u64,
            media_type: spec.media_type(),
        };
        Ok((manifest, bytes))
    }

    /// Checks one config/layer descriptor against the foreign-url, media-type, and
    /// existence rules (§4.F steps 2-4), recording any failure into `missing`/`violations`
    /// instead of short-circuiting so `validate_references` can report every bad descriptor
    /// in one `ManifestVerification`, not just the first.
    async fn check_blob_descriptor(
        &self,
        desc: &Descriptor,
        policy: &depot_core::AllowDeny,
        is_config: bool,
        missing: &mut Vec<String>,
        violations: &mut Vec<Error>,
    ) -> Result<()> {
        if let Some(urls) = desc.urls() {
            for url in urls {
                if !self.options.manifest_urls.is_allowed(url) {
                    violations.push(Error::ManifestInvalid(format!("foreign layer url not allowed: {url}")));
                }
            }
            return Ok(());
        }
        if !policy.is_allowed(&desc.media_type().to_string()) {
            let media_type = desc.media_type().to_string();
            violations.push(if is_config {
                Error::ManifestConfigMediaTypeForbidden(media_type)
            } else {
                Error::ManifestLayerMediaTypeForbidden(media_type)
            });
            return Ok(());
        }
        let digest: OciDigest = desc.digest().as_str().try_into().map_err(Error::Core)?;
        if !self.objects.exists(&self.layer_link_key(&digest)?).await? {
            missing.push(desc.digest().to_string());
        }
        Ok(())
    }

    /// Every layer/config descriptor (image manifest) or child manifest (image index) this
    /// manifest references must already be known to this repository -- either as a linked
    /// blob or, for indexes, as a linked manifest revision. Image manifests additionally
    /// enforce the config/layer media-type and foreign-url allow/deny policies. Every check
    /// below runs regardless of earlier failures; `validate_references` reports them all at
    /// once rather than stopping at the first violation.
    async fn validate_references(&self, spec: &ManifestSpec) -> Result<()> {
        match spec {
            ManifestSpec::Image(im) => {
                let mut missing = Vec::new();
                let mut violations = Vec::new();
                self.check_blob_descriptor(
                    im.config(),
                    &self.options.manifest_config_media_types,
                    true,
                    &mut missing,
                    &mut violations,
                )
                .await?;
                for desc in im.layers() {
                    self.check_blob_descriptor(
                        desc,
                        &self.options.manifest_layer_media_types,
                        false,
                        &mut missing,
                        &mut violations,
                    )
                    .await?;
                }
                if !missing.is_empty() {
                    violations.push(Error::ManifestBlobUnknown(missing));
                }
                match violations.len() {
                    0 => {}
                    1 => return Err(violations.into_iter().next().unwrap()),
                    _ => return Err(Error::ManifestVerification(violations)),
                }
            }
            ManifestSpec::Index(_) => {
                let mut missing = Vec::new();
                if self.options.validate_image_indexes.images_exist {
                    for desc in spec.references() {
                        if !self.options.validate_image_indexes.image_platforms.is_empty() {
                            let matches = desc.platform().as_ref().is_some_and(|p| {
                                self.options.validate_image_indexes.image_platforms.iter().any(|pt| {
                                    pt.architecture == p.architecture().to_string()
                                        && pt.os == p.os().to_string()
                                })
                            });
                            if !matches {
                                continue;
                            }
                        }
                        let digest: OciDigest =
                            desc.digest().as_str().try_into().map_err(Error::Core)?;
                        if !self.is_revision(&digest).await? {
                            missing.push(desc.digest().to_string());
                        }
                    }
                }
                if !missing.is_empty() {
                    return Err(Error::ManifestUnknown);
                }
            }
        }
        Ok(())
    }

    /// Remove every tag in this repository whose current revision is `digest`, so a deleted
    /// manifest does not leave a dangling tag pointer behind.
    async fn untag_all(&self, digest: &OciDigest) -> Result<()> {
        let tags_root = Key::try_from(
            self.paths
                .path(&PathSpec::ManifestTagsRoot { name: &self.repository })
                .as_str(),
        )?;
        for tag in self.objects.list(&tags_root).await? {
            let current = Key::try_from(
                self.paths
                    .path(&PathSpec::ManifestTagCurrentLink {
                        name: &self.repository,
                        tag: &tag,
                    })
                    .as_str(),
            )?;
            if let Ok(d) = self.global.readlink(&current).await {
                if &d == digest {
                    let tag_root = Key::try_from(
                        self.paths
                            .path(&PathSpec::ManifestTag {
                                name: &self.repository,
                                tag: &tag,
                            })
                            .as_str(),
                    )?;
                    self.objects.delete_prefix(&tag_root).await?;
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl reg::ManifestStore for FsManifestStore {
    type Manifest = FsManifest;
    type Error = Error;
    type ManifestBody = BoxStream<'static, TryBytes>;

    async fn head(&self, key: &ManifestRef) -> Result<Option<FsManifest>> {
        match self.resolve_ref(key).await? {
            Some(digest) => Ok(Some(self.load(&digest).await?.0)),
            None => Ok(None),
        }
    }

    async fn get(&self, key: &ManifestRef) -> Result<Option<(FsManifest, Self::ManifestBody)>> {
        match self.resolve_ref(key).await? {
            Some(digest) => {
                let (manifest, bytes) = self.load(&digest).await?;
                let body = futures::stream::once(async move { Ok(bytes) }).boxed();
                Ok(Some((manifest, body)))
            }
            None => Ok(None),
        }
    }

    async fn put(&mut self, key: &ManifestRef, spec: &ManifestSpec, bytes: Bytes) -> Result<OciDigest> {
        self.validate_references(spec).await?;

        let digest = self.global.put(bytes).await?;
        self.global.link(&self.revision_link_key(&digest)?, &digest).await?;

        if let ManifestRef::Tag(tag) = key {
            let index_key = Key::try_from(
                self.paths
                    .path(&PathSpec::ManifestTagIndexEntryLink {
                        name: &self.repository,
                        tag,
                        digest: &digest,
                    })
                    .as_str(),
            )?;
            self.global.link(&index_key, &digest).await?;

            let current_key = Key::try_from(
                self.paths
                    .path(&PathSpec::ManifestTagCurrentLink {
                        name: &self.repository,
                        tag,
                    })
                    .as_str(),
            )?;
            self.global.link(&current_key, &digest).await?;
        }

        Ok(digest)
    }

    async fn delete(&mut self, key: &ManifestRef) -> Result<()> {
        if !self.options.delete_enabled {
            return Err(Error::Unsupported);
        }
        let digest = self.resolve_ref(key).await?.ok_or(Error::ManifestUnknown)?;
        self.untag_all(&digest).await?;
        self.objects.delete(&self.revision_link_key(&digest)?).await?;
        self.cache.invalidate(&digest).await;
        Ok(())
    }

    async fn get_referrers(
        &self,
        subject: &OciDigest,
        artifact_type: Option<String>,
    ) -> Result<ImageIndex> {
        let root = LinkNamespace::ManifestRevisions.root_key(&self.paths, &self.repository)?;
        let mut keys = Vec::new();
        self.objects
            .walk(&root, &mut |k| {
                keys.push(k);
                Ok(())
            })
            .await?;

        let mut set = tokio::task::JoinSet::new();
        for key in keys {
            let global = self.global.clone();
            let subject_str = subject.to_string();
            let artifact_type = artifact_type.clone();
            set.spawn(async move {
                let digest = global.readlink(&key).await?;
                let bytes = global.get_bytes(&digest).await?;
                let spec = ManifestSpec::try_from(&bytes).map_err(Error::Core)?;
                let Some(s) = spec.subject() else {
                    return Ok::<Option<Descriptor>, Error>(None);
                };
                if s.digest().as_str() != subject_str.as_str() {
                    return Ok(None);
                }
                if let Some(at) = &artifact_type {
                    if spec.artifact_type().map(|m| m.to_string()).as_deref() != Some(at.as_str()) {
                        return Ok(None);
                    }
                }
                let mut d = Descriptor::new(
                    spec.media_type().unwrap_or(MediaType::ImageManifest),
                    bytes.len() as i64,
                    digest.to_string(),
                );
                d.set_artifact_type(spec.artifact_type());
                d.set_annotations(spec.annotations());
                Ok(Some(d))
            });
        }

        let mut descriptors: Vec<Descriptor> = Vec::new();
        while let Some(res) = set.join_next().await {
            match res {
                Err(e) => {
                    if e.is_panic() {
                        tracing::error!("manifest deserialization task panicked while getting referrers for {subject}");
                    }
                    return Err(e.into());
                }
                Ok(Err(e)) => return Err(e),
                Ok(Ok(None)) => {}
                Ok(Ok(Some(d))) => descriptors.push(d),
            }
        }

        descriptors.sort_unstable_by(|l, r| l.digest().cmp(r.digest()));

        let mut index = ImageIndex::default();
        index.set_media_type(Some(MediaType::ImageIndex));
        index.set_manifests(descriptors);
        Ok(index)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use depot_core::registry::ManifestStore;
    use depot_core::NoopCache;
    use depot_objectstore::memory::InMemory;
    use oci_spec::image::{ConfigBuilder, ImageManifestBuilder};

    fn store() -> FsManifestStore {
        let objects: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        FsManifestStore::new(objects, "library/alpine".to_string(), Arc::new(NoopCache), Options::default())
    }

    fn empty_image_manifest() -> (ManifestSpec, Bytes) {
        let config = ConfigBuilder::default()
            .media_type(MediaType::ImageConfig)
            .size(0_i64)
            .digest("sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855")
            .build()
            .unwrap();
        let manifest = ImageManifestBuilder::default()
            .schema_version(2_u32)
            .media_type(MediaType::ImageManifest)
            .config(config)
            .layers(Vec::new())
            .build()
            .unwrap();
        let bytes = Bytes::from(serde_json::to_vec(&manifest).unwrap());
        (ManifestSpec::Image(manifest), bytes)
    }

    #[tokio::test]
    async fn put_rejects_missing_config_blob() {
        let mut store = store();
        let (spec, bytes) = empty_image_manifest();
        let key: ManifestRef = "latest".parse().unwrap();
        let err = store.put(&key, &spec, bytes).await.unwrap_err();
        assert!(matches!(err, Error::ManifestBlobUnknown(_)));
    }

    #[tokio::test]
    async fn put_then_get_by_tag_roundtrips() {
        let mut store = store();
        // link the empty config blob into this repository first via the global store +
        // layer link, the same way a config PUT would.
        let empty: OciDigest = "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
            .try_into()
            .unwrap();
        store.global.put_empty(&empty).await.unwrap();
        store
            .global
            .link(&store.layer_link_key(&empty).unwrap(), &empty)
            .await
            .unwrap();

        let (spec, bytes) = empty_image_manifest();
        let key: ManifestRef = "latest".parse().unwrap();
        let digest = store.put(&key, &spec, bytes.clone()).await.unwrap();

        let (manifest, body) = store.get(&key).await.unwrap().unwrap();
        assert_eq!(manifest.digest(), &digest);
        let got: Vec<Bytes> = body.try_collect().await.unwrap();
        assert_eq!(got.concat(), bytes.to_vec());
    }

    #[tokio::test]
    async fn delete_unknown_manifest_errors() {
        let mut store = store();
        let key: ManifestRef = "missing".parse().unwrap();
        let err = store.delete(&key).await.unwrap_err();
        assert!(matches!(err, Error::ManifestUnknown));
    }

    #[tokio::test]
    async fn delete_disabled_by_options_is_unsupported() {
        let objects: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let mut store = FsManifestStore::new(
            objects,
            "library/alpine".to_string(),
            Arc::new(NoopCache),
            Options {
                delete_enabled: false,
                ..Options::default()
            },
        );
        let empty: OciDigest = "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
            .try_into()
            .unwrap();
        store.global.put_empty(&empty).await.unwrap();
        store.global.link(&store.layer_link_key(&empty).unwrap(), &empty).await.unwrap();

        let (spec, bytes) = empty_image_manifest();
        let key: ManifestRef = "latest".parse().unwrap();
        store.put(&key, &spec, bytes).await.unwrap();

        let err = store.delete(&key).await.unwrap_err();
        assert!(matches!(err, Error::Unsupported));
    }

    #[tokio::test]
    async fn put_aggregates_missing_layer_and_forbidden_layer_media_type() {
        use regex::Regex;

        let objects: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let options = Options {
            manifest_layer_media_types: depot_core::AllowDeny {
                allow: None,
                deny: Some(Regex::new(r"^application/vnd\.forbidden$").unwrap()),
            },
            ..Options::default()
        };
        let mut store = FsManifestStore::new(objects, "library/alpine".to_string(), Arc::new(NoopCache), options);

        let empty: OciDigest = "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
            .try_into()
            .unwrap();
        store.global.put_empty(&empty).await.unwrap();
        store.global.link(&store.layer_link_key(&empty).unwrap(), &empty).await.unwrap();

        let config = ConfigBuilder::default()
            .media_type(MediaType::ImageConfig)
            .size(0_i64)
            .digest(empty.to_string())
            .build()
            .unwrap();
        let forbidden_layer = Descriptor::new(
            MediaType::Other("application/vnd.forbidden".to_string()),
            4,
            "sha256:bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb",
        );
        let missing_layer = Descriptor::new(
            MediaType::ImageLayer,
            4,
            "sha256:cccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccc",
        );
        let manifest = ImageManifestBuilder::default()
            .schema_version(2_u32)
            .media_type(MediaType::ImageManifest)
            .config(config)
            .layers(vec![forbidden_layer, missing_layer])
            .build()
            .unwrap();
        let bytes = Bytes::from(serde_json::to_vec(&manifest).unwrap());
        let key: ManifestRef = "latest".parse().unwrap();

        let err = store.put(&key, &ManifestSpec::Image(manifest), bytes).await.unwrap_err();
        match err {
            Error::ManifestVerification(violations) => {
                assert_eq!(violations.len(), 2);
                assert!(violations
                    .iter()
                    .any(|v| matches!(v, Error::ManifestLayerMediaTypeForbidden(_))));
                assert!(violations.iter().any(|v| matches!(v, Error::ManifestBlobUnknown(_))));
            }
            other => panic!("expected ManifestVerification, got {other:?}"),
        }
    }
}
