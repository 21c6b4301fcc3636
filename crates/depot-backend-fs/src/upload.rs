//! Upload controller (component D): a resumable streaming write session.
//!
//! Drives the [`depot_objectstore::ObjectStore`] multipart primitives with session
//! bookkeeping persisted as small JSON/text objects next to the upload's data rather than
//! database rows: `startedat` (RFC3339, §6.1) and a `state` blob (chunk records, object-store
//! upload id) at the paths `depot_core::path::PathSpec::UploadState` documents.
//!
//! The object actually written to by `initiate_chunked_upload`/`upload_chunk` (the "session
//! key") is kept distinct from the object `finalize_chunked_upload` publishes the
//! concatenated bytes under (the "finalized key") -- the S3 driver's finalize completes the
//! multipart upload at the session key and then copies it to the destination key, which
//! would delete its own output if the two keys were equal.
//!
//! ```text
//!   created ── write* ──▶ written ── commit ──▶ committed (terminal)
//!      │                     │
//!      │                     └─ cancel ──▶ cancelled (terminal)
//!      └─ cancel ──▶ cancelled
//! ```
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::{StreamExt, TryStreamExt};
use oci_spec::image::{Descriptor, MediaType};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use depot_core::registry::{self as reg};
use depot_core::{ChunkedBody, DescriptorCache, DigestBody, Digester, InputBody, OciDigest, PathMapper, PathSpec};
use depot_objectstore::{Chunk, Key, ObjectStore};

use crate::blobstore::GlobalBlobStore;
use crate::errors::{Error, Result};
use crate::links::LinkNamespace;

/// sha256 of the empty byte string -- the one digest [`FsBlobWriter::commit`] is allowed to
/// produce for a session that never received any bytes (§4.D step 7).
const EMPTY_BLOB_SHA256: &str =
    "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

#[derive(Clone, Debug, Serialize, Deserialize)]
struct ChunkRecord {
    e_tag: Option<String>,
    chunk_number: i32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct SessionState {
    upload_id: Option<String>,
    chunks: Vec<ChunkRecord>,
    last_range_end: i64,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            upload_id: None,
            chunks: Vec::new(),
            last_range_end: -1,
        }
    }
}

/// Observable upload session handle: `{id, startedAt, repository, dataPath, digester-state}`
/// from §3's data model, minus the digester state (kept separately, see
/// [`FsBlobWriter`]'s doc comment on resumability).
#[derive(Clone, Debug)]
pub struct FsUploadSession {
    uuid: Uuid,
    started_at: DateTime<Utc>,
    state: SessionState,
}

impl reg::UploadSession for FsUploadSession {
    fn uuid(&self) -> &Uuid {
        &self.uuid
    }

    fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    fn last_range_end(&self) -> u64 {
        self.state.last_range_end.max(0) as u64
    }
}

/// Provides access to upload sessions scoped to one repository (component D's session
/// half; [`FsBlobWriter`] is the streaming-write half).
#[derive(Clone)]
pub struct FsUploadSessionStore {
    objects: Arc<dyn ObjectStore>,
    paths: PathMapper,
    repository: String,
}

impl FsUploadSessionStore {
    pub fn new(objects: Arc<dyn ObjectStore>, repository: String) -> Self {
        Self {
            objects,
            paths: PathMapper::new(),
            repository,
        }
    }

    fn key(&self, spec: &PathSpec<'_>) -> Result<Key> {
        Ok(Key::try_from(self.paths.path(spec).as_str())?)
    }

    fn session_data_key(&self, id: &str) -> Result<Key> {
        self.key(&PathSpec::UploadData {
            name: &self.repository,
            id,
        })
    }

    async fn write_state(&self, id: &str, state: &SessionState) -> Result<()> {
        let key = self.key(&PathSpec::UploadState {
            name: &self.repository,
            id,
        })?;
        let bytes = Bytes::from(serde_json::to_vec(state)?);
        let len = bytes.len() as u64;
        let body = futures::stream::once(async move { Ok(bytes) }).boxed();
        self.objects.put(&key, body, len).await?;
        Ok(())
    }

    async fn read_state(&self, id: &str) -> Result<SessionState> {
        let key = self.key(&PathSpec::UploadState {
            name: &self.repository,
            id,
        })?;
        match self.objects.stat(&key).await? {
            None => Ok(SessionState::default()),
            Some(_) => {
                let body = self.objects.get(&key).await?;
                let bytes: Vec<Bytes> = body.try_collect().await?;
                Ok(serde_json::from_slice(&bytes.concat())?)
            }
        }
    }
}

#[async_trait]
impl reg::UploadSessionStore for FsUploadSessionStore {
    type UploadSession = FsUploadSession;
    type Error = Error;

    async fn new_upload_session(&self) -> Result<FsUploadSession> {
        let uuid = Uuid::new_v4();
        let started_at = Utc::now();
        let id = uuid.to_string();

        let started_key = self.key(&PathSpec::UploadStartedAt {
            name: &self.repository,
            id: &id,
        })?;
        let rfc3339 = Bytes::from(started_at.to_rfc3339());
        let len = rfc3339.len() as u64;
        let body = futures::stream::once(async move { Ok(rfc3339) }).boxed();
        self.objects.put(&started_key, body, len).await?;

        let session_key = self.session_data_key(&id)?;
        let upload_id = self.objects.initiate_chunked_upload(&session_key).await?;
        let state = SessionState {
            upload_id: Some(upload_id),
            ..SessionState::default()
        };
        self.write_state(&id, &state).await?;

        Ok(FsUploadSession {
            uuid,
            started_at,
            state,
        })
    }

    /// `resume(ctx, id) -> BlobUploadUnknown` if `startedAt` is absent (§4.D).
    async fn get_upload_session(&self, session_uuid: &Uuid) -> Result<FsUploadSession> {
        let id = session_uuid.to_string();
        let started_key = self.key(&PathSpec::UploadStartedAt {
            name: &self.repository,
            id: &id,
        })?;
        let started_at = match self.objects.get(&started_key).await {
            Ok(body) => {
                let bytes: Vec<Bytes> = body.try_collect().await?;
                let s = String::from_utf8_lossy(&bytes.concat()).to_string();
                DateTime::parse_from_rfc3339(s.trim())
                    .map_err(|e| Error::UploadInvalid(format!("corrupt startedat: {e}")))?
                    .with_timezone(&Utc)
            }
            Err(_) => return Err(Error::UploadUnknown(*session_uuid)),
        };
        let state = self.read_state(&id).await?;

        Ok(FsUploadSession {
            uuid: *session_uuid,
            started_at,
            state,
        })
    }

    async fn delete_session(&self, session_uuid: &Uuid) -> Result<()> {
        let id = session_uuid.to_string();
        let root = self.key(&PathSpec::UploadRoot {
            name: &self.repository,
            id: &id,
        })?;
        self.objects.delete_prefix(&root).await?;
        Ok(())
    }
}

/// Resumable streaming write session (§4.D).
///
/// A freshly created writer keeps a live [`Digester`] so `commit` can read the canonical
/// digest straight out of running hash state (the fast path). A writer obtained via
/// `resume` never does -- a `DynDigest`'s internal state has no portable serialization
/// (see `depot_core::oci_digest::DigestState`'s doc comment), so resumed sessions always
/// fall back to re-reading the finalized temp object and rehashing it at commit time, per
/// §4.D's "mark resumable-digest unavailable" contract.
pub struct FsBlobWriter {
    objects: Arc<dyn ObjectStore>,
    paths: PathMapper,
    repository: String,
    session: FsUploadSession,
    digester: Option<Arc<Mutex<Digester>>>,
    global: GlobalBlobStore,
    cache: Arc<dyn DescriptorCache>,
}

impl FsBlobWriter {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        global: GlobalBlobStore,
        repository: String,
        session: FsUploadSession,
        resumable: bool,
        cache: Arc<dyn DescriptorCache>,
    ) -> Self {
        let digester = resumable.then(|| Arc::new(Mutex::new(Digester::default())));
        Self {
            objects,
            paths: PathMapper::new(),
            repository,
            session,
            digester,
            global,
            cache,
        }
    }

    fn key(&self, spec: &PathSpec<'_>) -> Result<Key> {
        Ok(Key::try_from(self.paths.path(spec).as_str())?)
    }

    fn id(&self) -> String {
        self.session.uuid.to_string()
    }

    fn session_key(&self) -> Result<Key> {
        self.key(&PathSpec::UploadData {
            name: &self.repository,
            id: &self.id(),
        })
    }

    fn finalized_key(&self) -> Result<Key> {
        Ok(self.session_key()?.join("finalized"))
    }

    async fn persist_state(&self) -> Result<()> {
        let key = self.key(&PathSpec::UploadState {
            name: &self.repository,
            id: &self.id(),
        })?;
        let bytes = Bytes::from(serde_json::to_vec(&self.session.state)?);
        let len = bytes.len() as u64;
        let body = futures::stream::once(async move { Ok(bytes) }).boxed();
        self.objects.put(&key, body, len).await?;
        Ok(())
    }

    async fn write_one_chunk(&mut self, content_length: u64, body: InputBody) -> Result<()> {
        let upload_id = self
            .session
            .state
            .upload_id
            .clone()
            .ok_or_else(|| Error::UploadInvalid("upload session has no upload id".to_string()))?;
        let session_key = self.session_key()?;

        let body: InputBody = match &self.digester {
            Some(digester) => Box::into_pin(DigestBody::from_body(body, digester.clone())),
            None => body,
        };

        let chunk_number = self.session.state.chunks.len() as i32;
        let chunk = self
            .objects
            .upload_chunk(&upload_id, &session_key, chunk_number, content_length, body)
            .await?;

        self.session.state.chunks.push(ChunkRecord {
            e_tag: chunk.e_tag,
            chunk_number: chunk.chunk_number,
        });
        self.session.state.last_range_end += content_length as i64;
        self.persist_state().await?;
        Ok(())
    }
}

#[async_trait]
impl reg::BlobWriter for FsBlobWriter {
    type Error = Error;
    type UploadSession = FsUploadSession;

    async fn write(&mut self, content_length: u64, body: InputBody) -> Result<()> {
        self.write_one_chunk(content_length, body).await
    }

    async fn write_chunked(&mut self, body: InputBody) -> Result<()> {
        let mut chunked = ChunkedBody::from_body(body);
        while let Some(chunk) = chunked.next().await {
            let bytes = chunk.map_err(|e| Error::UploadInvalid(e.to_string()))?;
            let len = bytes.len() as u64;
            let body: InputBody = Box::pin(futures::stream::once(async move { Ok(bytes) }));
            self.write_one_chunk(len, body).await?;
        }
        Ok(())
    }

    /// The commit algorithm from §4.D: finalize the chunked upload into a temp full object,
    /// compute (or recompute) the canonical digest, verify it, promote into the blob pool
    /// (skipping the move entirely if another uploader already landed the same content --
    /// I6), create this repository's layer link, and release every upload-scoped resource.
    async fn commit(self, provided: Option<&Descriptor>) -> Result<Descriptor> {
        let session_key = self.session_key()?;
        let finalized_key = self.finalized_key()?;
        let upload_id = self.session.state.upload_id.clone();

        if let Some(upload_id) = &upload_id {
            if self.session.state.chunks.is_empty() {
                self.objects.abort_chunked_upload(upload_id, &session_key).await?;
            } else {
                let chunks: Vec<Chunk> = self
                    .session
                    .state
                    .chunks
                    .iter()
                    .map(|c| Chunk {
                        e_tag: c.e_tag.clone(),
                        chunk_number: c.chunk_number,
                    })
                    .collect();
                self.objects
                    .finalize_chunked_upload(upload_id, &session_key, chunks, &finalized_key)
                    .await?;
            }
        }

        let data_exists = self.objects.exists(&finalized_key).await?;
        let size = match self.objects.stat(&finalized_key).await? {
            Some(stat) => stat.size,
            None => 0,
        };

        if let Some(provided) = provided {
            let provided_size = provided.size() as u64;
            if provided_size > 0 && provided_size != size {
                return Err(Error::SizeInvalid {
                    provided: provided_size,
                    actual: size,
                });
            }
        }

        let empty_digest: OciDigest = EMPTY_BLOB_SHA256.try_into().map_err(Error::Core)?;

        let canonical: OciDigest = if !data_exists {
            empty_digest
        } else if let Some(digester) = self.digester {
            let digester = Arc::try_unwrap(digester)
                .map_err(|_| Error::UploadInvalid("digester still shared at commit".to_string()))?
                .into_inner()
                .map_err(|_| Error::UploadInvalid("digester mutex poisoned".to_string()))?;
            let hex = digester.finalize_hex("sha256").map_err(Error::Core)?;
            format!("sha256:{hex}").as_str().try_into().map_err(Error::Core)?
        } else {
            let body = self.objects.get(&finalized_key).await?;
            let bytes: Vec<Bytes> = body.try_collect().await?;
            let full: Bytes = bytes.concat().into();
            full.as_ref().try_into().map_err(Error::Core)?
        };

        if let Some(provided) = provided {
            let provided_digest: OciDigest = provided.digest().as_str().try_into().map_err(Error::Core)?;
            if provided_digest != canonical {
                return Err(Error::DigestInvalid {
                    expected: provided_digest.to_string(),
                    actual: canonical.to_string(),
                });
            }
        }

        if !data_exists {
            self.global.put_empty(&canonical).await?;
        } else if self.global.exists(&canonical).await? {
            self.objects.delete(&finalized_key).await?;
        } else {
            self.global.promote(&finalized_key, &canonical).await?;
        }

        let link_key = LinkNamespace::Layers.link_key(&self.paths, &self.repository, &canonical)?;
        self.global.link(&link_key, &canonical).await?;

        let upload_root = self.key(&PathSpec::UploadRoot {
            name: &self.repository,
            id: &self.id(),
        })?;
        self.objects.delete_prefix(&upload_root).await?;

        let descriptor = Descriptor::new(MediaType::OctetStream, size as i64, canonical.to_string());
        self.cache.put(canonical, descriptor.clone()).await;

        Ok(descriptor)
    }

    async fn cancel(self) -> Result<()> {
        if let Some(upload_id) = &self.session.state.upload_id {
            let session_key = self.session_key()?;
            let _ = self.objects.abort_chunked_upload(upload_id, &session_key).await;
        }
        let upload_root = self.key(&PathSpec::UploadRoot {
            name: &self.repository,
            id: &self.id(),
        })?;
        self.objects.delete_prefix(&upload_root).await?;
        Ok(())
    }

    fn session(&self) -> &FsUploadSession {
        &self.session
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use depot_core::{MemoryCache, NoopCache};
    use depot_objectstore::memory::InMemory;
    use futures::stream;

    fn body_of(s: &'static str) -> InputBody {
        Box::pin(stream::iter(vec![Ok(Bytes::from(s))]))
    }

    async fn new_writer(
        objects: Arc<dyn ObjectStore>,
        cache: Arc<dyn DescriptorCache>,
    ) -> (FsUploadSessionStore, FsBlobWriter) {
        use depot_core::registry::UploadSessionStore;

        let sessions = FsUploadSessionStore::new(objects.clone(), "library/alpine".to_string());
        let session = sessions.new_upload_session().await.unwrap();
        let global = GlobalBlobStore::new(objects.clone());
        let writer = FsBlobWriter::new(
            objects,
            global,
            "library/alpine".to_string(),
            session,
            true,
            cache,
        );
        (sessions, writer)
    }

    #[tokio::test]
    async fn create_write_commit_roundtrips() {
        use depot_core::registry::BlobWriter;

        let objects: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let cache = Arc::new(MemoryCache::new());
        let (_sessions, mut writer) = new_writer(objects.clone(), cache).await;

        writer.write(5, body_of("hello")).await.unwrap();
        let descriptor = writer.commit(None).await.unwrap();
        assert_eq!(descriptor.size(), 5);

        let digest: OciDigest = descriptor.digest().as_str().try_into().unwrap();
        let global = GlobalBlobStore::new(objects);
        assert!(global.exists(&digest).await.unwrap());
        assert_eq!(global.get_bytes(&digest).await.unwrap(), Bytes::from("hello"));
    }

    #[tokio::test]
    async fn commit_rejects_mismatched_digest() {
        use depot_core::registry::BlobWriter;

        let objects: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let (_sessions, mut writer) = new_writer(objects, Arc::new(NoopCache)).await;
        writer.write(5, body_of("hello")).await.unwrap();

        let wrong = Descriptor::new(
            MediaType::OctetStream,
            5,
            "sha256:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa",
        );
        let err = writer.commit(Some(&wrong)).await.unwrap_err();
        assert!(matches!(err, Error::DigestInvalid { .. }));
    }

    #[tokio::test]
    async fn commit_rejects_mismatched_size() {
        use depot_core::registry::BlobWriter;

        let objects: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let (_sessions, mut writer) = new_writer(objects, Arc::new(NoopCache)).await;
        writer.write(5, body_of("hello")).await.unwrap();

        let digest: OciDigest = "hello".as_bytes().try_into().unwrap();
        let wrong_size = Descriptor::new(MediaType::OctetStream, 999, digest.to_string());
        let err = writer.commit(Some(&wrong_size)).await.unwrap_err();
        assert!(matches!(err, Error::SizeInvalid { .. }));
    }

    #[tokio::test]
    async fn cancel_removes_upload_directory() {
        use depot_core::registry::{BlobWriter, UploadSessionStore};

        let objects: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let (sessions, mut writer) = new_writer(objects, Arc::new(NoopCache)).await;
        let uuid = *writer.session().uuid();
        writer.write(4, body_of("data")).await.unwrap();
        writer.cancel().await.unwrap();

        let err = sessions.get_upload_session(&uuid).await.unwrap_err();
        assert!(matches!(err, Error::UploadUnknown(_)));
    }

    #[tokio::test]
    async fn empty_commit_targets_empty_digest() {
        use depot_core::registry::BlobWriter;

        let objects: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let (_sessions, writer) = new_writer(objects, Arc::new(NoopCache)).await;
        let descriptor = writer.commit(None).await.unwrap();
        assert_eq!(descriptor.digest(), EMPTY_BLOB_SHA256);
    }
}
