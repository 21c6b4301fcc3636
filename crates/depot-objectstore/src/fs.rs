//! Local-filesystem [`ObjectStore`] driver.
//!
//! Every [`Key`] is joined onto a configured root directory; writes create parent
//! directories on demand, and the commit-time promote-to-blob-pool move is implemented as a
//! plain [`tokio::fs::rename`], which is atomic within a single filesystem.
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::Deserialize;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::BufWriter;
use tokio_util::io::{ReaderStream, StreamReader};

use super::errors::Result;
use super::{Chunk, Key, ObjectBody, ObjectStore, PutBody, Stat};

#[derive(Clone, Deserialize)]
pub struct FilesystemConfig {
    root: PathBuf,
}

impl FilesystemConfig {
    pub async fn new_objects(&self) -> Result<Filesystem> {
        fs::create_dir_all(&self.root).await?;
        Ok(Filesystem {
            root: self.root.clone(),
        })
    }
}

#[derive(Clone)]
pub struct Filesystem {
    root: PathBuf,
}

impl Filesystem {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn resolve(&self, key: &Key) -> PathBuf {
        self.root.join(key.as_path())
    }

    async fn ensure_parent(path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    /// Every multipart-upload chunk is buffered to its own file under `<root>/.parts/<upload
    /// id>/<chunk number>` and concatenated on finalize; the filesystem has no native
    /// multipart-upload concept, unlike S3.
    fn part_path(&self, upload_id: &str, chunk_number: i32) -> PathBuf {
        self.root
            .join(".parts")
            .join(upload_id)
            .join(chunk_number.to_string())
    }
}

#[async_trait]
impl ObjectStore for Filesystem {
    async fn get(&self, key: &Key) -> Result<ObjectBody> {
        let path = self.resolve(key);
        let file = File::open(path).await?;
        let stream = ReaderStream::new(file).map_err(super::errors::Error::from);
        Ok(stream.boxed())
    }

    async fn exists(&self, key: &Key) -> Result<bool> {
        Ok(fs::metadata(self.resolve(key)).await.is_ok())
    }

    async fn stat(&self, key: &Key) -> Result<Option<Stat>> {
        match fs::metadata(self.resolve(key)).await {
            Ok(meta) => Ok(Some(Stat { size: meta.len() })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, key: &Key, body: PutBody, _content_length: u64) -> Result<()> {
        let path = self.resolve(key);
        Self::ensure_parent(&path).await?;

        let body_with_io_error =
            body.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
        let mut reader = StreamReader::new(body_with_io_error);
        let file = File::create(&path).await?;
        let mut writer = BufWriter::new(file);
        tokio::io::copy(&mut reader, &mut writer).await?;
        Ok(())
    }

    async fn delete(&self, key: &Key) -> Result<()> {
        let path = self.resolve(key);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_prefix(&self, prefix: &Key) -> Result<()> {
        let path = self.resolve(prefix);
        match fs::remove_dir_all(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => match fs::remove_file(&path).await {
                Ok(()) => Ok(()),
                Err(e2) if e2.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(_) => Err(e.into()),
            },
        }
    }

    async fn r#move(&self, src: &Key, dst: &Key) -> Result<()> {
        let src_path = self.resolve(src);
        let dst_path = self.resolve(dst);
        Self::ensure_parent(&dst_path).await?;
        fs::rename(src_path, dst_path).await?;
        Ok(())
    }

    async fn list(&self, prefix: &Key) -> Result<Vec<String>> {
        let path = self.resolve(prefix);
        let mut out = Vec::new();
        let mut read_dir = match fs::read_dir(&path).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = read_dir.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                out.push(name.to_string());
            }
        }
        out.sort();
        Ok(out)
    }

    async fn walk(
        &self,
        prefix: &Key,
        f: &mut (dyn FnMut(Key) -> std::result::Result<(), super::errors::Error> + Send),
    ) -> Result<()> {
        let root = self.resolve(prefix);
        let mut stack = vec![root.clone()];
        while let Some(dir) = stack.pop() {
            let mut read_dir = match fs::read_dir(&dir).await {
                Ok(rd) => rd,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = read_dir.next_entry().await? {
                let path = entry.path();
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    stack.push(path);
                } else {
                    let relative = path
                        .strip_prefix(&self.root)
                        .unwrap_or(&path)
                        .to_path_buf();
                    let key = Key::from_pathbuf(relative)?;
                    f(key)?;
                }
            }
        }
        Ok(())
    }

    async fn initiate_chunked_upload(&self, _session_key: &Key) -> Result<String> {
        Ok(uuid::Uuid::new_v4().to_string())
    }

    async fn upload_chunk(
        &self,
        upload_id: &str,
        _session_key: &Key,
        chunk_number: i32,
        _content_length: u64,
        body: PutBody,
    ) -> Result<Chunk> {
        let path = self.part_path(upload_id, chunk_number);
        Self::ensure_parent(&path).await?;
        let body_with_io_error =
            body.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
        let mut reader = StreamReader::new(body_with_io_error);
        let file = File::create(&path).await?;
        let mut writer = BufWriter::new(file);
        tokio::io::copy(&mut reader, &mut writer).await?;
        Ok(Chunk {
            e_tag: None,
            chunk_number,
        })
    }

    async fn finalize_chunked_upload(
        &self,
        upload_id: &str,
        _session_key: &Key,
        mut chunks: Vec<Chunk>,
        key: &Key,
    ) -> Result<()> {
        chunks.sort_by_key(|c| c.chunk_number);
        let dst_path = self.resolve(key);
        Self::ensure_parent(&dst_path).await?;
        let file = File::create(&dst_path).await?;
        let mut writer = BufWriter::new(file);
        for chunk in &chunks {
            let part_path = self.part_path(upload_id, chunk.chunk_number);
            let mut part = File::open(&part_path).await?;
            tokio::io::copy(&mut part, &mut writer).await?;
        }
        use tokio::io::AsyncWriteExt;
        writer.flush().await?;

        let parts_dir = self.root.join(".parts").join(upload_id);
        let _ = fs::remove_dir_all(parts_dir).await;
        Ok(())
    }

    async fn abort_chunked_upload(&self, upload_id: &str, _session_key: &Key) -> Result<()> {
        let parts_dir = self.root.join(".parts").join(upload_id);
        match fs::remove_dir_all(parts_dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use bytes::Bytes;

    fn fixture() -> (tempfile::TempDir, Filesystem) {
        let dir = tempfile::tempdir().unwrap();
        let fs = Filesystem::new(dir.path().to_path_buf());
        (dir, fs)
    }

    fn body_of(s: &'static str) -> PutBody {
        stream::iter(vec![Ok(Bytes::from(s))]).boxed()
    }

    #[tokio::test]
    async fn put_then_get_roundtrips() {
        let (_dir, store) = fixture();
        let key = Key::try_from("sha256/ab/abc/data").unwrap();
        store.put(&key, body_of("hello"), 5).await.unwrap();
        assert!(store.exists(&key).await.unwrap());

        let stat = store.stat(&key).await.unwrap().unwrap();
        assert_eq!(stat.size, 5);
    }

    #[tokio::test]
    async fn stat_missing_returns_none() {
        let (_dir, store) = fixture();
        let key = Key::try_from("sha256/ab/missing/data").unwrap();
        assert!(store.stat(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn move_is_atomic_rename() {
        let (_dir, store) = fixture();
        let src = Key::try_from("_uploads/upload1/data").unwrap();
        let dst = Key::try_from("sha256/ab/abc/data").unwrap();
        store.put(&src, body_of("payload"), 7).await.unwrap();
        store.r#move(&src, &dst).await.unwrap();
        assert!(!store.exists(&src).await.unwrap());
        assert!(store.exists(&dst).await.unwrap());
    }

    #[tokio::test]
    async fn delete_prefix_removes_subtree() {
        let (_dir, store) = fixture();
        let a = Key::try_from("repositories/foo/_layers/sha256/ab/abc/link").unwrap();
        store.put(&a, body_of("sha256:abc"), 11).await.unwrap();
        let prefix = Key::try_from("repositories/foo").unwrap();
        store.delete_prefix(&prefix).await.unwrap();
        assert!(!store.exists(&a).await.unwrap());
    }

    #[tokio::test]
    async fn walk_visits_every_leaf() {
        let (_dir, store) = fixture();
        let a = Key::try_from("blobs/sha256/aa/aaa/data").unwrap();
        let b = Key::try_from("blobs/sha256/bb/bbb/data").unwrap();
        store.put(&a, body_of("a"), 1).await.unwrap();
        store.put(&b, body_of("b"), 1).await.unwrap();

        let mut seen = Vec::new();
        let prefix = Key::try_from("blobs").unwrap();
        store
            .walk(&prefix, &mut |k| {
                seen.push(k.to_string());
                Ok(())
            })
            .await
            .unwrap();
        seen.sort();
        assert_eq!(
            seen,
            vec![
                "blobs/sha256/aa/aaa/data".to_string(),
                "blobs/sha256/bb/bbb/data".to_string(),
            ]
        );
    }
}
