//! In-memory [`ObjectStore`] double, used by the backend and garbage-collector test suites
//! so behavior can be exercised without touching a real filesystem or S3 bucket.
use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::{self, StreamExt, TryStreamExt};

use super::errors::Result;
use super::{Chunk, Key, ObjectBody, ObjectStore, PutBody, Stat};

#[derive(Default)]
pub struct InMemory {
    objects: Mutex<BTreeMap<String, Bytes>>,
    parts: Mutex<BTreeMap<String, Vec<(i32, Bytes)>>>,
}

impl InMemory {
    pub fn new() -> Self {
        Self::default()
    }

    fn key_string(key: &Key) -> String {
        key.to_string()
    }
}

async fn drain(mut body: PutBody) -> std::io::Result<Bytes> {
    let mut buf = BytesMut::new();
    while let Some(chunk) = body.next().await {
        buf.extend_from_slice(&chunk?);
    }
    Ok(buf.freeze())
}

#[async_trait]
impl ObjectStore for InMemory {
    async fn get(&self, key: &Key) -> Result<ObjectBody> {
        let k = Self::key_string(key);
        let objects = self.objects.lock().expect("lock poisoned");
        let bytes = objects
            .get(&k)
            .cloned()
            .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::NotFound))?;
        Ok(stream::once(async move { Ok(bytes) })
            .map_err(super::errors::Error::from)
            .boxed())
    }

    async fn exists(&self, key: &Key) -> Result<bool> {
        let k = Self::key_string(key);
        Ok(self.objects.lock().expect("lock poisoned").contains_key(&k))
    }

    async fn stat(&self, key: &Key) -> Result<Option<Stat>> {
        let k = Self::key_string(key);
        Ok(self
            .objects
            .lock()
            .expect("lock poisoned")
            .get(&k)
            .map(|b| Stat { size: b.len() as u64 }))
    }

    async fn put(&self, key: &Key, body: PutBody, _content_length: u64) -> Result<()> {
        let bytes = drain(body).await?;
        self.objects
            .lock()
            .expect("lock poisoned")
            .insert(Self::key_string(key), bytes);
        Ok(())
    }

    async fn delete(&self, key: &Key) -> Result<()> {
        self.objects
            .lock()
            .expect("lock poisoned")
            .remove(&Self::key_string(key));
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &Key) -> Result<()> {
        let p = Self::key_string(prefix);
        let mut objects = self.objects.lock().expect("lock poisoned");
        objects.retain(|k, _| !(k == &p || k.starts_with(&format!("{p}/"))));
        Ok(())
    }

    async fn r#move(&self, src: &Key, dst: &Key) -> Result<()> {
        let mut objects = self.objects.lock().expect("lock poisoned");
        let bytes = objects
            .remove(&Self::key_string(src))
            .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::NotFound))?;
        objects.insert(Self::key_string(dst), bytes);
        Ok(())
    }

    async fn list(&self, prefix: &Key) -> Result<Vec<String>> {
        let p = Self::key_string(prefix);
        let objects = self.objects.lock().expect("lock poisoned");
        let mut children: Vec<String> = objects
            .keys()
            .filter_map(|k| {
                let rest = k.strip_prefix(&format!("{p}/"))?;
                Some(rest.split('/').next().unwrap_or(rest).to_string())
            })
            .collect();
        children.sort();
        children.dedup();
        Ok(children)
    }

    async fn walk(
        &self,
        prefix: &Key,
        f: &mut (dyn FnMut(Key) -> std::result::Result<(), super::errors::Error> + Send),
    ) -> Result<()> {
        let p = Self::key_string(prefix);
        let matching: Vec<String> = {
            let objects = self.objects.lock().expect("lock poisoned");
            objects
                .keys()
                .filter(|k| *k == &p || k.starts_with(&format!("{p}/")))
                .cloned()
                .collect()
        };
        for k in matching {
            f(Key::from(k))?;
        }
        Ok(())
    }

    async fn initiate_chunked_upload(&self, session_key: &Key) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        self.parts
            .lock()
            .expect("lock poisoned")
            .insert(format!("{id}:{session_key}"), Vec::new());
        Ok(id)
    }

    async fn upload_chunk(
        &self,
        upload_id: &str,
        session_key: &Key,
        chunk_number: i32,
        _content_length: u64,
        body: PutBody,
    ) -> Result<Chunk> {
        let bytes = drain(body).await?;
        self.parts
            .lock()
            .expect("lock poisoned")
            .entry(format!("{upload_id}:{session_key}"))
            .or_default()
            .push((chunk_number, bytes));
        Ok(Chunk {
            e_tag: None,
            chunk_number,
        })
    }

    async fn finalize_chunked_upload(
        &self,
        upload_id: &str,
        session_key: &Key,
        mut chunks: Vec<Chunk>,
        key: &Key,
    ) -> Result<()> {
        chunks.sort_by_key(|c| c.chunk_number);
        let stored = self
            .parts
            .lock()
            .expect("lock poisoned")
            .remove(&format!("{upload_id}:{session_key}"))
            .unwrap_or_default();
        let mut by_number: BTreeMap<i32, Bytes> = stored.into_iter().collect();
        let mut out = BytesMut::new();
        for chunk in chunks {
            if let Some(bytes) = by_number.remove(&chunk.chunk_number) {
                out.extend_from_slice(&bytes);
            }
        }
        self.objects
            .lock()
            .expect("lock poisoned")
            .insert(Self::key_string(key), out.freeze());
        Ok(())
    }

    async fn abort_chunked_upload(&self, upload_id: &str, session_key: &Key) -> Result<()> {
        self.parts
            .lock()
            .expect("lock poisoned")
            .remove(&format!("{upload_id}:{session_key}"));
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn body_of(s: &'static str) -> PutBody {
        stream::iter(vec![Ok(Bytes::from(s))]).boxed()
    }

    #[tokio::test]
    async fn put_get_delete_roundtrip() {
        let store = InMemory::new();
        let key = Key::from("sha256/ab/abc/data");
        store.put(&key, body_of("hi"), 2).await.unwrap();
        assert!(store.exists(&key).await.unwrap());
        store.delete(&key).await.unwrap();
        assert!(!store.exists(&key).await.unwrap());
    }

    #[tokio::test]
    async fn move_transfers_ownership() {
        let store = InMemory::new();
        let src = Key::from("_uploads/1/data");
        let dst = Key::from("sha256/ab/abc/data");
        store.put(&src, body_of("payload"), 7).await.unwrap();
        store.r#move(&src, &dst).await.unwrap();
        assert!(!store.exists(&src).await.unwrap());
        assert!(store.exists(&dst).await.unwrap());
    }
}
