//! Provides a simple abstraction over object storage services.
//!
//! Primarily intended for use by [`depot_backend_fs`](../depot_backend_fs/index.html), which
//! implements the `depot-core` registry traits entirely in terms of the operations defined
//! here plus link-file conventions -- there is no metadata database underneath any of this.
use std::io;
use std::path::Component;
use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use once_cell::sync::Lazy;
use regex::Regex;

pub mod config;
pub mod errors;
pub mod fs;
pub mod memory;
pub(crate) mod s3;

#[doc(hidden)]
pub use config::Config;
#[doc(hidden)]
pub use errors::{Error, KeyError, Result};

/// Used to communicate multi-part upload information between [`ObjectStore`] users and
/// backends that implement uploads as a distinct multipart-upload session (eg S3).
#[derive(Clone, Debug)]
pub struct Chunk {
    pub e_tag: Option<String>,
    pub chunk_number: i32,
}

/// Wrapper around [`std::path::PathBuf`] that rejects unsafe key names.
///
/// The following rules are applied during the [`TryFrom<PathBuf>`] implementation:
///
/// * paths must not start with `/`
/// * paths are delimited by `/`
/// * paths are normalized (`//` are replaced with `/` and never end in `/`)
/// * paths must not contain relative segments (ie `.` or `..`)
/// * only characters explicitly documented as safe [in the S3
///   docs](https://docs.aws.amazon.com/AmazonS3/latest/userguide/object-keys.html) are allowed
///   in path segments
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Key {
    key: PathBuf,
}

impl Key {
    /// Skips validation. For callers who have already validated the key (eg depot-core's
    /// `PathMapper` output, which only ever emits ASCII digest hex and registry-name
    /// characters).
    pub fn from_pathbuf(key: PathBuf) -> Result<Key> {
        Ok(Key { key })
    }

    pub fn as_path(&self) -> &std::path::Path {
        &self.key
    }

    /// True if `other` names a path strictly nested under this key.
    pub fn is_prefix_of(&self, other: &Key) -> bool {
        other.key.starts_with(&self.key) && other.key != self.key
    }

    pub fn join(&self, component: &str) -> Key {
        Key {
            key: self.key.join(component),
        }
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Key {
        Key {
            key: PathBuf::from(s),
        }
    }
}

impl From<String> for Key {
    fn from(s: String) -> Key {
        Key {
            key: PathBuf::from(s),
        }
    }
}

impl From<&uuid::Uuid> for Key {
    fn from(uuid: &uuid::Uuid) -> Key {
        Key {
            key: PathBuf::from(uuid.to_string()),
        }
    }
}

impl From<&Key> for String {
    fn from(k: &Key) -> String {
        format!("{}", k.key.display())
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.key.display())
    }
}

impl TryFrom<PathBuf> for Key {
    type Error = Error;

    fn try_from(pb: PathBuf) -> Result<Key> {
        let key = pb
            .components()
            .try_fold(PathBuf::new(), validate_component)?;
        Ok(Key { key })
    }
}

impl TryFrom<&str> for Key {
    type Error = Error;

    fn try_from(s: &str) -> Result<Key> {
        Key::try_from(PathBuf::from(s))
    }
}

fn validate_component(mut pb: PathBuf, c: Component<'_>) -> std::result::Result<PathBuf, KeyError> {
    static RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-zA-Z0-9_\-!.*'()]+$").unwrap());
    match c {
        Component::Prefix(_) => return Err(KeyError::PrefixNotAllowed),
        Component::RootDir => return Err(KeyError::RootDirNotAllowed),
        Component::CurDir => return Err(KeyError::CurDirNotAllowed),
        Component::ParentDir => return Err(KeyError::ParentDirNotAllowed),
        Component::Normal(s) => {
            if let Some(s) = s.to_str() {
                if !RE.is_match(s) {
                    return Err(KeyError::PathComponentsMustMatchRegex(
                        RE.as_str().to_string(),
                    ));
                }
            } else {
                return Err(KeyError::PathComponentsMustBeValidUnicode);
            }
        }
    }
    pb.push(c);
    Ok(pb)
}

#[doc(hidden)]
pub type ObjectBody = BoxStream<'static, Result<Bytes>>;

/// Input stream for [`ObjectStore::put`]. Carries `io::Result` rather than this crate's own
/// `Error` because the producer (typically depot-core's digest-verifying stream wrapper)
/// lives above this crate and has no reason to depend on it.
pub type PutBody = BoxStream<'static, io::Result<Bytes>>;

/// Metadata returned by [`ObjectStore::stat`].
#[derive(Clone, Debug)]
pub struct Stat {
    pub size: u64,
}

/// Provides a common interface for interacting with different kinds of backend object
/// stores. Every path-shaped argument is a [`Key`] built from a `depot_core::PathSpec`, so
/// the trait itself carries no opinions about layout.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Get the contents of the referenced [`Key`].
    async fn get(&self, key: &Key) -> Result<ObjectBody>;

    /// Return true if the referenced [`Key`] exists.
    async fn exists(&self, key: &Key) -> Result<bool>;

    /// Return size metadata for `key`, or `None` if it does not exist.
    async fn stat(&self, key: &Key) -> Result<Option<Stat>>;

    /// Upload the given contents as [`Key`], in one shot.
    async fn put(&self, key: &Key, body: PutBody, content_length: u64) -> Result<()>;

    /// Delete the [`Key`] from the backend. Not an error if it does not exist.
    async fn delete(&self, key: &Key) -> Result<()>;

    /// Recursively delete every object whose key is nested under `prefix`, including
    /// `prefix` itself if it names an object. Used to tear down an upload session directory
    /// or an entire repository.
    async fn delete_prefix(&self, prefix: &Key) -> Result<()>;

    /// Move `src` to `dst`, atomically where the backend supports it (a filesystem rename)
    /// and via copy-then-delete otherwise (S3). This is the commit-time linearization point
    /// for promoting a completed upload into the content-addressed blob pool.
    async fn r#move(&self, src: &Key, dst: &Key) -> Result<()>;

    /// List the immediate child key-components nested directly under `prefix` (not
    /// recursive). Used for things like enumerating the tags within a repository.
    async fn list(&self, prefix: &Key) -> Result<Vec<String>>;

    /// Recursively enumerate every object key nested under `prefix`, depth-first, invoking
    /// `f` for each. Used by the garbage collector to walk the global blob pool and by the
    /// repository enumerator to walk the repositories root.
    async fn walk(
        &self,
        prefix: &Key,
        f: &mut (dyn FnMut(Key) -> std::result::Result<(), Error> + Send),
    ) -> Result<()>;

    /// Initiate a chunked upload session and return an upload id.
    async fn initiate_chunked_upload(&self, session_key: &Key) -> Result<String>;

    /// Upload a chunk for the given upload id and session key.
    async fn upload_chunk(
        &self,
        upload_id: &str,
        session_key: &Key,
        chunk_number: i32,
        content_length: u64,
        body: PutBody,
    ) -> Result<Chunk>;

    /// Finalize the chunked upload and make the concatenated contents available under the
    /// given [`Key`].
    async fn finalize_chunked_upload(
        &self,
        upload_id: &str,
        session_key: &Key,
        chunks: Vec<Chunk>,
        key: &Key,
    ) -> Result<()>;

    /// Abort the chunked upload without finalizing it.
    async fn abort_chunked_upload(&self, upload_id: &str, session_key: &Key) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    // validate object safety
    #[allow(dead_code)]
    struct Whatever {
        objectstore: Box<dyn ObjectStore>,
    }

    #[test]
    fn key_rejects_parent_dir() {
        let e = Key::try_from(PathBuf::from("../escape")).unwrap_err();
        assert!(matches!(e, Error::KeyError(KeyError::ParentDirNotAllowed)));
    }

    #[test]
    fn key_accepts_digest_shaped_path() {
        Key::try_from(PathBuf::from(
            "sha256/ab/abababababababababababababababababababababababababababababab/data",
        ))
        .unwrap();
    }

    #[test]
    fn is_prefix_of() {
        let root = Key::from("v2/repositories/foo");
        let child = Key::from("v2/repositories/foo/_manifests");
        assert!(root.is_prefix_of(&child));
        assert!(!child.is_prefix_of(&root));
        assert!(!root.is_prefix_of(&root));
    }
}
