//! Maps typed path descriptors onto backend object keys.
//!
//! The path layout is the externally visible on-disk/on-bucket contract (see the backend
//! layout diagram below) and is deliberately kept bit-exact across backend implementations.
//! Everything above this module addresses content by [`PathSpec`] value, never by
//! hand-built strings, so the layout only has one place it can change.
//!
//! ```text
//! <root>/v2/
//!   blobs/<algo>/<hex[0:2]>/<hex>/data
//!   repositories/<name>/
//!     _layers/<algo>/<hex>/link
//!     _manifests/
//!       revisions/<algo>/<hex>/link
//!       tags/<tag>/
//!         current/link
//!         index/<algo>/<hex>/link
//!     _uploads/<id>/
//!       data
//!       startedat
//!       hashstates/<algo>/<offset>
//! ```
use crate::oci_digest::OciDigest;

/// A typed handle to a location in the backend layout. [`PathMapper::path`] is the sole
/// function that turns one of these into an actual object key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PathSpec<'a> {
    RepositoriesRoot,
    RepositoryRoot {
        name: &'a str,
    },
    /// Small JSON bookkeeping file (creation timestamp) with no counterpart in the
    /// distribution backend layout -- written when a repository is created so the
    /// repository enumerator and `RepositoryStoreManager::get` can recognize an otherwise
    /// empty repository (no blobs, tags, or manifests yet) as existing.
    RepositoryMarker {
        name: &'a str,
    },

    LayersRoot {
        name: &'a str,
    },
    LayerLink {
        name: &'a str,
        digest: &'a OciDigest,
    },

    ManifestRevisionsRoot {
        name: &'a str,
    },
    ManifestRevisionLink {
        name: &'a str,
        digest: &'a OciDigest,
    },

    ManifestTagsRoot {
        name: &'a str,
    },
    ManifestTag {
        name: &'a str,
        tag: &'a str,
    },
    ManifestTagCurrentLink {
        name: &'a str,
        tag: &'a str,
    },
    ManifestTagIndexRoot {
        name: &'a str,
        tag: &'a str,
    },
    ManifestTagIndexEntryLink {
        name: &'a str,
        tag: &'a str,
        digest: &'a OciDigest,
    },

    BlobsRoot,
    BlobDir {
        digest: &'a OciDigest,
    },
    BlobData {
        digest: &'a OciDigest,
    },

    UploadsRoot {
        name: &'a str,
    },
    UploadRoot {
        name: &'a str,
        id: &'a str,
    },
    UploadData {
        name: &'a str,
        id: &'a str,
    },
    UploadStartedAt {
        name: &'a str,
        id: &'a str,
    },
    UploadHashStatesRoot {
        name: &'a str,
        id: &'a str,
    },
    UploadHashState {
        name: &'a str,
        id: &'a str,
        algorithm: &'a str,
        offset: u64,
    },
    /// Small JSON blob of upload-session bookkeeping that has no counterpart in the
    /// distribution backend layout (chunk number, object-store multipart upload id) --
    /// needed because this implementation drives uploads through the object store's
    /// multipart-upload primitives rather than a single append-only file handle.
    UploadState {
        name: &'a str,
        id: &'a str,
    },
}

/// Pure, stateless translation from [`PathSpec`] to a `/`-joined object key rooted at `v2/`.
///
/// Object store drivers take whatever root prefix they need (a filesystem base directory,
/// an S3 bucket + key prefix) and append the key this returns; `PathMapper` itself knows
/// nothing about any particular backend.
#[derive(Clone, Debug, Default)]
pub struct PathMapper;

impl PathMapper {
    pub fn new() -> Self {
        Self
    }

    pub fn path(&self, spec: &PathSpec<'_>) -> String {
        match spec {
            PathSpec::RepositoriesRoot => "v2/repositories".to_string(),
            PathSpec::RepositoryRoot { name } => format!("v2/repositories/{name}"),
            PathSpec::RepositoryMarker { name } => {
                format!("{}/_manifests/repository", self.repository(name))
            }

            PathSpec::LayersRoot { name } => format!("{}/_layers", self.repository(name)),
            PathSpec::LayerLink { name, digest } => {
                format!("{}/{}/link", self.layers_root(name), self.digest_dir(digest))
            }

            PathSpec::ManifestRevisionsRoot { name } => {
                format!("{}/_manifests/revisions", self.repository(name))
            }
            PathSpec::ManifestRevisionLink { name, digest } => format!(
                "{}/{}/link",
                self.manifest_revisions_root(name),
                self.digest_dir(digest)
            ),

            PathSpec::ManifestTagsRoot { name } => {
                format!("{}/_manifests/tags", self.repository(name))
            }
            PathSpec::ManifestTag { name, tag } => {
                format!("{}/{tag}", self.manifest_tags_root(name))
            }
            PathSpec::ManifestTagCurrentLink { name, tag } => {
                format!("{}/current/link", self.manifest_tag(name, tag))
            }
            PathSpec::ManifestTagIndexRoot { name, tag } => {
                format!("{}/index", self.manifest_tag(name, tag))
            }
            PathSpec::ManifestTagIndexEntryLink { name, tag, digest } => format!(
                "{}/{}/link",
                self.manifest_tag_index_root(name, tag),
                self.digest_dir(digest)
            ),

            PathSpec::BlobsRoot => "v2/blobs".to_string(),
            PathSpec::BlobDir { digest } => format!("{}/{}", self.blobs_root(), self.digest_dir(digest)),
            PathSpec::BlobData { digest } => format!("{}/data", self.blob_dir(digest)),

            PathSpec::UploadsRoot { name } => format!("{}/_uploads", self.repository(name)),
            PathSpec::UploadRoot { name, id } => format!("{}/{id}", self.uploads_root(name)),
            PathSpec::UploadData { name, id } => format!("{}/data", self.upload_root(name, id)),
            PathSpec::UploadStartedAt { name, id } => {
                format!("{}/startedat", self.upload_root(name, id))
            }
            PathSpec::UploadHashStatesRoot { name, id } => {
                format!("{}/hashstates", self.upload_root(name, id))
            }
            PathSpec::UploadHashState {
                name,
                id,
                algorithm,
                offset,
            } => format!(
                "{}/{algorithm}/{offset}",
                self.upload_hash_states_root(name, id)
            ),
            PathSpec::UploadState { name, id } => {
                format!("{}/state", self.upload_root(name, id))
            }
        }
    }

    fn repository(&self, name: &str) -> String {
        self.path(&PathSpec::RepositoryRoot { name })
    }

    fn layers_root(&self, name: &str) -> String {
        self.path(&PathSpec::LayersRoot { name })
    }

    fn manifest_revisions_root(&self, name: &str) -> String {
        self.path(&PathSpec::ManifestRevisionsRoot { name })
    }

    fn manifest_tags_root(&self, name: &str) -> String {
        self.path(&PathSpec::ManifestTagsRoot { name })
    }

    fn manifest_tag(&self, name: &str, tag: &str) -> String {
        self.path(&PathSpec::ManifestTag { name, tag })
    }

    fn manifest_tag_index_root(&self, name: &str, tag: &str) -> String {
        self.path(&PathSpec::ManifestTagIndexRoot { name, tag })
    }

    fn blobs_root(&self) -> String {
        self.path(&PathSpec::BlobsRoot)
    }

    fn blob_dir(&self, digest: &OciDigest) -> String {
        self.path(&PathSpec::BlobDir { digest })
    }

    fn uploads_root(&self, name: &str) -> String {
        self.path(&PathSpec::UploadsRoot { name })
    }

    fn upload_root(&self, name: &str, id: &str) -> String {
        self.path(&PathSpec::UploadRoot { name, id })
    }

    fn upload_hash_states_root(&self, name: &str, id: &str) -> String {
        self.path(&PathSpec::UploadHashStatesRoot { name, id })
    }

    fn digest_dir(&self, digest: &OciDigest) -> String {
        format!(
            "{}/{}/{}",
            digest.algorithm_str(),
            digest.prefix(),
            digest.encoded()
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn digest() -> OciDigest {
        "sha256:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"
            .try_into()
            .unwrap()
    }

    #[test]
    fn blob_data_path() {
        let m = PathMapper::new();
        let d = digest();
        assert_eq!(
            m.path(&PathSpec::BlobData { digest: &d }),
            "v2/blobs/sha256/aa/aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa/data"
        );
    }

    #[test]
    fn manifest_tag_current_link_path() {
        let m = PathMapper::new();
        assert_eq!(
            m.path(&PathSpec::ManifestTagCurrentLink {
                name: "library/alpine",
                tag: "latest",
            }),
            "v2/repositories/library/alpine/_manifests/tags/latest/current/link"
        );
    }

    #[test]
    fn upload_hash_state_path() {
        let m = PathMapper::new();
        assert_eq!(
            m.path(&PathSpec::UploadHashState {
                name: "library/alpine",
                id: "11111111-1111-1111-1111-111111111111",
                algorithm: "sha256",
                offset: 4096,
            }),
            "v2/repositories/library/alpine/_uploads/11111111-1111-1111-1111-111111111111/hashstates/sha256/4096"
        );
    }
}
