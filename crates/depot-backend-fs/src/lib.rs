//! Link-file based backend implementing `depot_core::registry`'s traits over any
//! `depot_objectstore::ObjectStore`.
//!
//! Every component is named after the section of the backend layout it owns (see
//! [`depot_core::path`]'s module doc comment for the full tree): [`blobstore`] is the
//! content-addressed pool every repository funnels through, [`linked`]/[`manifests`]/[`tags`]
//! are the three repository-scoped stores, [`upload`] is the resumable write session
//! controller, and [`repository`] is the namespace manager that ties them together behind
//! `depot_core::registry::RepositoryStoreManager`.
pub mod blobstore;
pub mod errors;
pub mod linked;
pub mod links;
pub mod manifests;
pub mod repository;
pub mod statter;
pub mod tags;
pub mod upload;

pub use blobstore::GlobalBlobStore;
pub use errors::{Error, Result};
pub use linked::{FsBlob, LinkedBlobStore};
pub use links::LinkNamespace;
pub use manifests::{FsManifest, FsManifestStore};
pub use repository::{validate_repository_name, FsRepositoryStore, FsRepositoryStoreManager};
pub use statter::{BackendStatter, BlobStatter, CachingStatter};
pub use tags::FsTagStore;
pub use upload::{FsBlobWriter, FsUploadSession, FsUploadSessionStore};
