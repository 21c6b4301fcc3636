//! # depot-core
//!
//! Interoperability types shared between the registry storage facade and backend
//! implementations such as [`depot_backend_fs`](../depot_backend_fs/index.html).
//!
//! The primary set of interoperability types lives in the [`registry`] module; [`path`]
//! defines the backend-agnostic object layout every backend implementation maps onto.
pub mod cache;
pub use cache::{DescriptorCache, MemoryCache, NoopCache};

pub mod errors;
pub use errors::{BlobError, DistributionErrorCode, Error, ManifestError, RepositoryError, Result};

mod oci_digest;
pub use oci_digest::{DigestState, Digester, OciDigest};

pub mod options;
pub use options::{AllowDeny, Options, PlatformTuple, ValidateImageIndexes};

pub mod path;
pub use path::{PathMapper, PathSpec};

pub mod registry;
pub use registry::Registry;

mod stream;
pub use stream::{ChunkedBody, DigestBody, InputBody};
