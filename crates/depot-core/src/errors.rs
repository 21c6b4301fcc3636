//! Error kinds shared across the storage core and its backends.
//!
//! Each backend crate (eg [`depot_backend_fs`]) defines its own `thiserror`-derived `Error`
//! enum covering its own failure modes (io, object store, path validation, ...) and converts
//! into the behavioral kinds defined here at the trait boundary. This mirrors the layering
//! convention: a backend's internal `Error` is never exposed directly through
//! [`crate::registry`] trait methods, only the kind the caller needs to act on.
use thiserror;

pub use oci_spec::distribution::ErrorCode as DistributionErrorCode;

pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error kind. Used for operations -- such as parsing digests or manifest
/// references -- that aren't scoped to a single backend trait.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid digest: {0}")]
    InvalidDigest(String),
    #[error("unsupported digest algorithm: {0}")]
    UnsupportedDigestAlgorithm(String),

    #[error("invalid repository name: {0}")]
    InvalidRepositoryName(String),

    #[error("backend error: {0}")]
    BackendError(String),

    #[error("distribution spec error")]
    DistributionSpecError(DistributionErrorCode),
}

/// A backend-agnostic error that any [`crate::registry::BlobStore`] /
/// [`crate::registry::BlobWriter`] implementation converts its own errors into.
#[derive(thiserror::Error, Debug)]
pub enum BlobError {
    #[error("blob unknown to registry")]
    BlobUnknown,
    #[error("upload session unknown to registry: {0}")]
    BlobUploadUnknown(uuid::Uuid),
    #[error("blob upload invalid: {0}")]
    BlobUploadInvalid(String),
    #[error("provided digest did not match computed digest: expected {expected}, got {actual}")]
    DigestInvalid { expected: String, actual: String },
    #[error("provided length {provided} did not match content length {actual}")]
    SizeInvalid { provided: u64, actual: u64 },
    #[error("blob still referenced by another repository or tag")]
    BlobReferenced,
    #[error("operation unsupported by this backend configuration")]
    Unsupported,
    #[error(transparent)]
    GenericSpecError(Error),
}

/// A backend-agnostic error that any [`crate::registry::ManifestStore`] implementation
/// converts its own errors into.
#[derive(thiserror::Error, Debug)]
pub enum ManifestError {
    #[error("manifest unknown to registry")]
    ManifestUnknown,
    #[error("manifest references blob(s) unknown to registry: {0:?}")]
    ManifestBlobUnknown(Vec<String>),
    #[error("manifest invalid: {0}")]
    ManifestInvalid(String),
    #[error("manifest config media type forbidden by policy: {0}")]
    ManifestConfigMediaTypeForbidden(String),
    #[error("manifest layer media type forbidden by policy: {0}")]
    ManifestLayerMediaTypeForbidden(String),
    #[error("manifest failed {} verification check(s)", .0.len())]
    ManifestVerification(Vec<ManifestError>),
    #[error("operation unsupported by this backend configuration")]
    Unsupported,
    #[error(transparent)]
    GenericSpecError(Error),
}

/// A backend-agnostic error that any [`crate::registry::RepositoryStore`] /
/// [`crate::registry::RepositoryStoreManager`] implementation converts its own errors into.
#[derive(thiserror::Error, Debug)]
pub enum RepositoryError {
    #[error("repository name invalid: {0}")]
    NameInvalid(String),
    #[error("repository unknown to registry: {0}")]
    NameUnknown(String),
    #[error(transparent)]
    GenericSpecError(Error),
}

impl BlobError {
    /// Best-effort mapping onto the OCI distribution error codes, for a future HTTP layer.
    /// `None` means no named code applies; callers should fall back to a bare 5xx.
    pub fn distribution_code(&self) -> Option<DistributionErrorCode> {
        match self {
            BlobError::BlobUnknown => Some(DistributionErrorCode::BlobUnknown),
            BlobError::BlobUploadUnknown(_) => Some(DistributionErrorCode::BlobUploadUnknown),
            BlobError::BlobUploadInvalid(_) => Some(DistributionErrorCode::BlobUploadInvalid),
            BlobError::DigestInvalid { .. } => Some(DistributionErrorCode::DigestInvalid),
            BlobError::SizeInvalid { .. } => Some(DistributionErrorCode::SizeInvalid),
            BlobError::BlobReferenced => Some(DistributionErrorCode::Denied),
            BlobError::Unsupported => Some(DistributionErrorCode::Unsupported),
            BlobError::GenericSpecError(_) => None,
        }
    }
}

impl ManifestError {
    pub fn distribution_code(&self) -> Option<DistributionErrorCode> {
        match self {
            ManifestError::ManifestUnknown => Some(DistributionErrorCode::ManifestUnknown),
            ManifestError::ManifestBlobUnknown(_) => {
                Some(DistributionErrorCode::ManifestBlobUnknown)
            }
            ManifestError::ManifestInvalid(_) => Some(DistributionErrorCode::ManifestInvalid),
            ManifestError::ManifestConfigMediaTypeForbidden(_) => Some(DistributionErrorCode::Denied),
            ManifestError::ManifestLayerMediaTypeForbidden(_) => Some(DistributionErrorCode::Denied),
            ManifestError::ManifestVerification(_) => Some(DistributionErrorCode::ManifestInvalid),
            ManifestError::Unsupported => Some(DistributionErrorCode::Unsupported),
            ManifestError::GenericSpecError(_) => None,
        }
    }
}

impl RepositoryError {
    pub fn distribution_code(&self) -> Option<DistributionErrorCode> {
        match self {
            RepositoryError::NameInvalid(_) => Some(DistributionErrorCode::NameInvalid),
            RepositoryError::NameUnknown(_) => Some(DistributionErrorCode::NameUnknown),
            RepositoryError::GenericSpecError(_) => None,
        }
    }
}
