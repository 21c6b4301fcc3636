use thiserror;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors internal to the link-file backend. Converts into `depot_core`'s behavioral error
/// kinds (`BlobError`/`ManifestError`/`RepositoryError`) at the trait boundary.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("depot-core error: {0}")]
    Core(#[from] depot_core::Error),
    #[error("object store error: {0}")]
    ObjectStore(#[from] depot_objectstore::Error),
    #[error("{0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("blob unknown to repository")]
    BlobUnknown,
    #[error("upload session unknown: {0}")]
    UploadUnknown(uuid::Uuid),
    #[error("upload invalid: {0}")]
    UploadInvalid(String),
    #[error("digest invalid: expected {expected}, got {actual}")]
    DigestInvalid { expected: String, actual: String },
    #[error("size invalid: provided {provided}, actual {actual}")]
    SizeInvalid { provided: u64, actual: u64 },
    #[error("blob still referenced")]
    BlobReferenced,
    #[error("operation unsupported by this repository configuration")]
    Unsupported,
    #[error("link target missing for {0}")]
    LinkTargetMissing(String),

    #[error("manifest unknown to repository")]
    ManifestUnknown,
    #[error("manifest references blob(s) unknown to repository: {0:?}")]
    ManifestBlobUnknown(Vec<String>),
    #[error("manifest invalid: {0}")]
    ManifestInvalid(String),
    #[error("manifest config media type forbidden by policy: {0}")]
    ManifestConfigMediaTypeForbidden(String),
    #[error("manifest layer media type forbidden by policy: {0}")]
    ManifestLayerMediaTypeForbidden(String),
    #[error("manifest failed {} verification check(s)", .0.len())]
    ManifestVerification(Vec<Error>),

    #[error("repository name invalid: {0}")]
    RepositoryNameInvalid(String),
    #[error("repository unknown: {0}")]
    RepositoryUnknown(String),

    #[error(transparent)]
    BlobError(#[from] depot_core::BlobError),
    #[error(transparent)]
    ManifestError(#[from] depot_core::ManifestError),
    #[error(transparent)]
    RepositoryError(#[from] depot_core::RepositoryError),
}

impl From<Error> for depot_core::Error {
    fn from(e: Error) -> Self {
        depot_core::Error::BackendError(format!("{e}"))
    }
}

impl From<Error> for depot_core::BlobError {
    fn from(e: Error) -> Self {
        match e {
            Error::BlobError(e) => e,
            Error::BlobUnknown => depot_core::BlobError::BlobUnknown,
            Error::UploadUnknown(u) => depot_core::BlobError::BlobUploadUnknown(u),
            Error::UploadInvalid(s) => depot_core::BlobError::BlobUploadInvalid(s),
            Error::DigestInvalid { expected, actual } => {
                depot_core::BlobError::DigestInvalid { expected, actual }
            }
            Error::SizeInvalid { provided, actual } => {
                depot_core::BlobError::SizeInvalid { provided, actual }
            }
            Error::BlobReferenced => depot_core::BlobError::BlobReferenced,
            Error::Unsupported => depot_core::BlobError::Unsupported,
            e => depot_core::BlobError::GenericSpecError(e.into()),
        }
    }
}

impl From<Error> for depot_core::ManifestError {
    fn from(e: Error) -> Self {
        match e {
            Error::ManifestError(e) => e,
            Error::ManifestUnknown => depot_core::ManifestError::ManifestUnknown,
            Error::ManifestBlobUnknown(v) => depot_core::ManifestError::ManifestBlobUnknown(v),
            Error::ManifestInvalid(s) => depot_core::ManifestError::ManifestInvalid(s),
            Error::ManifestConfigMediaTypeForbidden(m) => {
                depot_core::ManifestError::ManifestConfigMediaTypeForbidden(m)
            }
            Error::ManifestLayerMediaTypeForbidden(m) => {
                depot_core::ManifestError::ManifestLayerMediaTypeForbidden(m)
            }
            Error::ManifestVerification(v) => depot_core::ManifestError::ManifestVerification(
                v.into_iter().map(Into::into).collect(),
            ),
            Error::Unsupported => depot_core::ManifestError::Unsupported,
            e => depot_core::ManifestError::GenericSpecError(e.into()),
        }
    }
}

impl From<Error> for depot_core::RepositoryError {
    fn from(e: Error) -> Self {
        match e {
            Error::RepositoryError(e) => e,
            Error::RepositoryNameInvalid(s) => depot_core::RepositoryError::NameInvalid(s),
            Error::RepositoryUnknown(s) => depot_core::RepositoryError::NameUnknown(s),
            e => depot_core::RepositoryError::GenericSpecError(e.into()),
        }
    }
}
