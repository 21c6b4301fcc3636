use thiserror;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors internal to the garbage collector. Converts from the lower layers it drives
/// directly (the object store and the link-file backend) the same way every other crate in
/// this workspace threads errors upward with `#[from]`.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("depot-core error: {0}")]
    Core(#[from] depot_core::Error),
    #[error("backend error: {0}")]
    Backend(#[from] depot_backend_fs::Error),
    #[error("object store error: {0}")]
    ObjectStore(#[from] depot_objectstore::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("checkpoint json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("invalid gc options: {0}")]
    InvalidOptions(String),

    #[error("gc lock held by {holder} (expires {expires_at})")]
    LockContended { holder: String, expires_at: chrono::DateTime<chrono::Utc> },

    #[error("checkpoint at {0} is missing or unreadable")]
    CheckpointMissing(String),
    #[error("checkpoint at {0} is stale (older than 7 days)")]
    CheckpointStale(String),
    #[error("checkpoint at {0} was written by an incomplete mark phase")]
    MarkPhaseIncomplete(String),

    #[error("garbage collection run was cancelled")]
    Cancelled,
    #[error("garbage collection run exceeded its timeout")]
    Timeout,
}
