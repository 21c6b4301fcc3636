//! Mark-and-sweep garbage collection over a `depot-backend-fs` repository tree: walks every
//! repository's tag map and manifest reference graph to find which blobs are still reachable,
//! then deletes everything else along with stale layer links and (optionally) untagged
//! manifest revisions.
pub mod checkpoint;
pub mod collector;
pub mod errors;
pub mod lock;
pub mod mark;
pub mod options;
pub mod progress;
pub mod sweep;

pub use checkpoint::Checkpoint;
pub use collector::{GarbageCollector, GcReport};
pub use errors::{Error, Result};
pub use lock::GcLock;
pub use mark::{mark, MarkResult};
pub use options::GcOptions;
pub use progress::ProgressCounters;
pub use sweep::{sweep, SweepStats};
