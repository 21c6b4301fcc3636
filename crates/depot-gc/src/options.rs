use std::path::PathBuf;
use std::time::Duration;

use crate::errors::{Error, Result};

/// Configures one garbage collection run. Mirrors the shape of `depot_core::Options`: a
/// plain struct with a `Default` impl and fields that validate themselves rather than
/// through a builder, since every field is independently meaningful.
#[derive(Clone, Debug)]
pub struct GcOptions {
    /// Run mark and sweep but perform no deletions; still reports what would be removed.
    pub dry_run: bool,
    /// Treat manifest revisions with no current tag as unreferenced rather than protecting
    /// them solely because they were once tagged.
    pub remove_untagged: bool,
    /// Upper bound on concurrently marked repositories.
    pub max_concurrency: usize,
    /// How often progress is reported via `tracing`, in wall-clock time.
    pub progress_interval: Duration,
    /// Where the distributed lock and checkpoint files live. Required by `mark_only` and
    /// `sweep_only`; optional for a single uninterrupted run.
    pub checkpoint_dir: Option<PathBuf>,
    /// Overall wall-clock budget for the run; exceeding it aborts with an error rather than
    /// leaving a partial sweep running indefinitely.
    pub timeout: Duration,
    /// Run only the mark phase and candidate enumeration, persisting a checkpoint for a
    /// later `sweep_only` run.
    pub mark_only: bool,
    /// Resume from a checkpoint written by a prior `mark_only` run and perform only the
    /// sweep phase.
    pub sweep_only: bool,
}

impl Default for GcOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            remove_untagged: false,
            max_concurrency: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4),
            progress_interval: Duration::from_secs(10),
            checkpoint_dir: None,
            timeout: Duration::from_secs(3600),
            mark_only: false,
            sweep_only: false,
        }
    }
}

impl GcOptions {
    /// `mark_only` and `sweep_only` are mutually exclusive, and either requires
    /// `checkpoint_dir` to persist or resume from.
    pub fn validate(&self) -> Result<()> {
        if self.mark_only && self.sweep_only {
            return Err(Error::InvalidOptions(
                "mark_only and sweep_only are mutually exclusive".to_string(),
            ));
        }
        if (self.mark_only || self.sweep_only) && self.checkpoint_dir.is_none() {
            return Err(Error::InvalidOptions(
                "mark_only/sweep_only require checkpoint_dir".to_string(),
            ));
        }
        if self.max_concurrency == 0 {
            return Err(Error::InvalidOptions("max_concurrency must be at least 1".to_string()));
        }
        Ok(())
    }
}
