//! Error types for the scheduler.

use crate::JobId;
use thiserror::Error;

/// Errors reported by the scheduler and its handles.
#[derive(Debug, Error)]
pub enum Error {
    /// The scheduler is shutting down and does not accept new jobs.
    #[error("the scheduler is shutting down")]
    ShutDown,

    /// The job was dropped without running, either by the shutdown or because one of the
    /// barriers it was waiting on was abandoned.
    #[error("job {0:?} was discarded before running")]
    Discarded(JobId),

    /// One of the barrier's predecessors was discarded.
    #[error("barrier {0} was abandoned")]
    Abandoned(u32),

    /// A worker thread could not be spawned.
    #[error("failed to spawn worker thread {index}")]
    Spawn {
        index: u32,
        #[source]
        source: std::io::Error,
    },
}

/// Result type for scheduler operations.
pub type Result<T> = std::result::Result<T, Error>;
