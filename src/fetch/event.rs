//! Event messages flowing from workers up to the coordinator and caller.
//!
//! Workers report to their supervisor over a channel; the supervisor relays
//! upward unchanged. The coordinator folds worker events into job-level
//! events for the caller. Nothing in this module blocks: events are the only
//! way state crosses a task boundary.

use std::path::PathBuf;

use super::error::FetchError;

/// Events emitted by a single worker and relayed by its supervisor.
#[derive(Debug)]
pub(crate) enum WorkerEvent {
    /// Periodic cumulative progress: `pre_downloaded + bytes this run`.
    Progress {
        /// Reporting worker.
        worker_id: usize,
        /// Cumulative downloaded bytes for this worker.
        total_downloaded: u64,
    },
    /// The worker finished every segment in its allocation.
    Completed {
        /// Finishing worker.
        worker_id: usize,
    },
    /// The worker acknowledged a stop request; its shard state is final.
    Stopped {
        /// Stopping worker.
        worker_id: usize,
    },
    /// The worker hit a transport or storage failure and gave up. Its shard
    /// state is committed before this event is sent.
    Error {
        /// Failing worker.
        worker_id: usize,
        /// What went wrong.
        error: FetchError,
    },
}

/// Job-level events delivered to the engine's caller.
#[derive(Debug)]
pub enum JobEvent {
    /// Output file assembled and the work directory removed.
    Completed,
    /// First worker failure of the run. Remaining workers keep running until
    /// the caller stops or cancels; later failures in the same run are
    /// logged, not re-emitted.
    Error(FetchError),
    /// Every worker stopped; shards are on disk and safe to resume from.
    Paused,
    /// Job discarded and the work directory removed.
    Cancelled,
    /// The output path was renamed to avoid clobbering an existing file.
    SaveAsChanged(PathBuf),
}
