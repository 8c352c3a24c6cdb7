//! Job-level record handed to the fetch engine.
//!
//! A [`FetchJob`] carries everything the engine needs to start or resume one
//! download. The record itself is persisted by an external store; this crate
//! only defines the shape, keeps it serializable, and writes back the fields
//! the engine owns (work directory, possibly-renamed save path, status).

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Logical status of a fetch job.
///
/// Transitions are driven by the coordinator:
///
/// ```text
/// Idle ──start/resume──> Running ──stop──> Pausing ──all stopped──> Paused
/// Paused ──resume──> Running
/// Running ──first worker error──> Erroring (workers keep running)
/// Running/Erroring ──all done, bytes match──> Completing ──merge──> Completed
/// Running/Erroring ──all done, bytes short──> Paused
/// any ──cancel──> Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created, never started (or fully reset).
    Idle,
    /// Workers are fetching.
    Running,
    /// Stop requested; waiting for every worker to acknowledge.
    Pausing,
    /// All workers stopped; shards preserved on disk for a later resume.
    Paused,
    /// All bytes received; merge in progress.
    Completing,
    /// Output file assembled, work directory removed.
    Completed,
    /// A worker reported a transport error; remaining workers keep running
    /// until the caller stops or cancels.
    Erroring,
    /// Job discarded; work directory removed.
    Cancelled,
}

impl JobStatus {
    /// Whether workers may currently be executing.
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(
            self,
            Self::Running | Self::Pausing | Self::Completing | Self::Erroring
        )
    }

    /// Whether the job has reached a state it cannot leave.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Pausing => "pausing",
            Self::Paused => "paused",
            Self::Completing => "completing",
            Self::Completed => "completed",
            Self::Erroring => "erroring",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Engine-level unit of work: one URL downloaded to one output path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchJob {
    /// Source URL.
    pub url: String,
    /// Declared total size in bytes; `None` when the server did not report
    /// one. Unknown-size jobs run a single unranged worker and cannot be
    /// resumed mid-way, only restarted.
    pub file_size: Option<u64>,
    /// Output path. May be rewritten with a `" (1)"`-style suffix at start
    /// time to avoid clobbering an existing file.
    pub save_as: PathBuf,
    /// Per-job shard directory; `None` until the first run derives it.
    pub work_dir: Option<PathBuf>,
    /// Desired number of concurrent connections.
    pub num_connections: usize,
    /// Current logical status.
    pub status: JobStatus,
}

impl FetchJob {
    /// Creates an idle job with no work directory yet.
    #[must_use]
    pub fn new(
        url: impl Into<String>,
        file_size: Option<u64>,
        save_as: impl Into<PathBuf>,
        num_connections: usize,
    ) -> Self {
        Self {
            url: url.into(),
            file_size,
            save_as: save_as.into(),
            work_dir: None,
            num_connections,
            status: JobStatus::Idle,
        }
    }

    /// Whether this job can be paused and resumed mid-way.
    ///
    /// Only jobs with a known size support byte-range fetches and therefore
    /// shard-level resume.
    #[must_use]
    pub fn resumable(&self) -> bool {
        self.file_size.is_some()
    }
}
