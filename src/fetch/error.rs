//! Error types for the fetch engine.
//!
//! The taxonomy mirrors how failures propagate: transport errors are
//! per-worker and surfaced once per run; filesystem errors are fatal to the
//! affected worker; consistency errors indicate a logic defect and abort
//! progress reporting rather than clamping values.

use thiserror::Error;

use crate::allocate::AllocationError;
use crate::job::JobStatus;
use crate::shard::ShardError;

/// Errors surfaced by the fetch engine.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level transport failure (DNS, connect, TLS, mid-stream).
    #[error("network error fetching {url}: {source}")]
    Network {
        /// The URL that failed.
        url: String,
        /// The underlying transport error.
        #[source]
        source: reqwest::Error,
    },

    /// Server answered with a non-success status.
    #[error("HTTP {status} fetching {url}")]
    HttpStatus {
        /// The URL that returned the status.
        url: String,
        /// The HTTP status code.
        status: u16,
    },

    /// Server answered a ranged request with success but without honoring
    /// the range. Writing a whole-file body into a range shard would corrupt
    /// the cover, so this aborts the worker instead.
    #[error("server ignored byte-range request for {url} (HTTP {status})")]
    RangeNotHonored {
        /// The URL that ignored the range.
        url: String,
        /// The status actually returned (200, typically).
        status: u16,
    },

    /// Shard storage failure (work directory or shard file).
    #[error("shard storage error: {0}")]
    Shard(#[from] ShardError),

    /// Allocation failure (invalid recovered state).
    #[error("allocation error: {0}")]
    Allocation(#[from] AllocationError),

    /// A worker's downloaded byte count exceeds its fixed allocation.
    /// Indicates a logic defect; callers should pause or abort the job.
    #[error("worker {worker_id} downloaded {downloaded} bytes but was allocated {allocated}")]
    Consistency {
        /// Worker whose counter is out of range.
        worker_id: usize,
        /// Reported cumulative bytes.
        downloaded: u64,
        /// Fixed allocation capacity.
        allocated: u64,
    },

    /// The aggregate downloaded total fell below an earlier reading.
    /// Indicates a logic defect; progress reporting is aborted.
    #[error("aggregate downloaded {current} fell below previous reading {previous}")]
    ShrinkingProgress {
        /// Total just computed.
        current: u64,
        /// Total from the previous snapshot.
        previous: u64,
    },

    /// Operation is not legal in the job's current status.
    #[error("cannot {action} while the job is {status}")]
    InvalidState {
        /// The operation that was attempted.
        action: &'static str,
        /// Status at the time of the attempt.
        status: JobStatus,
    },

    /// A worker's task died without reporting (panic or runtime teardown).
    #[error("worker task failed: {reason}")]
    WorkerTaskFailed {
        /// Join error description.
        reason: String,
    },

    /// Resume was requested before any run derived a work directory.
    #[error("resume requires a work directory from a previous run")]
    MissingWorkDir,

    /// Unknown-size downloads cannot be segmented.
    #[error("a download of unknown size must use a single connection (requested {requested})")]
    SingleConnectionRequired {
        /// The connection count that was requested.
        requested: usize,
    },
}

impl FetchError {
    /// Creates a network error from a reqwest error.
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Network {
            url: url.into(),
            source,
        }
    }

    /// Creates an HTTP status error.
    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
        }
    }

    /// Creates a range-not-honored error.
    pub fn range_not_honored(url: impl Into<String>, status: u16) -> Self {
        Self::RangeNotHonored {
            url: url.into(),
            status,
        }
    }
}

// No From<reqwest::Error>: the Network variant needs the URL for context, so
// the helper constructors are the conversion points (same pattern as the
// shard IO errors, which need the path).

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_http_status_display() {
        let error = FetchError::http_status("https://example.com/f.bin", 503);
        let msg = error.to_string();
        assert!(msg.contains("503"), "expected status in: {msg}");
        assert!(msg.contains("https://example.com/f.bin"), "expected URL in: {msg}");
    }

    #[test]
    fn test_consistency_display_names_worker_and_bounds() {
        let error = FetchError::Consistency {
            worker_id: 2,
            downloaded: 600,
            allocated: 500,
        };
        let msg = error.to_string();
        assert!(msg.contains("worker 2"), "expected worker id in: {msg}");
        assert!(msg.contains("600"), "expected downloaded in: {msg}");
        assert!(msg.contains("500"), "expected allocated in: {msg}");
    }

    #[test]
    fn test_invalid_state_display() {
        let error = FetchError::InvalidState {
            action: "start",
            status: JobStatus::Running,
        };
        assert_eq!(error.to_string(), "cannot start while the job is running");
    }

    #[test]
    fn test_shard_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let shard_err = ShardError::Io {
            path: "/work/shard_0_9".into(),
            source: io,
        };
        let error: FetchError = shard_err.into();
        assert!(matches!(error, FetchError::Shard(_)));
    }
}
