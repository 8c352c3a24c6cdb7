//! Segmented fetch engine: workers, supervision, and job orchestration.
//!
//! One [`Fetcher`] drives one job. It recovers already-downloaded ranges
//! from the work directory, allocates the remainder across workers, runs
//! each worker on its own task, and merges the shards into the output file
//! when everything has arrived. Pause is cooperative and acknowledged:
//! [`JobEvent::Paused`] means every worker has committed its shard state and
//! the work directory is safe to resume from.

mod coordinator;
mod error;
mod event;
mod supervisor;
mod worker;

pub use coordinator::{Fetcher, ProgressSnapshot, WorkerProgress};
pub use error::FetchError;
pub use event::JobEvent;

pub(crate) use worker::build_client;
