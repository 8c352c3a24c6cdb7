//! Shardload Core Library
//!
//! A segmented, resumable file-download engine. Given a URL and a (possibly
//! unknown) total size, it partitions the remaining bytes across concurrent
//! workers, performs byte-range HTTP fetches, persists partial progress as
//! on-disk shards keyed by byte range, survives interruption and pause, and
//! reassembles a single output file on completion.
//!
//! # Architecture
//!
//! The library is organized into the following modules, leaves first:
//! - [`segment`] - Inclusive byte-range primitives
//! - [`shard`] - On-disk shard naming, recovery scan, and final merge
//! - [`allocate`] - Partitioning of undownloaded bytes across workers
//! - [`fetch`] - Workers, supervision, and job orchestration
//! - [`job`] - The serializable job record and status machine
//! - [`paths`] - Output-path disambiguation and work-dir derivation
//! - [`probe`] - HEAD probe for size and byte-range support

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod allocate;
pub mod fetch;
pub mod job;
pub mod paths;
pub mod probe;
pub mod segment;
pub mod shard;

// Re-export commonly used types
pub use allocate::{AllocationError, WorkerAllocation, allocate, split_pre_downloaded};
pub use fetch::{FetchError, Fetcher, JobEvent, ProgressSnapshot, WorkerProgress};
pub use job::{FetchJob, JobStatus};
pub use probe::FileSpec;
pub use segment::{Segment, count_bytes};
pub use shard::{ShardError, ShardWriter, scan_downloaded};
