//! Partitioning of undownloaded bytes across workers.
//!
//! [`allocate`] is a pure function: given the sorted set of byte ranges
//! already on disk and the total file size, it splits the remaining bytes
//! into one ordered segment list per connection. Workers fetch their
//! segments in ascending order, so allocations are built front-to-back from
//! a queue of the undownloaded gaps.

use std::collections::VecDeque;

use thiserror::Error;

use crate::segment::{Segment, count_bytes};

/// Errors from the allocation pass.
///
/// These indicate invalid recovered state (a corrupted work directory or a
/// logic defect upstream), not runtime conditions; the job cannot proceed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AllocationError {
    /// A downloaded segment has `start > end`.
    #[error("downloaded segment {segment} has start beyond end")]
    InvalidSegment {
        /// The inverted segment.
        segment: Segment,
    },

    /// The downloaded segments sum to more than the declared file size,
    /// which means they overlap or the size is wrong.
    #[error("downloaded segments total {downloaded} bytes but the file is only {file_size} bytes")]
    Oversubscribed {
        /// Total bytes claimed by the downloaded set.
        downloaded: u64,
        /// Declared file size.
        file_size: u64,
    },

    /// Zero connections requested.
    #[error("at least one connection is required")]
    NoConnections,
}

/// Ordered segment list assigned to one worker for one run, plus the byte
/// credit it carries from previous runs.
///
/// Capacity (`pre_downloaded + sum of segment lengths`) is fixed for the
/// run; a worker's cumulative downloaded count must never exceed it.
#[derive(Debug, Clone, Default)]
pub struct WorkerAllocation {
    /// Segments to fetch, ascending by start.
    pub segments: Vec<Segment>,
    /// Bytes this worker already owns from a previous run.
    pub pre_downloaded: u64,
}

impl WorkerAllocation {
    /// Creates an allocation from segments and pre-downloaded credit.
    #[must_use]
    pub fn new(segments: Vec<Segment>, pre_downloaded: u64) -> Self {
        Self {
            segments,
            pre_downloaded,
        }
    }

    /// Total bytes this worker accounts for: prior credit plus new segments.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.pre_downloaded + count_bytes(&self.segments)
    }
}

/// Splits the undownloaded portion of a file among `num_connections` workers.
///
/// The complement of `downloaded` within `[0, file_size - 1]` is computed as
/// an ordered gap queue. Each worker's target load is
/// `undownloaded / num_connections`, with the division remainder added to the
/// last worker. Workers fill greedily from the front of the queue: a gap
/// smaller than the remaining capacity is taken whole, an exactly-fitting gap
/// finishes the worker, and a larger gap is split with the tail pushed back
/// for the next worker. A zero-target worker gets an empty list.
///
/// The input `downloaded` set does not need to be sorted; a sorted copy is
/// taken internally. Output lists are ascending by construction, which is the
/// order workers must fetch them in.
///
/// # Errors
///
/// Returns [`AllocationError::InvalidSegment`] for an inverted input segment,
/// [`AllocationError::Oversubscribed`] when the downloaded set exceeds the
/// file size, and [`AllocationError::NoConnections`] for zero workers.
pub fn allocate(
    downloaded: &[Segment],
    file_size: u64,
    num_connections: usize,
) -> Result<Vec<Vec<Segment>>, AllocationError> {
    if num_connections == 0 {
        return Err(AllocationError::NoConnections);
    }
    for segment in downloaded {
        if !segment.is_valid() {
            return Err(AllocationError::InvalidSegment { segment: *segment });
        }
    }

    let downloaded_bytes = count_bytes(downloaded);
    let undownloaded_total = file_size
        .checked_sub(downloaded_bytes)
        .ok_or(AllocationError::Oversubscribed {
            downloaded: downloaded_bytes,
            file_size,
        })?;

    let mut sorted: Vec<Segment> = downloaded.to_vec();
    sorted.sort();

    // Complement of the downloaded set: gaps before, between, and after.
    let mut gaps: VecDeque<Segment> = VecDeque::new();
    let mut cursor: u64 = 0;
    for segment in &sorted {
        if segment.start > cursor {
            gaps.push_back(Segment::new(cursor, segment.start - 1));
        }
        cursor = segment.end + 1;
    }
    if cursor < file_size {
        gaps.push_back(Segment::new(cursor, file_size - 1));
    }

    let connections = num_connections as u64;
    let min_load = undownloaded_total / connections;
    let remainder = undownloaded_total % connections;

    let mut allocations = Vec::with_capacity(num_connections);
    for i in 0..num_connections {
        let mut target = min_load;
        if i == num_connections - 1 {
            target += remainder;
        }
        let mut allocation = Vec::new();
        let mut capacity_left = target;
        while capacity_left > 0 {
            let Some(gap) = gaps.pop_front() else {
                break;
            };
            let gap_size = gap.len();
            if gap_size < capacity_left {
                allocation.push(gap);
                capacity_left -= gap_size;
            } else if gap_size == capacity_left {
                allocation.push(gap);
                break;
            } else {
                // Split: take a prefix, return the tail to the queue front.
                let split = gap.start + capacity_left - 1;
                allocation.push(Segment::new(gap.start, split));
                gaps.push_front(Segment::new(split + 1, gap.end));
                break;
            }
        }
        allocations.push(allocation);
    }

    Ok(allocations)
}

/// Splits previously-downloaded byte credit evenly across workers, with the
/// division remainder added to the last worker.
///
/// The credit is bookkeeping only: it makes per-worker capacity add up to the
/// file size regardless of which worker originally fetched which shard.
#[must_use]
pub fn split_pre_downloaded(total: u64, num_connections: usize) -> Vec<u64> {
    if num_connections == 0 {
        return Vec::new();
    }
    let connections = num_connections as u64;
    let per_worker = total / connections;
    let mut shares = vec![per_worker; num_connections];
    if let Some(last) = shares.last_mut() {
        *last += total % connections;
    }
    shares
}
