//! Orchestration of a full fetch job: recovery scan, allocation, worker
//! spawning, progress aggregation, and the final merge.
//!
//! The coordinator is the engine's public surface. Each `start`/`resume`
//! builds a fresh set of workers from whatever shards are on disk, then hands
//! all bookkeeping to a single event-loop task: worker events and external
//! `stop`/`cancel` requests arrive on channels and are processed one at a
//! time, so completion tracking never races. Locks guard only the small
//! bookkeeping fields and are never held across I/O.
//!
//! # Example
//!
//! ```no_run
//! use shardload_core::{FetchJob, Fetcher, JobEvent};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let job = FetchJob::new("https://example.com/big.iso", Some(700_000_000), "./big.iso", 4);
//! let (fetcher, mut events) = Fetcher::new(job);
//! fetcher.start(4).await?;
//! while let Some(event) = events.recv().await {
//!     match event {
//!         JobEvent::Completed => break,
//!         JobEvent::Paused => break,
//!         other => println!("{other:?}"),
//!     }
//! }
//! # Ok(())
//! # }
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::allocate::{self, WorkerAllocation};
use crate::job::{FetchJob, JobStatus};
use crate::paths;
use crate::segment::{Segment, count_bytes};
use crate::shard::{self, ShardError};

use super::error::FetchError;
use super::event::{JobEvent, WorkerEvent};
use super::supervisor::WorkerSupervisor;

/// One worker's `(downloaded, allocated)` pair for progress rendering.
#[derive(Debug, Clone, Copy)]
pub struct WorkerProgress {
    /// Last reported cumulative downloaded bytes.
    pub downloaded: u64,
    /// Fixed allocation capacity for the run.
    pub allocated: u64,
}

/// Point-in-time view of job progress.
#[derive(Debug, Clone)]
pub struct ProgressSnapshot {
    /// Sum of every worker's cumulative downloaded bytes.
    pub total_downloaded: u64,
    /// Per-worker pairs, in worker-id order.
    pub workers: Vec<WorkerProgress>,
}

/// External requests injected into the event loop.
#[derive(Debug)]
enum ControlMsg {
    Stop,
    Cancel,
}

/// Coordinator for one fetch job.
///
/// The public handle is the only way to drive the job. Dropping the handle
/// does not stop a running job; call [`stop`](Fetcher::stop) or
/// [`cancel`](Fetcher::cancel) first.
pub struct Fetcher {
    inner: Arc<Inner>,
}

struct Inner {
    url: String,
    file_size: Option<u64>,
    save_as: Mutex<PathBuf>,
    work_dir: Mutex<Option<PathBuf>>,
    num_connections: Mutex<usize>,
    status: Mutex<JobStatus>,
    /// Supervisors of the current run; cleared when the run ends.
    supervisors: Mutex<Vec<Arc<WorkerSupervisor>>>,
    /// Control channel into the current run's event loop.
    control: Mutex<Option<mpsc::UnboundedSender<ControlMsg>>>,
    cancel_requested: AtomicBool,
    /// Previous aggregate total, for the shrinking-progress check.
    last_total: AtomicU64,
    job_events: mpsc::UnboundedSender<JobEvent>,
}

impl Fetcher {
    /// Creates a coordinator for `job` and returns the job-event receiver.
    ///
    /// A record recovered from an external store may claim an active status
    /// no process is actually running; it is normalized to `Paused` (work
    /// directory known) or `Idle`.
    #[must_use]
    pub fn new(job: FetchJob) -> (Self, mpsc::UnboundedReceiver<JobEvent>) {
        let status = if job.status.is_active() {
            debug!(status = %job.status, "normalizing stale active status");
            if job.work_dir.is_some() {
                JobStatus::Paused
            } else {
                JobStatus::Idle
            }
        } else {
            job.status
        };
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let fetcher = Self {
            inner: Arc::new(Inner {
                url: job.url,
                file_size: job.file_size,
                save_as: Mutex::new(job.save_as),
                work_dir: Mutex::new(job.work_dir),
                num_connections: Mutex::new(job.num_connections),
                status: Mutex::new(status),
                supervisors: Mutex::new(Vec::new()),
                control: Mutex::new(None),
                cancel_requested: AtomicBool::new(false),
                last_total: AtomicU64::new(0),
                job_events: events_tx,
            }),
        };
        (fetcher, events_rx)
    }

    /// Starts a fresh download.
    ///
    /// If the output path (or a work directory for it) already exists, a
    /// `" (1)"`-style suffix is appended and [`JobEvent::SaveAsChanged`] is
    /// emitted with the new path. The work directory is derived from the
    /// final output path, then the job proceeds as a resume from empty.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::InvalidState`] unless the job is idle, plus any
    /// error [`resume`](Self::resume) can return.
    pub async fn start(&self, num_connections: usize) -> Result<(), FetchError> {
        {
            let status = *self.inner.status.lock();
            if status != JobStatus::Idle {
                return Err(FetchError::InvalidState {
                    action: "start",
                    status,
                });
            }
        }

        let current = self.inner.save_as.lock().clone();
        let (resolved, changed) = paths::resolve_output_path(&current);
        if changed {
            info!(from = %current.display(), to = %resolved.display(), "output path disambiguated");
            *self.inner.save_as.lock() = resolved.clone();
            self.emit(JobEvent::SaveAsChanged(resolved.clone()));
        }

        let work_dir = paths::work_dir_for(&resolved);
        *self.inner.work_dir.lock() = Some(work_dir.clone());
        self.run(work_dir, num_connections).await
    }

    /// Resumes from the work directory recorded by a previous run.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::MissingWorkDir`] when no run has derived a work
    /// directory yet, [`FetchError::InvalidState`] when the job is already
    /// active or terminal, [`FetchError::SingleConnectionRequired`] for an
    /// unknown-size job with more than one connection, and allocation or
    /// filesystem errors from the recovery pass.
    pub async fn resume(&self, num_connections: usize) -> Result<(), FetchError> {
        let work_dir = self
            .inner
            .work_dir
            .lock()
            .clone()
            .ok_or(FetchError::MissingWorkDir)?;
        self.run(work_dir, num_connections).await
    }

    /// Resumes from an explicitly supplied work directory (a job record
    /// loaded from external storage).
    ///
    /// # Errors
    ///
    /// Same as [`resume`](Self::resume), minus `MissingWorkDir`.
    pub async fn resume_from(
        &self,
        work_dir: impl Into<PathBuf>,
        num_connections: usize,
    ) -> Result<(), FetchError> {
        let work_dir = work_dir.into();
        *self.inner.work_dir.lock() = Some(work_dir.clone());
        self.run(work_dir, num_connections).await
    }

    /// Requests a pause. Non-blocking and idempotent.
    ///
    /// Workers stop cooperatively; [`JobEvent::Paused`] is emitted once every
    /// worker has acknowledged and its shard state is final. Only after that
    /// event is the work directory safe to inspect or resume from.
    pub fn stop(&self) {
        let control = self.inner.control.lock().clone();
        if let Some(tx) = control {
            let _ = tx.send(ControlMsg::Stop);
        }
    }

    /// Discards the job: stops all workers, removes the work directory, and
    /// emits [`JobEvent::Cancelled`]. Non-blocking while a run is active.
    pub fn cancel(&self) {
        if self.inner.status.lock().is_terminal() {
            return;
        }
        self.inner.cancel_requested.store(true, Ordering::SeqCst);
        let control = self.inner.control.lock().clone();
        if let Some(tx) = control {
            if tx.send(ControlMsg::Cancel).is_ok() {
                return;
            }
        }
        // No live run; discard directly.
        if let Some(dir) = self.inner.work_dir.lock().clone() {
            shard::remove_work_dir(&dir);
        }
        *self.inner.status.lock() = JobStatus::Cancelled;
        self.emit(JobEvent::Cancelled);
    }

    /// Snapshot of total and per-worker progress.
    ///
    /// Read-only and safe to call from a render loop; it may race benignly
    /// with workers updating their own counters.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::Consistency`] when any worker's downloaded
    /// count exceeds its allocation, or [`FetchError::ShrinkingProgress`]
    /// when the aggregate fell below an earlier reading. Both indicate a
    /// logic defect; callers should pause or abort rather than keep
    /// rendering.
    pub fn progress(&self) -> Result<ProgressSnapshot, FetchError> {
        let supervisors = self.inner.supervisors.lock().clone();
        if supervisors.is_empty() {
            return Ok(ProgressSnapshot {
                total_downloaded: 0,
                workers: Vec::new(),
            });
        }

        let check_allocation = self.inner.file_size.is_some();
        let mut workers = Vec::with_capacity(supervisors.len());
        let mut total = 0u64;
        for supervisor in &supervisors {
            let downloaded = supervisor.total_downloaded();
            let allocated = supervisor.allocation();
            if check_allocation && downloaded > allocated {
                return Err(FetchError::Consistency {
                    worker_id: supervisor.worker_id(),
                    downloaded,
                    allocated,
                });
            }
            total += downloaded;
            workers.push(WorkerProgress {
                downloaded,
                allocated,
            });
        }

        let previous = self.inner.last_total.load(Ordering::SeqCst);
        if total < previous {
            return Err(FetchError::ShrinkingProgress {
                current: total,
                previous,
            });
        }
        self.inner.last_total.store(total, Ordering::SeqCst);

        Ok(ProgressSnapshot {
            total_downloaded: total,
            workers,
        })
    }

    /// Current job status.
    #[must_use]
    pub fn status(&self) -> JobStatus {
        *self.inner.status.lock()
    }

    /// Output path, including any disambiguation suffix applied at start.
    #[must_use]
    pub fn save_as(&self) -> PathBuf {
        self.inner.save_as.lock().clone()
    }

    /// Work directory, once a run has derived one.
    #[must_use]
    pub fn work_dir(&self) -> Option<PathBuf> {
        self.inner.work_dir.lock().clone()
    }

    /// Writes the engine-owned fields back into a job record for the
    /// external store: work directory, possibly-renamed output path,
    /// connection count, and status.
    #[must_use]
    pub fn job(&self) -> FetchJob {
        FetchJob {
            url: self.inner.url.clone(),
            file_size: self.inner.file_size,
            save_as: self.inner.save_as.lock().clone(),
            work_dir: self.inner.work_dir.lock().clone(),
            num_connections: *self.inner.num_connections.lock(),
            status: *self.inner.status.lock(),
        }
    }

    /// Prepares the work directory, recovers shard state, spawns one
    /// supervisor per connection, and hands off to the event loop.
    async fn run(&self, work_dir: PathBuf, num_connections: usize) -> Result<(), FetchError> {
        if self.inner.file_size.is_none() && num_connections != 1 {
            return Err(FetchError::SingleConnectionRequired {
                requested: num_connections,
            });
        }

        // Reserve the run under the lock; roll back if preparation fails.
        let previous_status = {
            let mut status = self.inner.status.lock();
            match *status {
                JobStatus::Idle | JobStatus::Paused => {
                    let previous = *status;
                    *status = JobStatus::Running;
                    previous
                }
                other => {
                    return Err(FetchError::InvalidState {
                        action: "resume",
                        status: other,
                    });
                }
            }
        };

        match self.prepare_and_spawn(&work_dir, num_connections).await {
            Ok(()) => Ok(()),
            Err(e) => {
                *self.inner.status.lock() = previous_status;
                Err(e)
            }
        }
    }

    async fn prepare_and_spawn(
        &self,
        work_dir: &Path,
        num_connections: usize,
    ) -> Result<(), FetchError> {
        // Unknown-size downloads cannot resume mid-way: wipe and restart.
        if self.inner.file_size.is_none() {
            shard::remove_work_dir(work_dir);
        }
        tokio::fs::create_dir_all(work_dir)
            .await
            .map_err(|e| FetchError::Shard(ShardError::io(work_dir, e)))?;

        let downloaded = shard::scan_downloaded(work_dir);
        let pre_downloaded_total = count_bytes(&downloaded);
        let allocations: Vec<Vec<Segment>> = match self.inner.file_size {
            Some(size) => allocate::allocate(&downloaded, size, num_connections)?,
            // Placeholder allocation; an unknown-size worker fetches the
            // whole body regardless of bounds.
            None => vec![vec![Segment::new(0, 0)]],
        };
        let credits = allocate::split_pre_downloaded(pre_downloaded_total, num_connections);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        let supervisors: Vec<Arc<WorkerSupervisor>> = allocations
            .into_iter()
            .zip(credits)
            .enumerate()
            .map(|(worker_id, (segments, credit))| {
                WorkerSupervisor::spawn(
                    worker_id,
                    self.inner.url.clone(),
                    work_dir.to_path_buf(),
                    WorkerAllocation::new(segments, credit),
                    self.inner.file_size.is_none(),
                    events_tx.clone(),
                )
            })
            .collect();

        info!(
            url = %self.inner.url,
            work_dir = %work_dir.display(),
            workers = supervisors.len(),
            recovered_bytes = pre_downloaded_total,
            recovered_shards = downloaded.len(),
            "run started"
        );

        *self.inner.supervisors.lock() = supervisors.clone();
        *self.inner.control.lock() = Some(control_tx);
        *self.inner.num_connections.lock() = num_connections;
        self.inner.cancel_requested.store(false, Ordering::SeqCst);
        self.inner.last_total.store(0, Ordering::SeqCst);

        tokio::spawn(run_loop(
            Arc::clone(&self.inner),
            supervisors,
            events_rx,
            control_rx,
            work_dir.to_path_buf(),
        ));
        Ok(())
    }

    fn emit(&self, event: JobEvent) {
        let _ = self.inner.job_events.send(event);
    }
}

/// Single consumer of worker events and control requests for one run.
///
/// All completion bookkeeping happens here, one message at a time; the
/// supervisors' atomics are only ever *read* outside this task.
async fn run_loop(
    inner: Arc<Inner>,
    supervisors: Vec<Arc<WorkerSupervisor>>,
    mut events_rx: mpsc::UnboundedReceiver<WorkerEvent>,
    mut control_rx: mpsc::UnboundedReceiver<ControlMsg>,
    work_dir: PathBuf,
) {
    let mut error_reported = false;

    loop {
        tokio::select! {
            event = events_rx.recv() => {
                let Some(event) = event else {
                    // Every relay gone without a terminal transition; treat
                    // as a stop so shards stay resumable.
                    warn!("worker event channel closed unexpectedly");
                    finish_run(&inner, &supervisors, &work_dir).await;
                    return;
                };
                match event {
                    WorkerEvent::Progress { .. } => continue,
                    WorkerEvent::Completed { worker_id } => {
                        debug!(worker_id, "worker completed");
                    }
                    WorkerEvent::Stopped { worker_id } => {
                        debug!(worker_id, "worker stopped");
                    }
                    WorkerEvent::Error { worker_id, error } => {
                        if error_reported {
                            // Only the first failure of a run is surfaced.
                            warn!(worker_id, error = %error, "suppressing subsequent worker error");
                        } else {
                            error_reported = true;
                            warn!(worker_id, error = %error, "worker error");
                            {
                                let mut status = inner.status.lock();
                                if *status == JobStatus::Running {
                                    *status = JobStatus::Erroring;
                                }
                            }
                            let _ = inner.job_events.send(JobEvent::Error(error));
                        }
                    }
                }
                if supervisors.iter().all(|s| s.is_settled()) {
                    finish_run(&inner, &supervisors, &work_dir).await;
                    return;
                }
            }
            control = control_rx.recv() => {
                let Some(msg) = control else { continue };
                debug!(?msg, "control request");
                if matches!(msg, ControlMsg::Cancel) {
                    inner.cancel_requested.store(true, Ordering::SeqCst);
                }
                {
                    let mut status = inner.status.lock();
                    if matches!(*status, JobStatus::Running | JobStatus::Erroring) {
                        *status = JobStatus::Pausing;
                    }
                }
                for supervisor in &supervisors {
                    supervisor.stop();
                }
                if supervisors.iter().all(|s| s.is_settled()) {
                    finish_run(&inner, &supervisors, &work_dir).await;
                    return;
                }
            }
        }
    }
}

/// Decides the outcome of a run once every worker has settled.
async fn finish_run(inner: &Arc<Inner>, supervisors: &[Arc<WorkerSupervisor>], work_dir: &Path) {
    let teardown = |status: JobStatus| {
        inner.supervisors.lock().clear();
        *inner.control.lock() = None;
        inner.last_total.store(0, Ordering::SeqCst);
        *inner.status.lock() = status;
    };

    if inner.cancel_requested.load(Ordering::SeqCst) {
        shard::remove_work_dir(work_dir);
        teardown(JobStatus::Cancelled);
        info!("job cancelled, work directory removed");
        let _ = inner.job_events.send(JobEvent::Cancelled);
        return;
    }

    let all_done = supervisors.iter().all(|s| s.is_done());
    let total: u64 = supervisors.iter().map(|s| s.total_downloaded()).sum();
    let complete = all_done
        && match inner.file_size {
            Some(size) => total >= size,
            None => true,
        };

    if !complete {
        if all_done {
            // Should not happen under a correct allocation; shards are
            // intact, so a resume re-allocates the true gaps.
            warn!(
                total,
                file_size = ?inner.file_size,
                "all workers done but download incomplete; pausing"
            );
        }
        teardown(JobStatus::Paused);
        info!(total, "job paused");
        let _ = inner.job_events.send(JobEvent::Paused);
        return;
    }

    *inner.status.lock() = JobStatus::Completing;
    let expected_size = inner.file_size.unwrap_or(total);
    let output = inner.save_as.lock().clone();
    match shard::merge(work_dir, &output, expected_size).await {
        Ok(()) => {
            teardown(JobStatus::Completed);
            info!(output = %output.display(), bytes = expected_size, "job completed");
            let _ = inner.job_events.send(JobEvent::Completed);
        }
        Err(e) => {
            // Shards are untouched; the caller can resume to retry the
            // completion pass.
            warn!(error = %e, "merge failed; pausing with shards intact");
            let _ = inner.job_events.send(JobEvent::Error(FetchError::Shard(e)));
            teardown(JobStatus::Paused);
            let _ = inner.job_events.send(JobEvent::Paused);
        }
    }
}
