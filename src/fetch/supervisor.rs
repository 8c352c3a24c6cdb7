//! Per-worker task ownership and event relay.
//!
//! A supervisor owns one worker's spawned task so one worker's blocking I/O
//! never stalls another. It relays the worker's events upward unchanged,
//! mirrors them into atomics for lock-free progress snapshots, and
//! guarantees the stop ordering the coordinator relies on: a terminal event
//! is forwarded only after the worker task has fully exited, so once every
//! supervisor has reported stopped, shard state on disk is final.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::allocate::WorkerAllocation;

use super::error::FetchError;
use super::event::WorkerEvent;
use super::worker::FetchWorker;

/// Handle to one worker's execution context.
#[derive(Debug)]
pub(crate) struct WorkerSupervisor {
    worker_id: usize,
    /// Fixed capacity for this run: pre-downloaded credit plus allocation.
    allocation: u64,
    /// Last cumulative progress report.
    total_downloaded: AtomicU64,
    done: AtomicBool,
    errored: AtomicBool,
    stopped: AtomicBool,
    cancel: CancellationToken,
}

impl WorkerSupervisor {
    /// Spawns a worker and its relay, returning the supervisor handle.
    ///
    /// Events arrive on `upstream` in the order the worker emitted them;
    /// the terminal event (`Completed`, `Stopped`, or `Error`) is forwarded
    /// only after the worker task has been joined.
    pub(crate) fn spawn(
        worker_id: usize,
        url: String,
        work_dir: PathBuf,
        allocation: WorkerAllocation,
        non_resumable: bool,
        upstream: mpsc::UnboundedSender<WorkerEvent>,
    ) -> Arc<Self> {
        let cancel = CancellationToken::new();
        let capacity = allocation.capacity();
        let pre_downloaded = allocation.pre_downloaded;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let worker = FetchWorker::new(
            worker_id,
            url,
            work_dir,
            allocation,
            non_resumable,
            events_tx,
            cancel.clone(),
        );
        let worker_task = tokio::spawn(worker.run());

        let supervisor = Arc::new(Self {
            worker_id,
            allocation: capacity,
            total_downloaded: AtomicU64::new(pre_downloaded),
            done: AtomicBool::new(false),
            errored: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            cancel,
        });

        tokio::spawn(relay(
            Arc::clone(&supervisor),
            events_rx,
            worker_task,
            upstream,
        ));

        supervisor
    }

    /// Requests a cooperative stop.
    ///
    /// Forwarded to the worker only if it is not already done, errored, or
    /// stopped; calling again is a no-op. The acknowledgment arrives as a
    /// `Stopped` event on the upstream channel.
    pub(crate) fn stop(&self) {
        if self.is_done() || self.is_errored() || self.is_stopped() {
            return;
        }
        self.cancel.cancel();
    }

    pub(crate) fn worker_id(&self) -> usize {
        self.worker_id
    }

    /// Fixed byte capacity for this run.
    pub(crate) fn allocation(&self) -> u64 {
        self.allocation
    }

    /// Last reported cumulative downloaded bytes.
    pub(crate) fn total_downloaded(&self) -> u64 {
        self.total_downloaded.load(Ordering::SeqCst)
    }

    pub(crate) fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    pub(crate) fn is_errored(&self) -> bool {
        self.errored.load(Ordering::SeqCst)
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Whether this worker's shard state is final for the run: it finished
    /// its allocation, acknowledged a stop, or committed and errored out.
    pub(crate) fn is_settled(&self) -> bool {
        self.is_done() || self.is_stopped()
    }
}

/// Mirrors worker events into the supervisor's atomics and forwards them.
async fn relay(
    supervisor: Arc<WorkerSupervisor>,
    mut events_rx: mpsc::UnboundedReceiver<WorkerEvent>,
    worker_task: JoinHandle<()>,
    upstream: mpsc::UnboundedSender<WorkerEvent>,
) {
    let mut worker_task = Some(worker_task);

    while let Some(event) = events_rx.recv().await {
        let terminal = match &event {
            WorkerEvent::Progress {
                total_downloaded, ..
            } => {
                supervisor
                    .total_downloaded
                    .store(*total_downloaded, Ordering::SeqCst);
                false
            }
            WorkerEvent::Completed { .. } => {
                supervisor.done.store(true, Ordering::SeqCst);
                true
            }
            WorkerEvent::Stopped { .. } => {
                supervisor.stopped.store(true, Ordering::SeqCst);
                true
            }
            WorkerEvent::Error { .. } => {
                // An errored worker has committed its shard; it counts as
                // stopped for pause bookkeeping.
                supervisor.errored.store(true, Ordering::SeqCst);
                supervisor.stopped.store(true, Ordering::SeqCst);
                true
            }
        };

        if terminal {
            // Tear down the execution context before reporting, so the
            // coordinator can trust disk state once all workers settled.
            if let Some(handle) = worker_task.take() {
                if let Err(e) = handle.await {
                    warn!(worker_id = supervisor.worker_id, error = %e, "worker task join failed");
                }
            }
        }

        if upstream.send(event).is_err() {
            return; // run already torn down
        }
    }

    // Channel closed without a terminal event: the worker task panicked.
    if let Some(handle) = worker_task.take() {
        if let Err(e) = handle.await {
            warn!(worker_id = supervisor.worker_id, error = %e, "worker task panicked");
            supervisor.errored.store(true, Ordering::SeqCst);
            supervisor.stopped.store(true, Ordering::SeqCst);
            let _ = upstream.send(WorkerEvent::Error {
                worker_id: supervisor.worker_id,
                error: FetchError::WorkerTaskFailed {
                    reason: e.to_string(),
                },
            });
        }
    }
}
