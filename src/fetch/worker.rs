//! A single connection's sequential byte-range fetch loop.
//!
//! A worker owns one HTTP connection's worth of work: an ordered list of
//! segments it fetches one at a time, each streamed into its own shard
//! working file and committed when the response ends. Stop is cooperative:
//! a cancellation token aborts the in-flight request, the current shard is
//! committed to the bytes actually received, and a `Stopped` acknowledgment
//! is the last thing the worker sends.

use std::path::PathBuf;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::{CONNECTION, HeaderMap, HeaderValue, RANGE};
use tokio::sync::mpsc;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::allocate::WorkerAllocation;
use crate::segment::Segment;
use crate::shard::ShardWriter;

use super::error::FetchError;
use super::event::WorkerEvent;

/// How often a running worker reports cumulative progress.
///
/// Purely observational; independent of the I/O path.
pub(crate) const PROGRESS_UPDATE_INTERVAL: Duration = Duration::from_millis(200);

/// Builds the HTTP client a worker (or the probe) uses.
///
/// Keep-alive is requested explicitly on every connection; a worker issues
/// its segment fetches sequentially on the same connection.
pub(crate) fn build_client() -> Result<reqwest::Client, reqwest::Error> {
    let mut headers = HeaderMap::new();
    headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
    reqwest::Client::builder().default_headers(headers).build()
}

/// Outcome of fetching one segment.
enum SegmentOutcome {
    /// Response ended and the shard was committed; move to the next segment.
    Done,
    /// Stop was requested; the shard is committed and `Stopped` must follow.
    Stopped,
    /// Transport or storage failure; received bytes were committed.
    Failed(FetchError),
}

/// One connection's sequential fetch loop.
pub(crate) struct FetchWorker {
    worker_id: usize,
    url: String,
    work_dir: PathBuf,
    allocation: WorkerAllocation,
    /// Unknown file size: one unranged GET, restart-only.
    non_resumable: bool,
    events: mpsc::UnboundedSender<WorkerEvent>,
    cancel: CancellationToken,
}

impl FetchWorker {
    pub(crate) fn new(
        worker_id: usize,
        url: String,
        work_dir: PathBuf,
        allocation: WorkerAllocation,
        non_resumable: bool,
        events: mpsc::UnboundedSender<WorkerEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            worker_id,
            url,
            work_dir,
            allocation,
            non_resumable,
            events,
            cancel,
        }
    }

    /// Runs the worker to completion, stop, or error.
    ///
    /// Consumes the worker; spawned once by the supervisor. Every exit path
    /// sends exactly one terminal event (`Completed`, `Stopped`, or `Error`).
    pub(crate) async fn run(self) {
        let client = match build_client() {
            Ok(client) => client,
            Err(e) => {
                self.send(WorkerEvent::Error {
                    worker_id: self.worker_id,
                    error: FetchError::network(&self.url, e),
                });
                return;
            }
        };

        // Per-segment plan: a known-size worker walks its allocation in
        // order; an unknown-size worker does a single unranged fetch.
        let plan: Vec<Option<Segment>> = if self.non_resumable {
            vec![None]
        } else {
            self.allocation.segments.iter().copied().map(Some).collect()
        };

        let mut downloaded_this_run = 0u64;
        self.send_progress(downloaded_this_run);

        if plan.is_empty() {
            debug!(worker_id = self.worker_id, "empty allocation, completing immediately");
            self.send(WorkerEvent::Completed {
                worker_id: self.worker_id,
            });
            return;
        }

        let mut ticker = tokio::time::interval(PROGRESS_UPDATE_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Consume the immediate first tick so the cadence starts one
        // interval from now.
        ticker.tick().await;

        for segment in plan {
            match self
                .fetch_segment(&client, segment, &mut downloaded_this_run, &mut ticker)
                .await
            {
                SegmentOutcome::Done => {}
                SegmentOutcome::Stopped => {
                    self.send_progress(downloaded_this_run);
                    self.send(WorkerEvent::Stopped {
                        worker_id: self.worker_id,
                    });
                    return;
                }
                SegmentOutcome::Failed(error) => {
                    warn!(worker_id = self.worker_id, error = %error, "worker failed");
                    self.send_progress(downloaded_this_run);
                    self.send(WorkerEvent::Error {
                        worker_id: self.worker_id,
                        error,
                    });
                    return;
                }
            }
        }

        self.send_progress(downloaded_this_run);
        debug!(
            worker_id = self.worker_id,
            bytes = downloaded_this_run,
            "worker completed allocation"
        );
        self.send(WorkerEvent::Completed {
            worker_id: self.worker_id,
        });
    }

    /// Fetches one segment (or the whole body in unknown-size mode) into a
    /// shard working file and commits it.
    async fn fetch_segment(
        &self,
        client: &reqwest::Client,
        segment: Option<Segment>,
        downloaded_this_run: &mut u64,
        ticker: &mut Interval,
    ) -> SegmentOutcome {
        let mut writer = match ShardWriter::create(&self.work_dir, segment).await {
            Ok(writer) => writer,
            Err(e) => return SegmentOutcome::Failed(e.into()),
        };

        let mut request = client.get(&self.url);
        if let Some(segment) = segment {
            request = request.header(RANGE, format!("bytes={}-{}", segment.start, segment.end));
        }

        let response = tokio::select! {
            () = self.cancel.cancelled() => {
                return self.commit_for_stop(writer).await;
            }
            result = request.send() => match result {
                Ok(response) => response,
                Err(e) => {
                    self.commit_best_effort(writer).await;
                    return SegmentOutcome::Failed(FetchError::network(&self.url, e));
                }
            },
        };

        let status = response.status();
        if !status.is_success() {
            self.commit_best_effort(writer).await; // zero bytes; deletes the working file
            return SegmentOutcome::Failed(FetchError::http_status(&self.url, status.as_u16()));
        }
        if segment.is_some() && status.as_u16() != 206 {
            self.commit_best_effort(writer).await;
            return SegmentOutcome::Failed(FetchError::range_not_honored(
                &self.url,
                status.as_u16(),
            ));
        }

        let mut stream = response.bytes_stream();
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    return self.commit_for_stop(writer).await;
                }
                _ = ticker.tick() => {
                    self.send_progress(*downloaded_this_run);
                }
                chunk = stream.next() => match chunk {
                    None => break,
                    Some(Ok(bytes)) => {
                        if let Err(e) = writer.write_chunk(&bytes).await {
                            return SegmentOutcome::Failed(e.into());
                        }
                        *downloaded_this_run += bytes.len() as u64;
                    }
                    Some(Err(e)) => {
                        // Keep what arrived; the next allocation pass fills
                        // the rest of this segment.
                        self.commit_best_effort(writer).await;
                        return SegmentOutcome::Failed(FetchError::network(&self.url, e));
                    }
                },
            }
        }

        match writer.commit().await {
            Ok(committed) => {
                if let (Some(declared), Some(actual)) = (segment, committed) {
                    if actual != declared {
                        // Server closed early without an error; the shrunk
                        // shard is on disk and the gap resurfaces on resume.
                        warn!(
                            worker_id = self.worker_id,
                            declared = %declared,
                            committed = %actual,
                            "segment committed with different bounds than requested"
                        );
                    }
                }
                SegmentOutcome::Done
            }
            Err(e) => SegmentOutcome::Failed(e.into()),
        }
    }

    /// Commits the current shard as part of a stop acknowledgment.
    ///
    /// A commit failure here means the shard state is *not* final, so the
    /// outcome degrades to an error instead of a clean stop.
    async fn commit_for_stop(&self, writer: ShardWriter) -> SegmentOutcome {
        let bytes = writer.bytes_written();
        match writer.commit().await {
            Ok(_) => {
                debug!(worker_id = self.worker_id, bytes, "stopped mid-segment");
                SegmentOutcome::Stopped
            }
            Err(e) => SegmentOutcome::Failed(e.into()),
        }
    }

    /// Commits received bytes on an error path; the commit itself is best
    /// effort because the original failure is what gets reported.
    async fn commit_best_effort(&self, writer: ShardWriter) {
        if let Err(e) = writer.commit().await {
            warn!(worker_id = self.worker_id, error = %e, "shard commit failed on error path");
        }
    }

    fn send_progress(&self, downloaded_this_run: u64) {
        self.send(WorkerEvent::Progress {
            worker_id: self.worker_id,
            total_downloaded: self.allocation.pre_downloaded + downloaded_this_run,
        });
    }

    fn send(&self, event: WorkerEvent) {
        // The receiver disappears when the run is torn down; a worker that
        // outlives it has nobody left to notify.
        let _ = self.events.send(event);
    }
}
