//! CLI entry point for the shardload downloader.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use shardload_core::{FetchJob, Fetcher, JobEvent, paths, probe};
use tracing::{debug, info, warn};

mod cli;

use cli::Args;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Determine log level based on verbose/quiet flags
    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (warn)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "warn",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt().with_env_filter(filter).init();

    debug!(?args, "CLI arguments parsed");

    // Probe the URL to decide between segmented and single-stream mode.
    let (file_size, connections) = match probe::probe(&args.url).await {
        Ok(spec) if spec.segmentable() => (spec.file_size, usize::from(args.connections)),
        Ok(spec) => {
            if usize::from(args.connections) > 1 {
                warn!(
                    accepts_ranges = spec.accepts_ranges,
                    file_size = ?spec.file_size,
                    "server does not support segmented downloads; using a single connection"
                );
            }
            (None, 1)
        }
        Err(e) => {
            warn!(error = %e, "probe failed; using a single connection without resume");
            (None, 1)
        }
    };

    let save_as = args
        .output
        .clone()
        .unwrap_or_else(|| PathBuf::from(paths::suggest_file_name(&args.url)));

    let job = FetchJob::new(&args.url, file_size, &save_as, connections);
    let (fetcher, mut events) = Fetcher::new(job);

    // A leftover work directory for this output path means an interrupted
    // run; resume it instead of starting over under a disambiguated name.
    let leftover_work_dir = paths::work_dir_for(&save_as);
    if file_size.is_some() && leftover_work_dir.exists() && !save_as.exists() {
        info!(work_dir = %leftover_work_dir.display(), "resuming interrupted download");
        fetcher.resume_from(&leftover_work_dir, connections).await?;
    } else {
        fetcher.start(connections).await?;
    }

    info!(
        url = %args.url,
        save_as = %fetcher.save_as().display(),
        connections,
        file_size = ?file_size,
        "download started"
    );

    let bar = make_progress_bar(args.quiet, file_size);
    let mut ticker = tokio::time::interval(Duration::from_millis(200));
    let mut pending_error: Option<anyhow::Error> = None;
    let mut stop_requested = false;

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    JobEvent::Completed => {
                        bar.finish_and_clear();
                        if !args.quiet {
                            println!("saved {}", fetcher.save_as().display());
                        }
                        return Ok(());
                    }
                    JobEvent::Paused => {
                        bar.finish_and_clear();
                        if let Some(error) = pending_error {
                            return Err(error);
                        }
                        if !args.quiet {
                            println!(
                                "paused; run the same command again to resume {}",
                                fetcher.save_as().display()
                            );
                        }
                        return Ok(());
                    }
                    JobEvent::Cancelled => {
                        bar.finish_and_clear();
                        return pending_error.map_or(Ok(()), Err);
                    }
                    JobEvent::Error(e) => {
                        // First failure of the run: stop the job and report
                        // once everything has wound down.
                        warn!(error = %e, "download error; pausing");
                        if pending_error.is_none() {
                            pending_error = Some(e.into());
                            fetcher.stop();
                        }
                    }
                    JobEvent::SaveAsChanged(path) => {
                        info!(path = %path.display(), "output path changed to avoid overwrite");
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                if stop_requested {
                    // Second interrupt: give up waiting for acknowledgments.
                    bar.finish_and_clear();
                    anyhow::bail!("interrupted again before workers stopped");
                }
                stop_requested = true;
                info!("interrupt received; pausing download");
                fetcher.stop();
            }
            _ = ticker.tick() => {
                match fetcher.progress() {
                    Ok(snapshot) => bar.set_position(snapshot.total_downloaded),
                    Err(e) => {
                        // Consistency violation: stop rendering and pause.
                        warn!(error = %e, "progress reporting aborted");
                        if pending_error.is_none() {
                            pending_error = Some(e.into());
                            fetcher.stop();
                        }
                    }
                }
            }
        }
    }

    pending_error.map_or(Ok(()), Err)
}

/// Builds a byte progress bar for known sizes, a spinner otherwise.
fn make_progress_bar(quiet: bool, file_size: Option<u64>) -> ProgressBar {
    if quiet {
        return ProgressBar::hidden();
    }
    match file_size {
        Some(size) => {
            let bar = ProgressBar::new(size);
            bar.set_style(
                ProgressStyle::with_template(
                    "{bar:40} {bytes}/{total_bytes} ({bytes_per_sec}, {eta})",
                )
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
            );
            bar
        }
        None => {
            let bar = ProgressBar::new_spinner();
            bar.set_style(
                ProgressStyle::with_template("{spinner} {bytes} ({bytes_per_sec})")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner()),
            );
            bar.enable_steady_tick(Duration::from_millis(100));
            bar
        }
    }
}
