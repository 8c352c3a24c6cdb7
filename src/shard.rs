//! On-disk shard naming, recovery scan, and final merge.
//!
//! Every shard holds the bytes of one inclusive range of the target file and
//! is named `shard_<start>_<end>` inside the job's work directory. That
//! naming convention *is* the resume mechanism: a fresh run lists the
//! directory, parses the names back into segments, and allocates only the
//! complement.
//!
//! In-progress writes never use a final name. A worker writes to a `.part`
//! working file and commits it (a rename to the range actually received)
//! only once the byte count is known. A scan therefore never observes a
//! half-written shard as complete, and an interrupted write costs at most the
//! uncommitted tail of one segment.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, warn};

use crate::segment::Segment;

/// Filename prefix for committed shards.
pub const SHARD_PREFIX: &str = "shard";

/// Extension of in-progress working files; scans ignore them.
const WORKING_SUFFIX: &str = ".part";

/// Working name used while downloading a stream of unknown length.
///
/// Deliberately unparseable as a shard name; the file is committed to
/// `shard_0_<lastByte>` once the stream ends.
const UNSIZED_WORKING_NAME: &str = "shard_stream.part";

/// Errors from shard storage operations.
#[derive(Debug, Error)]
pub enum ShardError {
    /// Filesystem operation failed. Fatal to the affected worker.
    #[error("IO error at {path}: {source}")]
    Io {
        /// Path involved in the failed operation.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The scanned shard set leaves a gap before `file_size`.
    #[error("shards cover nothing at byte {expected_start} of {file_size}; refusing to merge")]
    CoverageGap {
        /// First byte not covered by any shard.
        expected_start: u64,
        /// Expected total size of the output file.
        file_size: u64,
    },

    /// A shard overlaps bytes already covered by an earlier shard.
    #[error("shard {segment} overlaps bytes below {expected_start}; refusing to merge")]
    Overlap {
        /// The offending shard.
        segment: Segment,
        /// First byte the shard was expected to start at.
        expected_start: u64,
    },

    /// A shard file's on-disk length does not match its name.
    #[error("shard {segment} holds {actual} bytes on disk, expected {expected}")]
    LengthMismatch {
        /// The shard whose contents are short or long.
        segment: Segment,
        /// Bytes the name declares.
        expected: u64,
        /// Bytes actually on disk.
        actual: u64,
    },
}

impl ShardError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Returns the committed path for a shard covering `segment`.
#[must_use]
pub fn shard_path(work_dir: &Path, segment: Segment) -> PathBuf {
    work_dir.join(format!("{SHARD_PREFIX}_{}_{}", segment.start, segment.end))
}

/// Parses a shard filename back into its segment.
///
/// Accepts exactly `shard_<start>_<end>` with decimal bounds and
/// `start <= end`; anything else (working files, foreign files) is `None`.
#[must_use]
pub fn parse_shard_name(name: &str) -> Option<Segment> {
    let mut pieces = name.split('_').filter(|p| !p.is_empty());
    if pieces.next() != Some(SHARD_PREFIX) {
        return None;
    }
    let start: u64 = pieces.next()?.parse().ok()?;
    let end: u64 = pieces.next()?.parse().ok()?;
    if pieces.next().is_some() {
        return None;
    }
    let segment = Segment::new(start, end);
    segment.is_valid().then_some(segment)
}

/// Lists the committed shards in a work directory, sorted ascending by start.
///
/// Unparseable names are skipped. A missing directory yields an empty list;
/// a job that has never run simply has nothing downloaded yet.
#[must_use]
pub fn scan_downloaded(work_dir: &Path) -> Vec<Segment> {
    let Ok(entries) = std::fs::read_dir(work_dir) else {
        return Vec::new();
    };
    let mut segments: Vec<Segment> = entries
        .filter_map(Result::ok)
        .filter_map(|entry| entry.file_name().to_str().and_then(parse_shard_name))
        .collect();
    segments.sort();
    segments
}

/// Writable handle for one in-progress shard.
///
/// Bytes go to a working file; [`commit`](ShardWriter::commit) renames it to
/// the range actually received, deletes it if nothing arrived, and is the
/// only way a shard gains a scannable name.
#[derive(Debug)]
pub struct ShardWriter {
    work_dir: PathBuf,
    declared: Option<Segment>,
    working_path: PathBuf,
    writer: BufWriter<File>,
    bytes_written: u64,
}

impl ShardWriter {
    /// Creates (or truncates) the working file for `segment`.
    ///
    /// Pass `None` for an unknown-length stream; the single sentinel working
    /// name is used and the commit names the shard from byte zero.
    ///
    /// # Errors
    ///
    /// Returns [`ShardError::Io`] when the work directory is not writable.
    pub async fn create(work_dir: &Path, segment: Option<Segment>) -> Result<Self, ShardError> {
        let working_path = match segment {
            Some(segment) => {
                let mut name = shard_path(work_dir, segment).into_os_string();
                name.push(WORKING_SUFFIX);
                PathBuf::from(name)
            }
            None => work_dir.join(UNSIZED_WORKING_NAME),
        };
        let file = File::create(&working_path)
            .await
            .map_err(|e| ShardError::io(&working_path, e))?;
        debug!(path = %working_path.display(), "opened shard working file");
        Ok(Self {
            work_dir: work_dir.to_path_buf(),
            declared: segment,
            working_path,
            writer: BufWriter::new(file),
            bytes_written: 0,
        })
    }

    /// Appends a chunk to the working file.
    ///
    /// # Errors
    ///
    /// Returns [`ShardError::Io`] on write failure.
    pub async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), ShardError> {
        self.writer
            .write_all(chunk)
            .await
            .map_err(|e| ShardError::io(&self.working_path, e))?;
        self.bytes_written += chunk.len() as u64;
        Ok(())
    }

    /// Bytes written so far.
    #[must_use]
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Flushes and commits the working file to its final shard name.
    ///
    /// - zero bytes received: the working file is deleted and `None` returned
    ///   (nothing worth resuming);
    /// - otherwise the file is renamed to `shard_<start>_<start+n-1>`, which
    ///   for a fully-received segment is exactly its declared name.
    ///
    /// Returns the committed segment, if any.
    ///
    /// # Errors
    ///
    /// Returns [`ShardError::Io`] on flush, delete, or rename failure.
    pub async fn commit(mut self) -> Result<Option<Segment>, ShardError> {
        self.writer
            .flush()
            .await
            .map_err(|e| ShardError::io(&self.working_path, e))?;
        // Close the handle before renaming; Windows refuses otherwise.
        drop(self.writer);

        if self.bytes_written == 0 {
            tokio::fs::remove_file(&self.working_path)
                .await
                .map_err(|e| ShardError::io(&self.working_path, e))?;
            debug!(path = %self.working_path.display(), "removed empty shard");
            return Ok(None);
        }

        let start = self.declared.map_or(0, |s| s.start);
        let committed = Segment::new(start, start + self.bytes_written - 1);
        let final_path = shard_path(&self.work_dir, committed);
        if final_path.exists() {
            // A stale shard with the same bounds loses to the fresh bytes.
            tokio::fs::remove_file(&final_path)
                .await
                .map_err(|e| ShardError::io(&final_path, e))?;
        }
        tokio::fs::rename(&self.working_path, &final_path)
            .await
            .map_err(|e| ShardError::io(&final_path, e))?;
        debug!(
            path = %final_path.display(),
            bytes = self.bytes_written,
            "committed shard"
        );
        Ok(Some(committed))
    }
}

/// Checks that `segments` (sorted ascending) form a gap-free,
/// non-overlapping cover of `[0, file_size - 1]`.
///
/// # Errors
///
/// Returns [`ShardError::CoverageGap`] or [`ShardError::Overlap`] describing
/// the first violation.
pub fn validate_cover(segments: &[Segment], file_size: u64) -> Result<(), ShardError> {
    let mut expected_start = 0u64;
    for segment in segments {
        if segment.start > expected_start {
            return Err(ShardError::CoverageGap {
                expected_start,
                file_size,
            });
        }
        if segment.start < expected_start {
            return Err(ShardError::Overlap {
                segment: *segment,
                expected_start,
            });
        }
        expected_start = segment.end + 1;
    }
    if expected_start != file_size {
        return Err(ShardError::CoverageGap {
            expected_start,
            file_size,
        });
    }
    Ok(())
}

/// Concatenates the committed shards into `output` and removes the work
/// directory.
///
/// The shard set is re-scanned, validated as an exact cover of
/// `[0, file_size - 1]`, and each file's on-disk length is checked against
/// its name before any byte is written to `output`.
///
/// # Errors
///
/// Returns a validation error ([`ShardError::CoverageGap`],
/// [`ShardError::Overlap`], [`ShardError::LengthMismatch`]) with the work
/// directory untouched, or [`ShardError::Io`] if a shard or the output file
/// cannot be opened or written.
pub async fn merge(work_dir: &Path, output: &Path, file_size: u64) -> Result<(), ShardError> {
    let segments = scan_downloaded(work_dir);
    validate_cover(&segments, file_size)?;
    for segment in &segments {
        let path = shard_path(work_dir, *segment);
        let actual = tokio::fs::metadata(&path)
            .await
            .map_err(|e| ShardError::io(&path, e))?
            .len();
        if actual != segment.len() {
            return Err(ShardError::LengthMismatch {
                segment: *segment,
                expected: segment.len(),
                actual,
            });
        }
    }

    let out_file = File::create(output)
        .await
        .map_err(|e| ShardError::io(output, e))?;
    let mut writer = BufWriter::new(out_file);
    for segment in &segments {
        let path = shard_path(work_dir, *segment);
        let mut shard = File::open(&path)
            .await
            .map_err(|e| ShardError::io(&path, e))?;
        tokio::io::copy(&mut shard, &mut writer)
            .await
            .map_err(|e| ShardError::io(&path, e))?;
    }
    writer
        .flush()
        .await
        .map_err(|e| ShardError::io(output, e))?;
    drop(writer);

    debug!(
        output = %output.display(),
        shards = segments.len(),
        bytes = file_size,
        "merged shards into output file"
    );
    remove_work_dir(work_dir);
    Ok(())
}

/// Removes the work directory and all shards in it. Missing directory is a
/// no-op; other failures are logged and swallowed (stray directories are
/// recoverable garbage, not corruption).
pub fn remove_work_dir(work_dir: &Path) {
    match std::fs::remove_dir_all(work_dir) {
        Ok(()) => debug!(path = %work_dir.display(), "removed work directory"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %work_dir.display(), error = %e, "failed to remove work directory"),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_shard_path_and_parse_round_trip() {
        let segment = Segment::new(333, 665);
        let path = shard_path(Path::new("/work"), segment);
        assert_eq!(path, PathBuf::from("/work/shard_333_665"));
        let name = path.file_name().unwrap().to_str().unwrap();
        assert_eq!(parse_shard_name(name), Some(segment));
    }

    #[test]
    fn test_parse_rejects_foreign_and_working_names() {
        assert_eq!(parse_shard_name("shard_0_99.part"), None);
        assert_eq!(parse_shard_name("shard_stream.part"), None);
        assert_eq!(parse_shard_name("notes.txt"), None);
        assert_eq!(parse_shard_name("shard_12"), None);
        assert_eq!(parse_shard_name("shard_12_34_56"), None);
        assert_eq!(parse_shard_name("other_12_34"), None);
        // Inverted bounds cannot name a real shard.
        assert_eq!(parse_shard_name("shard_34_12"), None);
    }

    #[test]
    fn test_scan_returns_sorted_segments_and_skips_garbage() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("shard_500_999"), vec![0u8; 500]).unwrap();
        std::fs::write(temp.path().join("shard_0_499"), vec![0u8; 500]).unwrap();
        std::fs::write(temp.path().join("shard_0_99.part"), b"partial").unwrap();
        std::fs::write(temp.path().join("README"), b"unrelated").unwrap();

        let segments = scan_downloaded(temp.path());
        assert_eq!(segments, vec![Segment::new(0, 499), Segment::new(500, 999)]);
    }

    #[test]
    fn test_scan_missing_directory_is_empty() {
        assert!(scan_downloaded(Path::new("/does/not/exist")).is_empty());
    }

    #[tokio::test]
    async fn test_writer_commits_full_segment_under_declared_name() {
        let temp = TempDir::new().unwrap();
        let segment = Segment::new(0, 9);
        let mut writer = ShardWriter::create(temp.path(), Some(segment)).await.unwrap();
        writer.write_chunk(b"0123456789").await.unwrap();

        let committed = writer.commit().await.unwrap();
        assert_eq!(committed, Some(segment));
        assert!(temp.path().join("shard_0_9").exists());
        assert!(!temp.path().join("shard_0_9.part").exists());
    }

    #[tokio::test]
    async fn test_writer_commits_short_segment_under_shrunk_name() {
        let temp = TempDir::new().unwrap();
        let mut writer = ShardWriter::create(temp.path(), Some(Segment::new(100, 199)))
            .await
            .unwrap();
        writer.write_chunk(&[1u8; 40]).await.unwrap();

        let committed = writer.commit().await.unwrap();
        assert_eq!(committed, Some(Segment::new(100, 139)));
        assert!(temp.path().join("shard_100_139").exists());
        assert!(!temp.path().join("shard_100_199").exists());
        assert!(!temp.path().join("shard_100_199.part").exists());
    }

    #[tokio::test]
    async fn test_writer_deletes_empty_shard_on_commit() {
        let temp = TempDir::new().unwrap();
        let writer = ShardWriter::create(temp.path(), Some(Segment::new(0, 99)))
            .await
            .unwrap();
        let committed = writer.commit().await.unwrap();
        assert_eq!(committed, None);
        assert!(std::fs::read_dir(temp.path()).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn test_unsized_writer_commits_from_byte_zero() {
        let temp = TempDir::new().unwrap();
        let mut writer = ShardWriter::create(temp.path(), None).await.unwrap();
        writer.write_chunk(&[7u8; 1234]).await.unwrap();

        let committed = writer.commit().await.unwrap();
        assert_eq!(committed, Some(Segment::new(0, 1233)));
        assert!(temp.path().join("shard_0_1233").exists());
    }

    #[tokio::test]
    async fn test_commit_replaces_stale_shard_with_same_bounds() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("shard_0_3"), b"old!").unwrap();

        let mut writer = ShardWriter::create(temp.path(), Some(Segment::new(0, 3)))
            .await
            .unwrap();
        writer.write_chunk(b"new!").await.unwrap();
        writer.commit().await.unwrap();

        assert_eq!(std::fs::read(temp.path().join("shard_0_3")).unwrap(), b"new!");
    }

    #[test]
    fn test_validate_cover_accepts_exact_cover() {
        let segments = [
            Segment::new(0, 332),
            Segment::new(333, 665),
            Segment::new(666, 999),
        ];
        assert!(validate_cover(&segments, 1000).is_ok());
    }

    #[test]
    fn test_validate_cover_rejects_gap_overlap_and_short_cover() {
        let gap = [Segment::new(0, 99), Segment::new(200, 999)];
        assert!(matches!(
            validate_cover(&gap, 1000),
            Err(ShardError::CoverageGap {
                expected_start: 100,
                ..
            })
        ));

        let overlap = [Segment::new(0, 499), Segment::new(400, 999)];
        assert!(matches!(
            validate_cover(&overlap, 1000),
            Err(ShardError::Overlap { .. })
        ));

        let short = [Segment::new(0, 899)];
        assert!(matches!(
            validate_cover(&short, 1000),
            Err(ShardError::CoverageGap {
                expected_start: 900,
                ..
            })
        ));

        assert!(matches!(
            validate_cover(&[], 1),
            Err(ShardError::CoverageGap { .. })
        ));
    }

    #[tokio::test]
    async fn test_merge_concatenates_in_order_and_removes_work_dir() {
        let temp = TempDir::new().unwrap();
        let work_dir = temp.path().join("job.shardload");
        std::fs::create_dir(&work_dir).unwrap();
        // Written out of order on purpose; merge sorts by start.
        std::fs::write(work_dir.join("shard_6_9"), b"6789").unwrap();
        std::fs::write(work_dir.join("shard_0_2"), b"012").unwrap();
        std::fs::write(work_dir.join("shard_3_5"), b"345").unwrap();

        let output = temp.path().join("out.bin");
        merge(&work_dir, &output, 10).await.unwrap();

        assert_eq!(std::fs::read(&output).unwrap(), b"0123456789");
        assert!(!work_dir.exists());
    }

    #[tokio::test]
    async fn test_merge_refuses_gapped_shard_set_and_keeps_shards() {
        let temp = TempDir::new().unwrap();
        let work_dir = temp.path().join("job.shardload");
        std::fs::create_dir(&work_dir).unwrap();
        std::fs::write(work_dir.join("shard_0_2"), b"012").unwrap();
        std::fs::write(work_dir.join("shard_6_9"), b"6789").unwrap();

        let output = temp.path().join("out.bin");
        let err = merge(&work_dir, &output, 10).await.unwrap_err();
        assert!(matches!(err, ShardError::CoverageGap { expected_start: 3, .. }));
        assert!(work_dir.exists(), "failed merge must preserve shards");
        assert!(!output.exists());
    }

    #[tokio::test]
    async fn test_merge_refuses_shard_with_wrong_length() {
        let temp = TempDir::new().unwrap();
        let work_dir = temp.path().join("job.shardload");
        std::fs::create_dir(&work_dir).unwrap();
        std::fs::write(work_dir.join("shard_0_9"), b"only5").unwrap();

        let err = merge(&work_dir, &temp.path().join("out.bin"), 10)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ShardError::LengthMismatch {
                expected: 10,
                actual: 5,
                ..
            }
        ));
        assert!(work_dir.exists());
    }

    #[test]
    fn test_remove_work_dir_tolerates_missing_directory() {
        remove_work_dir(Path::new("/does/not/exist/anywhere"));
    }
}
