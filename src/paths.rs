//! Output-path disambiguation and work-directory derivation.
//!
//! The work directory for a job is derived deterministically from its output
//! path, so a paused download can be found again from the job record alone.
//! When the chosen output path (or a leftover work directory for it) already
//! exists, a `" (1)"`-style suffix is inserted before the extension.

use std::path::{Path, PathBuf};

use url::Url;

/// Suffix appended to the output path to form the per-job work directory.
pub const WORK_DIR_SUFFIX: &str = ".shardload";

/// Returns the work directory for the given output path.
#[must_use]
pub fn work_dir_for(save_as: &Path) -> PathBuf {
    let mut dir = save_as.as_os_str().to_owned();
    dir.push(WORK_DIR_SUFFIX);
    PathBuf::from(dir)
}

/// Picks an output path that collides with neither an existing file nor an
/// existing work directory.
///
/// Tries `name.ext`, then `name (1).ext`, `name (2).ext`, … . A candidate is
/// rejected when the file itself exists (never overwrite a finished download)
/// or when its work directory exists (another job is already downloading to
/// that name). Returns the chosen path and whether it differs from the input.
#[must_use]
pub fn resolve_output_path(save_as: &Path) -> (PathBuf, bool) {
    if !save_as.exists() && !work_dir_for(save_as).exists() {
        return (save_as.to_path_buf(), false);
    }

    let dir = save_as.parent().map(Path::to_path_buf).unwrap_or_default();
    let stem = save_as
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "download".to_string());
    let ext = save_as
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();

    let mut i = 1u32;
    loop {
        let candidate = dir.join(format!("{stem} ({i}){ext}"));
        if !candidate.exists() && !work_dir_for(&candidate).exists() {
            return (candidate, true);
        }
        i += 1;
    }
}

/// Suggests an output filename from the last path segment of a URL.
///
/// Falls back to the host name, then to `"download"` for pathless URLs.
#[must_use]
pub fn suggest_file_name(url: &str) -> String {
    let Ok(parsed) = Url::parse(url) else {
        return "download".to_string();
    };
    let from_path = parsed
        .path_segments()
        .and_then(|mut segments| segments.next_back().map(ToString::to_string))
        .filter(|name| !name.is_empty());
    if let Some(name) = from_path {
        return name;
    }
    parsed
        .host_str()
        .map_or_else(|| "download".to_string(), ToString::to_string)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_work_dir_is_save_as_plus_suffix() {
        let dir = work_dir_for(Path::new("/downloads/movie.mkv"));
        assert_eq!(dir, PathBuf::from("/downloads/movie.mkv.shardload"));
    }

    #[test]
    fn test_resolve_output_path_free_path_is_unchanged() {
        let temp = TempDir::new().unwrap();
        let target = temp.path().join("file.bin");
        let (resolved, changed) = resolve_output_path(&target);
        assert_eq!(resolved, target);
        assert!(!changed);
    }

    #[test]
    fn test_resolve_output_path_appends_suffix_when_file_exists() {
        let temp = TempDir::new().unwrap();
        let target = temp.path().join("file.bin");
        std::fs::write(&target, b"existing").unwrap();

        let (resolved, changed) = resolve_output_path(&target);
        assert!(changed);
        assert_eq!(resolved, temp.path().join("file (1).bin"));
    }

    #[test]
    fn test_resolve_output_path_counts_past_existing_suffixes() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("file.bin"), b"a").unwrap();
        std::fs::write(temp.path().join("file (1).bin"), b"b").unwrap();

        let (resolved, changed) = resolve_output_path(&temp.path().join("file.bin"));
        assert!(changed);
        assert_eq!(resolved, temp.path().join("file (2).bin"));
    }

    #[test]
    fn test_resolve_output_path_skips_candidate_with_live_work_dir() {
        let temp = TempDir::new().unwrap();
        // No file, but a work directory from an in-progress job.
        std::fs::create_dir(temp.path().join("file.bin.shardload")).unwrap();

        let (resolved, changed) = resolve_output_path(&temp.path().join("file.bin"));
        assert!(changed);
        assert_eq!(resolved, temp.path().join("file (1).bin"));
    }

    #[test]
    fn test_resolve_output_path_without_extension() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("README"), b"x").unwrap();

        let (resolved, _) = resolve_output_path(&temp.path().join("README"));
        assert_eq!(resolved, temp.path().join("README (1)"));
    }

    #[test]
    fn test_suggest_file_name_from_url_path() {
        assert_eq!(
            suggest_file_name("https://example.com/files/archive.tar.gz"),
            "archive.tar.gz"
        );
    }

    #[test]
    fn test_suggest_file_name_falls_back_to_host() {
        assert_eq!(suggest_file_name("https://example.com/"), "example.com");
    }

    #[test]
    fn test_suggest_file_name_invalid_url() {
        assert_eq!(suggest_file_name("not a url"), "download");
    }
}
