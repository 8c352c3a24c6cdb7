//! Pre-download probe for size and range support.
//!
//! One HEAD request answers the two questions that decide how a job runs:
//! how big is the file (`Content-Length`), and will the server honor byte
//! ranges (`Accept-Ranges: bytes`). A URL that answers neither is still
//! downloadable, but only as a single-connection, restart-only job.

use reqwest::header::{ACCEPT_RANGES, CONTENT_LENGTH};
use tracing::debug;

use crate::fetch::{FetchError, build_client};

/// What a server told us about a URL before downloading it.
#[derive(Debug, Clone)]
pub struct FileSpec {
    /// Probed URL.
    pub url: String,
    /// Declared size, when the server sent a parseable `Content-Length`.
    pub file_size: Option<u64>,
    /// Whether the server advertised `Accept-Ranges: bytes`.
    pub accepts_ranges: bool,
}

impl FileSpec {
    /// Whether the download can be split across multiple connections and
    /// resumed mid-way.
    #[must_use]
    pub fn segmentable(&self) -> bool {
        self.file_size.is_some() && self.accepts_ranges
    }
}

/// Issues a HEAD request and reads size and range support from the headers.
///
/// # Errors
///
/// Returns [`FetchError::Network`] on transport failure and
/// [`FetchError::HttpStatus`] for a non-success response (including servers
/// that reject HEAD outright); callers typically fall back to
/// single-connection unknown-size mode in that case.
pub async fn probe(url: &str) -> Result<FileSpec, FetchError> {
    let client = build_client().map_err(|e| FetchError::network(url, e))?;
    let response = client
        .head(url)
        .send()
        .await
        .map_err(|e| FetchError::network(url, e))?;

    let status = response.status();
    if !status.is_success() {
        return Err(FetchError::http_status(url, status.as_u16()));
    }

    let file_size = response
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    let accepts_ranges = response
        .headers()
        .get(ACCEPT_RANGES)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("bytes"));

    debug!(url, ?file_size, accepts_ranges, "probe complete");
    Ok(FileSpec {
        url: url.to_string(),
        file_size,
        accepts_ranges,
    })
}
