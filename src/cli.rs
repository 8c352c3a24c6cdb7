//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::Parser;

/// Default number of connections for segmentable downloads.
pub const DEFAULT_CONNECTIONS: usize = 4;

/// Segmented, resumable file downloader.
///
/// Splits a download across concurrent byte-range connections, keeps partial
/// progress on disk, and resumes an interrupted download of the same output
/// path from where it stopped.
#[derive(Parser, Debug)]
#[command(name = "shardload")]
#[command(author, version, about)]
pub struct Args {
    /// URL to download
    pub url: String,

    /// Output file path (defaults to the URL's filename in the current directory)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Number of concurrent connections (1-64); forced to 1 when the server
    /// does not support byte ranges
    #[arg(short = 'n', long, default_value_t = DEFAULT_CONNECTIONS as u8, value_parser = clap::value_parser!(u8).range(1..=64))]
    pub connections: u8,

    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_minimal_args_parse_successfully() {
        let args = Args::try_parse_from(["shardload", "https://example.com/f.bin"]).unwrap();
        assert_eq!(args.url, "https://example.com/f.bin");
        assert!(args.output.is_none());
        assert_eq!(args.connections, DEFAULT_CONNECTIONS as u8);
        assert_eq!(args.verbose, 0);
        assert!(!args.quiet);
    }

    #[test]
    fn test_cli_url_is_required() {
        assert!(Args::try_parse_from(["shardload"]).is_err());
    }

    #[test]
    fn test_cli_connections_range_is_enforced() {
        assert!(Args::try_parse_from(["shardload", "-n", "0", "https://e.com/f"]).is_err());
        assert!(Args::try_parse_from(["shardload", "-n", "65", "https://e.com/f"]).is_err());
        let args = Args::try_parse_from(["shardload", "-n", "8", "https://e.com/f"]).unwrap();
        assert_eq!(args.connections, 8);
    }

    #[test]
    fn test_cli_verbose_flag_increments_count() {
        let args = Args::try_parse_from(["shardload", "-vv", "https://e.com/f"]).unwrap();
        assert_eq!(args.verbose, 2);
    }

    #[test]
    fn test_cli_output_flag() {
        let args =
            Args::try_parse_from(["shardload", "-o", "/tmp/out.bin", "https://e.com/f"]).unwrap();
        assert_eq!(args.output, Some(PathBuf::from("/tmp/out.bin")));
    }
}
