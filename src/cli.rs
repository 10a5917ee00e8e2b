use std::num::{NonZeroU32, NonZeroUsize};
use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use url::Url;

use segdl::{DownloadConfig, ProxyConfig};

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum VerifyMode {
    /// Verify only when a hash is provided.
    Auto,
    /// Every download must come with a hash.
    On,
    Off,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Single URL to download (if provided, tasks-file is ignored)
    #[arg(index = 1)]
    pub url: Option<Url>,

    /// File with one `url` or `url|sha256` per line
    #[arg(short = 't', long = "tasks-file", default_value = "download.txt")]
    pub tasks_file: PathBuf,

    /// Directory to save downloaded files
    #[arg(short = 'd', long = "download-dir", default_value = "downloads")]
    pub download_dir: PathBuf,

    /// Exact output file for a single URL; re-running with the same path resumes
    #[arg(short = 'o', long, requires = "url")]
    pub output: Option<PathBuf>,

    /// JSON file with download settings; flags below override it
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Maximum number of concurrent downloads (defaults to number of logical CPUs)
    #[arg(short = 'c', long)]
    pub concurrency: Option<usize>,

    /// Global rate limit in bytes per second (e.g., 1048576 for 1MB/s)
    #[arg(short = 'r', long)]
    pub rate_limit: Option<NonZeroU32>,

    /// Number of parts per file (segmented download)
    #[arg(short = 's', long)]
    pub split: Option<NonZeroUsize>,

    /// Attempts per request before giving up
    #[arg(long)]
    pub retries: Option<u32>,

    /// Connect timeout in seconds
    #[arg(long)]
    pub connect_timeout: Option<u64>,

    /// Read timeout in seconds, applied to every body read
    #[arg(long)]
    pub read_timeout: Option<u64>,

    /// Proxy for all requests, e.g. http://127.0.0.1:8080
    #[arg(long)]
    pub proxy: Option<Url>,

    #[arg(long, requires = "proxy")]
    pub proxy_user: Option<String>,

    #[arg(long, requires = "proxy_user")]
    pub proxy_password: Option<String>,

    /// Referer header sent with every request
    #[arg(long)]
    pub referer: Option<Url>,

    /// Expected SHA-256 of a single URL download
    #[arg(long, requires = "url")]
    pub sha256: Option<String>,

    /// Hash verification: auto (only when hash provided), on (require hash), off (skip)
    #[arg(long = "verify-hash", value_enum, default_value = "auto")]
    pub verify_hash: VerifyMode,

    /// More log output (-v info, -vv debug)
    #[arg(short = 'v', long, action = clap::ArgAction::Count, conflicts_with = "quiet")]
    pub verbose: u8,

    /// Errors only
    #[arg(short = 'q', long)]
    pub quiet: bool,
}

impl Args {
    pub fn log_level(&self) -> &'static str {
        if self.quiet {
            return "error";
        }
        match self.verbose {
            0 => "warn",
            1 => "info",
            _ => "debug",
        }
    }

    /// Applies command-line overrides on top of the file or default settings.
    pub fn apply_to(&self, config: &mut DownloadConfig) {
        if let Some(split) = self.split {
            config.parts = split;
        }
        if let Some(limit) = self.rate_limit {
            config.rate_limit = Some(limit);
        }
        if let Some(retries) = self.retries {
            config.max_attempts = retries.max(1);
        }
        if let Some(secs) = self.connect_timeout {
            config.connect_timeout_secs = secs;
        }
        if let Some(secs) = self.read_timeout {
            config.read_timeout_secs = secs;
        }
    }

    pub fn proxy_config(&self) -> Option<ProxyConfig> {
        self.proxy.clone().map(|url| ProxyConfig {
            url,
            username: self.proxy_user.clone(),
            password: self.proxy_password.clone(),
        })
    }
}
