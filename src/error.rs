use std::path::PathBuf;

use reqwest::StatusCode;
use thiserror::Error;
use url::Url;

/// How the retry loop treats a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Worth another attempt after a backoff delay.
    Transient,
    /// Not an error: the resource lives somewhere else.
    Redirect,
    /// The caller asked us to stop.
    Cancelled,
    /// No further attempts.
    Fatal,
}

/// Errors raised while probing or transferring a download.
#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: Url,
        #[source]
        source: reqwest::Error,
    },

    #[error("timed out waiting for {url}")]
    Timeout { url: Url },

    #[error("body stream from {url} failed: {source}")]
    Stream {
        url: Url,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("stream from {url} ended at byte {received}, expected {expected}")]
    Truncated { url: Url, received: u64, expected: u64 },

    #[error("{url} moved to {location}")]
    Moved { url: Url, location: Url },

    #[error("download cancelled")]
    Cancelled,

    #[error("server returned HTTP {status} for {url}")]
    HttpStatus { url: Url, status: StatusCode },

    #[error("redirect from {url} has no usable Location header")]
    BadRedirect { url: Url },

    #[error("server ignored the range request for {url} (HTTP {status})")]
    RangeNotHonored { url: Url, status: StatusCode },

    #[error("range requested from {url} is not satisfiable (remote length {total:?})")]
    RangeNotSatisfiable { url: Url, total: Option<u64> },

    #[error("{url} answered a range starting at {actual}, expected {expected}")]
    RangeMismatch { url: Url, expected: u64, actual: u64 },

    #[error("local file {} holds {local} bytes but the remote has only {remote}", path.display())]
    LocalFileTooLarge { path: PathBuf, local: u64, remote: u64 },

    #[error("content length of {url} is unknown")]
    UnknownLength { url: Url },

    #[error("giving up after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<DownloadError>,
    },

    #[error("more than {limit} redirects starting at {url}")]
    TooManyRedirects { url: Url, limit: u32 },

    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("part {index} failed: {source}")]
    PartFailed {
        index: usize,
        #[source]
        source: Box<DownloadError>,
    },

    #[error("download worker panicked: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

impl DownloadError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Request { .. }
            | Self::Timeout { .. }
            | Self::Stream { .. }
            | Self::Io { .. }
            | Self::Truncated { .. } => FailureKind::Transient,
            Self::Moved { .. } => FailureKind::Redirect,
            Self::Cancelled => FailureKind::Cancelled,
            _ => FailureKind::Fatal,
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Maps a transport error from `send()`; builder errors never heal on retry.
    pub(crate) fn request(url: &Url, source: reqwest::Error) -> Self {
        if source.is_builder() {
            Self::Client(source)
        } else if source.is_timeout() {
            Self::Timeout { url: url.clone() }
        } else {
            Self::Request {
                url: url.clone(),
                source,
            }
        }
    }
}

/// Terminal result of a transfer that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadOutcome {
    Completed,
    Cancelled,
}
