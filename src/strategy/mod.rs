//! Transfer strategies: one connection from the start, one resumable ranged
//! connection, or several concurrent ranged connections.

mod multipart;
mod ranged;
mod single;

use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Arc;

use futures::StreamExt;
use reqwest::{Response, StatusCode};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;

use crate::error::DownloadError;
use crate::http::{Connector, ContentRange};
use crate::observer::DownloadObserver;
use crate::retry::{RetryController, RetryPolicy};
use crate::state::DownloadState;
use crate::throttle::Throttle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Whole body over one connection; a retry starts again at byte 0.
    Single,
    /// One connection resuming from the on-disk length.
    Ranged,
    /// Concurrent ranged connections, one per part.
    Multipart,
}

impl Strategy {
    pub fn select(state: &DownloadState) -> Self {
        if state.is_multipart() {
            Strategy::Multipart
        } else if state.supports_range() {
            Strategy::Ranged
        } else {
            Strategy::Single
        }
    }

    pub(crate) async fn run(
        self,
        transfer: &Transfer,
        state: &mut Arc<DownloadState>,
        target: &Path,
    ) -> Result<(), DownloadError> {
        match self {
            Strategy::Single => single::transfer(transfer, state, target).await,
            Strategy::Ranged => ranged::transfer(transfer, state, target).await,
            Strategy::Multipart => multipart::transfer(transfer, state, target).await,
        }
    }
}

/// Everything a strategy needs for one download. Cheap to clone so
/// multi-part workers can own a copy.
#[derive(Clone)]
pub(crate) struct Transfer {
    pub connector: Arc<Connector>,
    pub policy: RetryPolicy,
    pub cancel: CancellationToken,
    pub observer: Arc<dyn DownloadObserver>,
    pub throttle: Option<Arc<Throttle>>,
    pub chunk_size: NonZeroUsize,
    pub part_count: NonZeroUsize,
}

impl Transfer {
    pub fn controller(&self) -> RetryController<'_> {
        RetryController::new(
            &self.connector,
            &self.policy,
            &self.cancel,
            self.observer.as_ref(),
        )
    }

    /// Copies the response body into `file` in `chunk_size` reads, stopping
    /// after `limit` bytes when given. The cancellation token is polled
    /// before every read; `on_chunk` runs after every flushed write.
    pub async fn copy_body(
        &self,
        response: Response,
        file: &mut File,
        path: &Path,
        limit: Option<u64>,
        mut on_chunk: impl FnMut(u64),
    ) -> Result<u64, DownloadError> {
        let url = response.url().clone();
        let read_timeout = self.connector.read_timeout();
        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(std::io::Error::other));
        let mut reader = StreamReader::new(Box::pin(stream));
        let mut buf = vec![0u8; self.chunk_size.get()];
        let mut copied = 0u64;

        loop {
            if self.cancel.is_cancelled() {
                return Err(DownloadError::Cancelled);
            }

            let want = match limit {
                Some(limit) => (limit - copied).min(buf.len() as u64) as usize,
                None => buf.len(),
            };
            if want == 0 {
                break;
            }

            let read = tokio::time::timeout(read_timeout, reader.read(&mut buf[..want]))
                .await
                .map_err(|_| DownloadError::Timeout { url: url.clone() })?
                .map_err(|source| DownloadError::Stream {
                    url: url.clone(),
                    source,
                })?;
            if read == 0 {
                break;
            }

            if let Some(throttle) = &self.throttle {
                throttle.consume(read).await;
            }

            file.write_all(&buf[..read])
                .await
                .map_err(|e| DownloadError::io(path, e))?;
            file.flush().await.map_err(|e| DownloadError::io(path, e))?;

            copied += read as u64;
            on_chunk(read as u64);
        }

        Ok(copied)
    }
}

/// Fails with [`DownloadError::Truncated`] when fewer than `expected` bytes
/// landed.
fn ensure_complete(state: &DownloadState, received: u64, expected: Option<u64>) -> Result<(), DownloadError> {
    match expected {
        Some(expected) if received < expected => Err(DownloadError::Truncated {
            url: state.source().clone(),
            received,
            expected,
        }),
        _ => Ok(()),
    }
}

/// Fails with [`DownloadError::RangeMismatch`] when a 206 answer covers a
/// range that does not start at `expected`. A missing `Content-Range` is
/// accepted.
fn ensure_range_start(state: &DownloadState, response: &Response, expected: u64) -> Result<(), DownloadError> {
    if response.status() != StatusCode::PARTIAL_CONTENT {
        return Ok(());
    }
    match ContentRange::of(response).and_then(|range| range.start) {
        Some(actual) if actual != expected => Err(DownloadError::RangeMismatch {
            url: state.source().clone(),
            expected,
            actual,
        }),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use url::Url;

    use super::*;

    fn state() -> DownloadState {
        DownloadState::new(Url::parse("http://example.com/x").unwrap())
    }

    #[test]
    fn selection_follows_capabilities() {
        assert_eq!(Strategy::select(&state()), Strategy::Single);

        let ranged = state().with_range_support(true);
        assert_eq!(Strategy::select(&ranged), Strategy::Ranged);

        let unknown_length = state().with_range_support(true).with_multipart(true);
        assert_eq!(Strategy::select(&unknown_length), Strategy::Ranged);

        let multipart = state()
            .with_length(Some(10))
            .with_range_support(true)
            .with_multipart(true);
        assert_eq!(Strategy::select(&multipart), Strategy::Multipart);
    }

    #[test]
    fn short_bodies_are_truncation_errors() {
        let s = state();
        assert!(ensure_complete(&s, 10, Some(10)).is_ok());
        assert!(ensure_complete(&s, 10, None).is_ok());
        assert!(matches!(
            ensure_complete(&s, 4, Some(10)),
            Err(DownloadError::Truncated { received: 4, expected: 10, .. })
        ));
    }
}
