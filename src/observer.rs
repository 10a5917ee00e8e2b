use std::time::Duration;

use url::Url;

use crate::error::DownloadError;
use crate::state::DownloadState;

/// Receives progress and retry notifications.
///
/// Multi-part transfers call these methods concurrently from every worker,
/// hence the `Send + Sync` bound. Implementations must not block for long:
/// they run inline with the copy loop.
pub trait DownloadObserver: Send + Sync {
    /// A connection is open and bytes are about to flow.
    fn downloading(&self, _state: &DownloadState) {}

    /// Called after every chunk write; `state.count()` is already updated.
    fn progress(&self, _state: &DownloadState) {}

    /// A transient failure happened; the next attempt starts after `delay`.
    fn retrying(&self, _attempt: u32, _delay: Duration, _cause: &DownloadError) {}

    fn moved(&self, _from: &Url, _to: &Url) {}
}

impl DownloadObserver for () {}
