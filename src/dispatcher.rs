use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;
use url::Url;

use crate::config::DownloadConfig;
use crate::error::{DownloadError, DownloadOutcome};
use crate::http::Connector;
use crate::observer::DownloadObserver;
use crate::probe::{probe, ProbeRequest};
use crate::retry::{RetryController, RetryPolicy};
use crate::state::{DownloadState, ProxyHandle};
use crate::strategy::{Strategy, Transfer};
use crate::throttle::Throttle;

/// Picks a transfer strategy from a probed [`DownloadState`] and drives it
/// to completion, cancellation or failure.
pub struct Dispatcher {
    connector: Arc<Connector>,
    policy: RetryPolicy,
    throttle: Option<Arc<Throttle>>,
    chunk_size: NonZeroUsize,
    part_count: NonZeroUsize,
    multipart_threshold: u64,
}

impl Dispatcher {
    pub fn new(config: &DownloadConfig) -> Self {
        Self {
            connector: Arc::new(Connector::new(config)),
            policy: config.retry_policy(),
            throttle: config.rate_limit.map(|limit| Arc::new(Throttle::new(limit))),
            chunk_size: config.chunk_size,
            part_count: config.parts,
            multipart_threshold: config.multipart_threshold,
        }
    }

    /// Runs the metadata probe for `source`, following redirects.
    pub async fn probe(
        &self,
        source: Url,
        referer: Option<Url>,
        proxy: ProxyHandle,
        cancel: &CancellationToken,
        observer: &dyn DownloadObserver,
    ) -> Result<Arc<DownloadState>, DownloadError> {
        let controller = RetryController::new(&self.connector, &self.policy, cancel, observer);
        probe(
            &controller,
            ProbeRequest {
                source,
                referer,
                proxy,
                multipart_threshold: self.multipart_threshold,
            },
        )
        .await
    }

    /// Transfers `state.source()` into `target`.
    ///
    /// The strategy is chosen once from the capability flags. On return
    /// `state` is the last state used, so it reflects followed redirects.
    /// Partial files stay on disk on cancellation and on failure; calling
    /// again with the same state resumes.
    pub async fn download(
        &self,
        state: &mut Arc<DownloadState>,
        target: &Path,
        cancel: CancellationToken,
        observer: Arc<dyn DownloadObserver>,
    ) -> Result<DownloadOutcome, DownloadError> {
        let strategy = Strategy::select(state);
        info!(
            url = %state.source(),
            path = %target.display(),
            ?strategy,
            length = ?state.length(),
            "starting transfer"
        );

        let transfer = Transfer {
            connector: Arc::clone(&self.connector),
            policy: self.policy.clone(),
            cancel,
            observer,
            throttle: self.throttle.clone(),
            chunk_size: self.chunk_size,
            part_count: self.part_count,
        };

        match strategy.run(&transfer, state, target).await {
            Ok(()) => {
                info!(url = %state.source(), bytes = state.count(), "transfer complete");
                Ok(DownloadOutcome::Completed)
            }
            Err(DownloadError::Cancelled) => {
                info!(url = %state.source(), bytes = state.count(), "transfer cancelled");
                Ok(DownloadOutcome::Cancelled)
            }
            Err(err) => Err(err),
        }
    }
}
