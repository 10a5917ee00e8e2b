use std::path::Path;
use std::sync::Arc;

use reqwest::StatusCode;
use tokio::fs::OpenOptions;
use tracing::debug;

use super::{ensure_complete, ensure_range_start, Transfer};
use crate::error::DownloadError;
use crate::http::ByteRange;
use crate::state::DownloadState;

/// Appends to whatever is already on disk, asking the server for the rest.
///
/// Every attempt re-reads the on-disk length, so retries and process
/// restarts both pick up where the file ends.
pub(super) async fn transfer(
    transfer: &Transfer,
    state: &mut Arc<DownloadState>,
    target: &Path,
) -> Result<(), DownloadError> {
    let connector = transfer.connector.as_ref();
    transfer
        .controller()
        .run(state, move |attempt| async move {
            let state = &attempt.state;
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(target)
                .await
                .map_err(|e| DownloadError::io(target, e))?;
            let on_disk = file
                .metadata()
                .await
                .map_err(|e| DownloadError::io(target, e))?
                .len();
            state.advance_count_to(on_disk);

            if let Some(length) = state.length() {
                if on_disk == length {
                    debug!(path = %target.display(), "already complete");
                    transfer.observer.progress(state);
                    return Ok(());
                }
                if on_disk > length {
                    return Err(DownloadError::LocalFileTooLarge {
                        path: target.to_path_buf(),
                        local: on_disk,
                        remote: length,
                    });
                }
            }

            let opened = connector
                .open(&attempt.client, state, Some(ByteRange::from(on_disk)))
                .await;
            let response = match opened {
                Ok(response) => response,
                // Length unknown up front; the server says we already hold it all.
                Err(DownloadError::RangeNotSatisfiable { total: Some(total), .. })
                    if on_disk > 0 && total == on_disk =>
                {
                    debug!(path = %target.display(), "server reports file complete");
                    transfer.observer.progress(state);
                    return Ok(());
                }
                Err(err) => return Err(err),
            };
            if on_disk > 0 && response.status() != StatusCode::PARTIAL_CONTENT {
                return Err(DownloadError::RangeNotHonored {
                    url: state.source().clone(),
                    status: response.status(),
                });
            }
            ensure_range_start(state, &response, on_disk)?;
            transfer.observer.downloading(state);
            debug!(url = %state.source(), offset = on_disk, "resuming ranged copy");

            let remaining = state.length().map(|length| length - on_disk);
            let mut position = on_disk;
            let written = transfer
                .copy_body(response, &mut file, target, remaining, |len| {
                    position += len;
                    state.advance_count_to(position);
                    transfer.observer.progress(state);
                })
                .await?;

            ensure_complete(state, on_disk + written, state.length())
        })
        .await
}
