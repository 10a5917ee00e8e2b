use std::path::Path;
use std::sync::Arc;

use tokio::fs::File;
use tracing::debug;

use super::{ensure_complete, Transfer};
use crate::error::DownloadError;
use crate::state::DownloadState;

/// Streams the whole body over one connection into a truncated file.
///
/// A transient failure restarts the copy from byte 0. `count` is raised to
/// the write position, never lowered, so a restart stays silent until it
/// passes the previous high-water mark.
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
            let response = connector.open(&attempt.client, state, None).await?;
            transfer.observer.downloading(state);

            let mut file = File::create(target)
                .await
                .map_err(|e| DownloadError::io(target, e))?;
            debug!(url = %state.source(), path = %target.display(), "single-stream copy");

            let mut position = 0u64;
            let written = transfer
                .copy_body(response, &mut file, target, state.length(), |len| {
                    position += len;
                    state.advance_count_to(position);
                    transfer.observer.progress(state);
                })
                .await?;

            ensure_complete(state, written, state.length())
        })
        .await
}
