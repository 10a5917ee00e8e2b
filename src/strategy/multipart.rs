use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use reqwest::StatusCode;
use tokio::fs::OpenOptions;
use tokio::io::AsyncSeekExt;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use super::{ensure_complete, ensure_range_start, Transfer};
use crate::error::DownloadError;
use crate::http::ByteRange;
use crate::state::{split_parts, DownloadState, PartState};

/// Downloads every unfinished part concurrently into a pre-allocated file.
///
/// Each worker owns its byte region and its own file handle, so the only
/// shared mutable datum is the `count` counter. A worker retries its own
/// part through the retry loop; a fatal part failure stops the siblings and
/// fails the transfer, leaving finished parts marked `Done` for the next
/// attempt. Redirects followed by a worker are written back to `state`.
pub(super) async fn transfer(
    transfer: &Transfer,
    state: &mut Arc<DownloadState>,
    target: &Path,
) -> Result<(), DownloadError> {
    let length = state.length().ok_or_else(|| DownloadError::UnknownLength {
        url: state.source().clone(),
    })?;
    // Relocated states share this progress record, so `parts` stays valid
    // while `state` is swapped below.
    let origin = Arc::clone(state);
    let part_count = transfer.part_count;
    let parts = origin.init_parts(|| split_parts(length, part_count));

    preallocate(target, length).await?;

    // Siblings stop through this child token when one part fails for good;
    // cancelling the parent still reaches every worker.
    let stop = transfer.cancel.child_token();
    let worker = Transfer {
        cancel: stop.clone(),
        ..transfer.clone()
    };

    let mut workers = JoinSet::new();
    for part in parts.iter().filter(|part| part.state() != PartState::Done) {
        let index = part.index();
        let worker = worker.clone();
        let state = Arc::clone(state);
        let target = target.to_path_buf();
        workers.spawn(async move {
            let (last, result) = download_part(worker, state, index, target).await;
            (index, last, result)
        });
    }
    info!(
        url = %state.source(),
        parts = parts.len(),
        pending = workers.len(),
        "multi-part transfer started"
    );

    let mut failure = None;
    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok((index, last, result)) => {
                if last.source() != state.source() {
                    *state = last;
                }
                match result {
                    Ok(()) | Err(DownloadError::Cancelled) => {}
                    Err(err) => {
                        error!(part = index, error = %err, "part failed");
                        stop.cancel();
                        failure.get_or_insert(DownloadError::PartFailed {
                            index,
                            source: Box::new(err),
                        });
                    }
                }
            }
            Err(err) => {
                error!(error = %err, "part worker panicked");
                stop.cancel();
                failure.get_or_insert(DownloadError::Worker(err));
            }
        }
    }

    // Only a panicked worker can leave its part mid-flight.
    for part in parts.iter().filter(|part| part.state() == PartState::InProgress) {
        part.set_state(PartState::Failed);
    }

    if let Some(err) = failure {
        return Err(err);
    }
    if parts.iter().any(|part| part.state() != PartState::Done) {
        return Err(DownloadError::Cancelled);
    }
    Ok(())
}

/// Sizes the target to its final length up front. Existing bytes are kept.
async fn preallocate(target: &Path, length: u64) -> Result<(), DownloadError> {
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(target)
        .await
        .map_err(|e| DownloadError::io(target, e))?;
    let current = file
        .metadata()
        .await
        .map_err(|e| DownloadError::io(target, e))?
        .len();
    if current != length {
        file.set_len(length)
            .await
            .map_err(|e| DownloadError::io(target, e))?;
    }
    Ok(())
}

/// Fetches one part, returning the last state used next to the result.
async fn download_part(
    transfer: Transfer,
    mut state: Arc<DownloadState>,
    index: usize,
    target: PathBuf,
) -> (Arc<DownloadState>, Result<(), DownloadError>) {
    let connector = transfer.connector.as_ref();
    let shared = &transfer;
    let path = target.as_path();

    let result = transfer
        .controller()
        .run(&mut state, move |attempt| async move {
            let state = &attempt.state;
            let part = &state.parts()[index];
            part.set_state(PartState::InProgress);

            let start = part.position();
            let end = part.end();
            if start >= end {
                return Ok(());
            }

            let response = connector
                .open(&attempt.client, state, Some(ByteRange::bounded(start, end - 1)))
                .await?;
            if response.status() != StatusCode::PARTIAL_CONTENT {
                return Err(DownloadError::RangeNotHonored {
                    url: state.source().clone(),
                    status: response.status(),
                });
            }
            ensure_range_start(state, &response, start)?;
            shared.observer.downloading(state);
            debug!(part = index, start, end, attempt = attempt.number, "part request open");

            let mut file = OpenOptions::new()
                .write(true)
                .open(path)
                .await
                .map_err(|e| DownloadError::io(path, e))?;
            file.seek(SeekFrom::Start(start))
                .await
                .map_err(|e| DownloadError::io(path, e))?;

            let written = shared
                .copy_body(response, &mut file, path, Some(end - start), |len| {
                    part.add_downloaded(len);
                    state.add_count(len);
                    shared.observer.progress(state);
                })
                .await?;

            ensure_complete(state, start + written, Some(end))
        })
        .await;

    let part = &state.parts()[index];
    part.set_state(match &result {
        Ok(()) => PartState::Done,
        Err(DownloadError::Cancelled) => PartState::Pending,
        Err(_) => PartState::Failed,
    });
    (state, result)
}
