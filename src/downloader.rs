use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use indicatif::{HumanBytes, MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use tokio::task::JoinHandle;
use tracing::info;
use url::Url;

use segdl::hashing::verify_hash;
use segdl::utils::resolve_target;
use segdl::{
    CancellationToken, Dispatcher, DownloadConfig, DownloadError, DownloadObserver,
    DownloadOutcome, DownloadState, ProxyHandle,
};

use crate::cli::VerifyMode;

#[derive(Debug, Clone)]
pub struct DownloadItem {
    pub url: Url,
    pub hash: Option<String>,
}

/// Totals shown in the summary line.
#[derive(Default)]
struct Totals {
    downloaded_files: AtomicUsize,
    downloaded_bytes: AtomicU64,
    known_bytes: AtomicU64,
}

pub struct Downloader {
    dispatcher: Dispatcher,
    target: PathBuf,
    proxy: ProxyHandle,
    referer: Option<Url>,
    cancel: CancellationToken,
    multi_progress: MultiProgress,
    header_pb: ProgressBar,
    monitor: JoinHandle<()>,
    totals: Arc<Totals>,
    total_files: usize,
    verify_mode: VerifyMode,
}

impl Downloader {
    /// `target` is a directory, or the exact output file when downloading a
    /// single URL. Must be called inside the runtime.
    pub fn new(
        config: &DownloadConfig,
        target: PathBuf,
        proxy: ProxyHandle,
        referer: Option<Url>,
        cancel: CancellationToken,
        total_files: usize,
        verify_mode: VerifyMode,
    ) -> Self {
        let multi_progress = MultiProgress::new();
        multi_progress.set_draw_target(ProgressDrawTarget::stderr_with_hz(5));

        let header_pb = multi_progress.add(ProgressBar::new(0));
        header_pb.set_style(style("{msg}"));
        header_pb.set_message(format!("Summary: Files: 0/{} | Downloaded: 0 B", total_files));

        let totals = Arc::new(Totals::default());

        let monitor = {
            let totals = Arc::clone(&totals);
            let hpb = header_pb.clone();
            tokio::spawn(async move {
                loop {
                    hpb.set_message(summary(&totals, total_files));
                    hpb.tick();
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            })
        };

        Self {
            dispatcher: Dispatcher::new(config),
            target,
            proxy,
            referer,
            cancel,
            multi_progress,
            header_pb,
            monitor,
            totals,
            total_files,
            verify_mode,
        }
    }

    pub async fn download_file(&self, item: DownloadItem) -> Result<DownloadOutcome> {
        let pb = self.multi_progress.add(ProgressBar::new_spinner());
        pb.set_style(style(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes:>12}/{total_bytes:<12} {bytes_per_sec:>12} {eta:>4} {msg}",
        ).progress_chars("=>-"));
        pb.set_message(format!("Probing {}", item.url));

        let observer = Arc::new(BarObserver::new(pb.clone(), Arc::clone(&self.totals)));

        let probed = self
            .dispatcher
            .probe(
                item.url.clone(),
                self.referer.clone(),
                self.proxy.clone(),
                &self.cancel,
                observer.as_ref(),
            )
            .await;
        let mut state = match probed {
            Ok(state) => state,
            Err(DownloadError::Cancelled) => {
                pb.abandon_with_message(format!("Cancelled   {}", item.url));
                return Ok(DownloadOutcome::Cancelled);
            }
            Err(err) => {
                pb.abandon_with_message(format!("Failed      {}", item.url));
                return Err(err).with_context(|| format!("Failed to probe {}", item.url));
            }
        };

        let filepath = resolve_target(&self.target, state.source(), state.filename_hint());
        let name = filepath
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| filepath.display().to_string());
        if let Some(length) = state.length() {
            pb.set_length(length);
            self.totals.known_bytes.fetch_add(length, Ordering::Relaxed);
        }
        pb.set_message(format!("Downloading {}", name));
        info!(url = %item.url, path = %filepath.display(), "download started");

        let outcome = self
            .dispatcher
            .download(&mut state, &filepath, self.cancel.clone(), observer)
            .await;

        match outcome {
            Ok(DownloadOutcome::Completed) => {}
            Ok(DownloadOutcome::Cancelled) => {
                pb.abandon_with_message(format!("Cancelled   {} (partial data kept)", name));
                return Ok(DownloadOutcome::Cancelled);
            }
            Err(err) => {
                pb.abandon_with_message(format!("Failed      {}", name));
                return Err(err).with_context(|| format!("Failed to download {}", item.url));
            }
        }

        match (&item.hash, self.verify_mode) {
            (_, VerifyMode::Off) | (None, VerifyMode::Auto) => {
                pb.finish_with_message(format!("Completed   {}", name));
            }
            (Some(expected), _) => {
                pb.set_message(format!("Verifying {}", name));
                if !verify_hash(&filepath, expected).await? {
                    // Remove corrupted file so a rerun starts clean
                    let _ = tokio::fs::remove_file(&filepath).await;
                    pb.abandon_with_message(format!("Corrupt     {}", name));
                    return Err(anyhow!("Hash mismatch for {}: expected {}", item.url, expected));
                }
                pb.finish_with_message(format!(
                    "Verified    {} (SHA256: {})",
                    name,
                    expected.trim().to_ascii_lowercase()
                ));
            }
            (None, VerifyMode::On) => {
                return Err(anyhow!("Missing hash for {}", item.url));
            }
        }

        self.totals.downloaded_files.fetch_add(1, Ordering::Relaxed);
        Ok(DownloadOutcome::Completed)
    }

    /// Stops the summary refresher and leaves the final totals on screen.
    pub fn finish(&self) {
        self.monitor.abort();
        self.header_pb
            .finish_with_message(summary(&self.totals, self.total_files));
    }
}

impl Drop for Downloader {
    fn drop(&mut self) {
        self.monitor.abort();
    }
}

fn style(template: &str) -> ProgressStyle {
    ProgressStyle::default_bar()
        .template(template)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
}

fn summary(totals: &Totals, total_files: usize) -> String {
    format!(
        "Summary: Files: {}/{} | Downloaded: {} / {}",
        totals.downloaded_files.load(Ordering::Relaxed),
        total_files,
        HumanBytes(totals.downloaded_bytes.load(Ordering::Relaxed)),
        HumanBytes(totals.known_bytes.load(Ordering::Relaxed)),
    )
}

/// Drives one file's progress bar and feeds the summary totals.
///
/// `count` may be raised by several part workers at once, so the last seen
/// value is tracked with a max-update and only the growth is added to the
/// global byte total.
struct BarObserver {
    pb: ProgressBar,
    totals: Arc<Totals>,
    seen: AtomicU64,
}

impl BarObserver {
    fn new(pb: ProgressBar, totals: Arc<Totals>) -> Self {
        Self {
            pb,
            totals,
            seen: AtomicU64::new(0),
        }
    }
}

impl DownloadObserver for BarObserver {
    fn downloading(&self, state: &DownloadState) {
        if let Some(length) = state.length() {
            self.pb.set_length(length);
        }
        self.progress(state);
    }

    fn progress(&self, state: &DownloadState) {
        let count = state.count();
        self.pb.set_position(count);
        let previous = self.seen.fetch_max(count, Ordering::AcqRel);
        if count > previous {
            self.totals
                .downloaded_bytes
                .fetch_add(count - previous, Ordering::Relaxed);
        }
    }

    fn retrying(&self, attempt: u32, delay: Duration, cause: &DownloadError) {
        self.pb
            .set_message(format!("Retry {} in {:.1?}: {}", attempt, delay, cause));
    }

    fn moved(&self, _from: &Url, to: &Url) {
        self.pb.set_message(format!("Redirected to {}", to));
    }
}
