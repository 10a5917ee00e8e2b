use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::fs;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::warn;
use url::Url;

use segdl::{CancellationToken, DownloadConfig, DownloadOutcome, ProxyConfig, ProxyHandle};

use crate::cli::VerifyMode;
use crate::downloader::{DownloadItem, Downloader};

/// Settings shared by the single and batch commands.
pub struct RunOptions {
    pub config: DownloadConfig,
    pub concurrency: Option<usize>,
    pub verify_mode: VerifyMode,
    pub proxy: Option<ProxyConfig>,
    pub referer: Option<Url>,
}

/// Cancels `cancel` on the first Ctrl-C. Partial files stay on disk.
fn cancel_on_ctrl_c(cancel: &CancellationToken) {
    let cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, stopping downloads");
            cancel.cancel();
        }
    });
}

/// Parses a tasks file: one `url` or `url|sha256` per line. Blank lines and
/// lines starting with `#` are skipped.
pub async fn read_tasks(input: &Path) -> Result<Vec<DownloadItem>> {
    let file = fs::File::open(input)
        .await
        .with_context(|| format!("Failed to open input file: {:?}", input))?;
    let mut lines = BufReader::new(file).lines();
    let mut items = vec![];
    let mut number = 0usize;

    while let Some(line) = lines.next_line().await? {
        number += 1;
        let raw = line.trim();
        if raw.is_empty() || raw.starts_with('#') {
            continue;
        }
        let mut parts = raw.splitn(2, '|');
        let url = parts.next().unwrap_or_default().trim();
        let hash = parts
            .next()
            .map(|h| h.trim().to_string())
            .filter(|h| !h.is_empty());
        let url = Url::parse(url)
            .with_context(|| format!("{:?} line {}: invalid URL {:?}", input, number, url))?;
        items.push(DownloadItem { url, hash });
    }
    Ok(items)
}

pub async fn run_single_download(
    url: Url,
    output: Option<PathBuf>,
    download_dir: PathBuf,
    hash: Option<String>,
    options: RunOptions,
) -> Result<DownloadOutcome> {
    if options.verify_mode == VerifyMode::On && hash.is_none() {
        bail!("Hash verification is on but no --sha256 was given");
    }

    let target = match output {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)
                    .await
                    .context("Failed to create output directory")?;
            }
            path
        }
        None => {
            fs::create_dir_all(&download_dir)
                .await
                .context("Failed to create output directory")?;
            download_dir
        }
    };

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(&cancel);

    let downloader = Downloader::new(
        &options.config,
        target,
        ProxyHandle::new(options.proxy),
        options.referer,
        cancel,
        1,
        options.verify_mode,
    );
    let result = downloader.download_file(DownloadItem { url, hash }).await;
    downloader.finish();
    result
}

pub async fn run_downloads(input: PathBuf, output: PathBuf, options: RunOptions) -> Result<DownloadOutcome> {
    fs::create_dir_all(&output)
        .await
        .context("Failed to create output directory")?;

    let items = read_tasks(&input).await?;
    if options.verify_mode == VerifyMode::On {
        let missing: Vec<String> = items
            .iter()
            .filter(|i| i.hash.is_none())
            .map(|i| i.url.to_string())
            .collect();
        if !missing.is_empty() {
            bail!("Hash verification is on, but these entries have no hash: {:?}", missing);
        }
    }
    let total_files = items.len();

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(&cancel);

    let downloader = Arc::new(Downloader::new(
        &options.config,
        output,
        ProxyHandle::new(options.proxy),
        options.referer,
        cancel.clone(),
        total_files,
        options.verify_mode,
    ));
    let concurrency = options.concurrency.unwrap_or_else(num_cpus::get).max(1);
    let semaphore = Arc::new(Semaphore::new(concurrency));
    let mut handles = JoinSet::new();

    for item in items {
        let downloader = Arc::clone(&downloader);
        let semaphore = Arc::clone(&semaphore);
        handles.spawn(async move {
            let _permit = semaphore.acquire_owned().await?;
            downloader.download_file(item).await
        });
    }

    let mut failed = 0usize;
    while let Some(joined) = handles.join_next().await {
        match joined {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                eprintln!("{:#}", e);
                failed += 1;
            }
            Err(e) => {
                eprintln!("Download task failed: {}", e);
                failed += 1;
            }
        }
    }
    downloader.finish();

    if failed > 0 {
        bail!("{} of {} downloads failed", failed, total_files);
    }
    if cancel.is_cancelled() {
        return Ok(DownloadOutcome::Cancelled);
    }
    Ok(DownloadOutcome::Completed)
}
