mod cli;
mod commands;
mod downloader;

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use segdl::{DownloadConfig, DownloadOutcome};

use crate::cli::Args;
use crate::commands::RunOptions;

fn init_tracing(default_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .try_init();
}

/// Directory targets get a fresh name on every run, so only an explicit
/// output path can be picked up again.
fn cancel_notice(explicit_output: bool) -> &'static str {
    if explicit_output {
        "Download cancelled; partial data was left on disk. Re-running with the same -o path \
         continues it when the server accepts range requests."
    } else {
        "Download cancelled; partial data was left on disk."
    }
}

fn main() -> Result<()> {
    let mut args = Args::parse();
    init_tracing(args.log_level());

    let mut config = match &args.config {
        Some(path) => DownloadConfig::load_from_file(path)?,
        None => DownloadConfig::default(),
    };
    args.apply_to(&mut config);

    if args.download_dir.is_relative() {
        if let Ok(cwd) = std::env::current_dir() {
            args.download_dir = cwd.join(&args.download_dir);
        }
    }

    let options = RunOptions {
        config,
        concurrency: args.concurrency,
        verify_mode: args.verify_hash,
        proxy: args.proxy_config(),
        referer: args.referer.clone(),
    };

    let explicit_output = args.output.is_some();
    let rt = tokio::runtime::Runtime::new()?;
    let outcome = rt.block_on(async move {
        match args.url {
            Some(url) => {
                crate::commands::run_single_download(
                    url,
                    args.output,
                    args.download_dir,
                    args.sha256,
                    options,
                )
                .await
            }
            None => {
                let tasks_file = std::fs::canonicalize(&args.tasks_file)
                    .unwrap_or_else(|_| PathBuf::from(&args.tasks_file));
                crate::commands::run_downloads(tasks_file, args.download_dir, options).await
            }
        }
    })?;

    if outcome == DownloadOutcome::Cancelled {
        eprintln!("{}", cancel_notice(explicit_output));
        std::process::exit(130);
    }
    Ok(())
}
