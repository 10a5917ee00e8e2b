//! Download tuning, loadable from a JSON file and overridable from the CLI.

use std::fs;
use std::num::{NonZeroU32, NonZeroUsize};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct DownloadConfig {
    /// Number of parts for multi-part transfers.
    pub parts: NonZeroUsize,
    /// Read buffer size for the copy loop.
    pub chunk_size: NonZeroUsize,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_redirects: u32,
    /// Smallest length for which multi-part mode is worth it.
    pub multipart_threshold: u64,
    /// Global bandwidth cap in bytes per second.
    pub rate_limit: Option<NonZeroU32>,
    pub user_agent: String,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        Self {
            parts: NonZeroUsize::new(8).unwrap_or(NonZeroUsize::MIN),
            chunk_size: NonZeroUsize::new(64 * 1024).unwrap_or(NonZeroUsize::MIN),
            connect_timeout_secs: 10,
            read_timeout_secs: 30,
            max_attempts: retry.max_attempts(),
            base_delay_ms: retry.base_delay().as_millis() as u64,
            max_delay_ms: retry.max_delay().as_millis() as u64,
            max_redirects: retry.max_redirects(),
            multipart_threshold: 1024 * 1024,
            rate_limit: None,
            user_agent: concat!("segdl/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl DownloadConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        let config = serde_json::from_str(&data)
            .with_context(|| format!("Failed to parse config file {:?}", path))?;

        Ok(config)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
        .with_max_redirects(self.max_redirects)
    }
}
