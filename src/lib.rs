//! Resumable, segmented HTTP(S) file downloads.
//!
//! A [`Dispatcher`] probes a source into a [`DownloadState`], then picks one
//! of three [`Strategy`] variants from its capability flags:
//!
//! - [`Strategy::Single`] streams the body over one connection;
//! - [`Strategy::Ranged`] appends to the on-disk file using a byte range;
//! - [`Strategy::Multipart`] splits the file into parts fetched concurrently.
//!
//! Every request runs inside the [`RetryController`], which retries
//! transient failures with capped exponential backoff, follows redirects and
//! honors a shared cancellation token.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod hashing;
pub mod http;
pub mod observer;
pub mod probe;
pub mod retry;
pub mod state;
pub mod strategy;
pub mod throttle;
pub mod utils;

pub use config::DownloadConfig;
pub use dispatcher::Dispatcher;
pub use error::{DownloadError, DownloadOutcome, FailureKind};
pub use observer::DownloadObserver;
pub use retry::{RetryController, RetryPolicy};
pub use state::{DownloadState, Part, PartState, ProxyConfig, ProxyHandle};
pub use strategy::Strategy;
pub use tokio_util::sync::CancellationToken;
