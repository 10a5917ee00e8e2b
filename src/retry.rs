//! Retry loop with capped exponential backoff, redirect following and the
//! per-attempt proxy step.
//!
//! Every network round-trip of the crate runs inside
//! [`RetryController::run`]. The supplied operation reports what happened
//! through the [`FailureKind`] of its error:
//!
//! - transient failures are retried after [`RetryPolicy::delay_for`] until
//!   the attempt budget is spent;
//! - redirects replace the [`DownloadState`] and reset the attempt counter;
//! - cancellation and fatal failures end the loop immediately.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{DownloadError, FailureKind};
use crate::http::Connector;
use crate::observer::DownloadObserver;
use crate::state::DownloadState;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

pub const DEFAULT_MAX_REDIRECTS: u32 = 10;

const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(32);

/// Backoff and hop limits.
///
/// ```text
/// delay(attempt) = min(base_delay * 2^(attempt - 1), max_delay)
/// ```
///
/// The sequence is non-decreasing; there is no jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts including the first one.
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    max_redirects: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            max_redirects: DEFAULT_MAX_REDIRECTS,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: max_delay.max(base_delay),
            max_redirects: DEFAULT_MAX_REDIRECTS,
        }
    }

    pub fn with_max_redirects(mut self, max_redirects: u32) -> Self {
        self.max_redirects = max_redirects;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn max_redirects(&self) -> u32 {
        self.max_redirects
    }

    /// Delay before the retry following failed attempt number `attempt`
    /// (1-indexed).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

/// What the operation gets for one attempt.
pub struct Attempt {
    /// Current state; replaced after each redirect.
    pub state: Arc<DownloadState>,
    /// Client configured for the proxy in effect for this attempt.
    pub client: Client,
    /// 1-indexed attempt number since the last redirect.
    pub number: u32,
}

pub struct RetryController<'a> {
    connector: &'a Connector,
    policy: &'a RetryPolicy,
    cancel: &'a CancellationToken,
    observer: &'a dyn DownloadObserver,
}

impl<'a> RetryController<'a> {
    pub fn new(
        connector: &'a Connector,
        policy: &'a RetryPolicy,
        cancel: &'a CancellationToken,
        observer: &'a dyn DownloadObserver,
    ) -> Self {
        Self {
            connector,
            policy,
            cancel,
            observer,
        }
    }

    pub fn connector(&self) -> &'a Connector {
        self.connector
    }

    /// Runs `op` until it succeeds, fails fatally, is cancelled or runs out
    /// of attempts. On return `state` holds the last state used, which
    /// reflects every redirect followed.
    pub async fn run<T, F, Fut>(
        &self,
        state: &mut Arc<DownloadState>,
        mut op: F,
    ) -> Result<T, DownloadError>
    where
        F: FnMut(Attempt) -> Fut,
        Fut: Future<Output = Result<T, DownloadError>>,
    {
        let mut failures = 0u32;
        let mut hops = 0u32;

        loop {
            if self.cancel.is_cancelled() {
                return Err(DownloadError::Cancelled);
            }

            let proxy = state.proxy().current();
            let client = self.connector.client_for(proxy.as_ref()).await?;
            debug!(url = %state.source(), attempt = failures + 1, "starting attempt");

            let attempt = Attempt {
                state: Arc::clone(state),
                client,
                number: failures + 1,
            };
            let err = match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            match err.kind() {
                FailureKind::Cancelled | FailureKind::Fatal => return Err(err),
                FailureKind::Redirect => {
                    let location = match err {
                        DownloadError::Moved { location, .. } => location,
                        other => return Err(other),
                    };
                    hops += 1;
                    if hops > self.policy.max_redirects {
                        return Err(DownloadError::TooManyRedirects {
                            url: state.source().clone(),
                            limit: self.policy.max_redirects,
                        });
                    }

                    warn!(from = %state.source(), to = %location, "following redirect");
                    let next = Arc::new(state.relocated(location));
                    self.observer.moved(state.source(), next.source());
                    *state = next;
                    failures = 0;
                }
                FailureKind::Transient => {
                    failures += 1;
                    if failures >= self.policy.max_attempts {
                        return Err(DownloadError::RetriesExhausted {
                            attempts: failures,
                            source: Box::new(err),
                        });
                    }

                    let delay = self.policy.delay_for(failures);
                    warn!(
                        url = %state.source(),
                        attempt = failures,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient failure, retrying"
                    );
                    self.observer.retrying(failures, delay, &err);

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.cancel.cancelled() => return Err(DownloadError::Cancelled),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use url::Url;

    use super::*;
    use crate::config::DownloadConfig;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(
            max_attempts,
            Duration::from_millis(1),
            Duration::from_millis(4),
        )
    }

    fn state() -> Arc<DownloadState> {
        Arc::new(DownloadState::new(
            Url::parse("http://origin.test/file").unwrap(),
        ))
    }

    fn timeout_error(state: &DownloadState) -> DownloadError {
        DownloadError::Timeout {
            url: state.source().clone(),
        }
    }

    #[derive(Default)]
    struct Recorder {
        delays: Mutex<Vec<Duration>>,
        moves: AtomicU32,
    }

    impl DownloadObserver for Recorder {
        fn retrying(&self, _attempt: u32, delay: Duration, _cause: &DownloadError) {
            self.delays.lock().unwrap().push(delay);
        }

        fn moved(&self, _from: &Url, _to: &Url) {
            self.moves.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn backoff_is_non_decreasing_and_capped() {
        let policy = RetryPolicy::new(10, Duration::from_secs(1), Duration::from_secs(32));
        let delays: Vec<Duration> = (1..=40).map(|a| policy.delay_for(a)).collect();
        assert_eq!(delays[0], Duration::from_secs(1));
        assert_eq!(delays[1], Duration::from_secs(2));
        assert_eq!(delays[2], Duration::from_secs(4));
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert!(delays.iter().all(|d| *d <= Duration::from_secs(32)));
        assert_eq!(*delays.last().unwrap(), Duration::from_secs(32));
    }

    #[tokio::test]
    async fn transient_failures_stop_at_max_attempts() {
        let connector = Connector::new(&DownloadConfig::default());
        let policy = fast_policy(3);
        let cancel = CancellationToken::new();
        let recorder = Recorder::default();
        let controller = RetryController::new(&connector, &policy, &cancel, &recorder);

        let calls = AtomicU32::new(0);
        let mut state = state();
        let result: Result<(), _> = controller
            .run(&mut state, |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { Err(timeout_error(&attempt.state)) }
            })
            .await;

        assert!(matches!(
            result,
            Err(DownloadError::RetriesExhausted { attempts: 3, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let delays = recorder.delays.lock().unwrap().clone();
        assert_eq!(delays, vec![Duration::from_millis(1), Duration::from_millis(2)]);
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let connector = Connector::new(&DownloadConfig::default());
        let policy = fast_policy(5);
        let cancel = CancellationToken::new();
        let controller = RetryController::new(&connector, &policy, &cancel, &());

        let mut state = state();
        let result = controller
            .run(&mut state, |attempt| async move {
                if attempt.number < 3 {
                    Err(timeout_error(&attempt.state))
                } else {
                    Ok(attempt.number)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test]
    async fn fatal_errors_are_not_retried() {
        let connector = Connector::new(&DownloadConfig::default());
        let policy = fast_policy(5);
        let cancel = CancellationToken::new();
        let controller = RetryController::new(&connector, &policy, &cancel, &());

        let calls = AtomicU32::new(0);
        let mut state = state();
        let result: Result<(), _> = controller
            .run(&mut state, |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    Err(DownloadError::HttpStatus {
                        url: attempt.state.source().clone(),
                        status: reqwest::StatusCode::NOT_FOUND,
                    })
                }
            })
            .await;

        assert!(matches!(result, Err(DownloadError::HttpStatus { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn redirects_replace_state_and_reset_attempts() {
        let connector = Connector::new(&DownloadConfig::default());
        let policy = fast_policy(2);
        let cancel = CancellationToken::new();
        let recorder = Recorder::default();
        let controller = RetryController::new(&connector, &policy, &cancel, &recorder);

        let referer = Url::parse("http://origin.test/index.html").unwrap();
        let mut state = Arc::new(
            DownloadState::new(Url::parse("http://origin.test/file").unwrap())
                .with_referer(Some(referer.clone())),
        );
        // Each hop fails once before redirecting; with a budget of two attempts
        // that only works if the counter resets on every redirect.
        let result = controller
            .run(&mut state, |attempt| async move {
                let next = match attempt.state.source().host_str() {
                    Some("origin.test") => "http://hop1.test/file",
                    Some("hop1.test") => "http://hop2.test/file",
                    Some("hop2.test") => "http://final.test/file",
                    _ => return Ok(()),
                };
                if attempt.number == 1 {
                    return Err(timeout_error(&attempt.state));
                }
                Err(DownloadError::Moved {
                    url: attempt.state.source().clone(),
                    location: Url::parse(next).unwrap(),
                })
            })
            .await;

        assert!(result.is_ok());
        assert_eq!(state.source().as_str(), "http://final.test/file");
        assert_eq!(state.referer(), Some(&referer));
        assert_eq!(recorder.moves.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn redirect_loops_are_capped() {
        let connector = Connector::new(&DownloadConfig::default());
        let policy = fast_policy(3).with_max_redirects(4);
        let cancel = CancellationToken::new();
        let controller = RetryController::new(&connector, &policy, &cancel, &());

        let mut state = state();
        let result: Result<(), _> = controller
            .run(&mut state, |attempt| async move {
                Err(DownloadError::Moved {
                    url: attempt.state.source().clone(),
                    location: attempt.state.source().clone(),
                })
            })
            .await;

        assert!(matches!(
            result,
            Err(DownloadError::TooManyRedirects { limit: 4, .. })
        ));
    }

    #[tokio::test]
    async fn cancellation_interrupts_backoff() {
        let connector = Connector::new(&DownloadConfig::default());
        let policy = RetryPolicy::new(5, Duration::from_secs(60), Duration::from_secs(60));
        let cancel = CancellationToken::new();
        let controller = RetryController::new(&connector, &policy, &cancel, &());

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let mut state = state();
        let started = std::time::Instant::now();
        let result: Result<(), _> = controller
            .run(&mut state, |attempt| async move { Err(timeout_error(&attempt.state)) })
            .await;

        assert!(matches!(result, Err(DownloadError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn cancelled_before_start_never_calls_op() {
        let connector = Connector::new(&DownloadConfig::default());
        let policy = fast_policy(3);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let controller = RetryController::new(&connector, &policy, &cancel, &());

        let calls = AtomicU32::new(0);
        let mut state = state();
        let result: Result<(), _> = controller
            .run(&mut state, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;

        assert!(matches!(result, Err(DownloadError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
