//! Resilient request execution
//!
//! One logical GET, retried on network trouble and rate limiting, never on a
//! standing rejection. Every attempt is classified into [`AttemptOutcome`]
//! where the network call returns, so the retry decision is a plain match.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::error::Elapsed;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::error::{Result, ScoutError};
use crate::models::{
    AttemptOutcome, ExecutionReport, ProxyConfiguration, RequestAttempt, RequestResult,
    TransientKind,
};
use crate::proxy::client::{FetchedResponse, Fetcher, Target};
use crate::proxy::registry::ProxyRegistry;

/// What a 2xx body must look like to count as a success
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BodyFormat {
    #[default]
    Json,
    Text,
}

impl BodyFormat {
    pub fn accepts(&self, body: &[u8]) -> bool {
        match self {
            BodyFormat::Json => serde_json::from_slice::<serde_json::Value>(body).is_ok(),
            BodyFormat::Text => std::str::from_utf8(body).is_ok(),
        }
    }
}

impl std::str::FromStr for BodyFormat {
    type Err = ScoutError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "json" => Ok(BodyFormat::Json),
            "text" => Ok(BodyFormat::Text),
            other => Err(ScoutError::InvalidArgument(format!(
                "unknown body format '{}', expected json or text",
                other
            ))),
        }
    }
}

/// Delays between attempts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Linear backoff unit: attempt `n` is followed by `n * base_delay`
    pub base_delay: Duration,
    /// Extra wait added after a 429
    pub rate_limit_cooldown: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            rate_limit_cooldown: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Linear backoff after attempt `attempt_number`
    pub fn backoff(&self, attempt_number: u32) -> Duration {
        self.base_delay.saturating_mul(attempt_number)
    }

    /// Wait before retrying after `outcome`, or `None` if it must not be retried
    pub fn delay_for(&self, outcome: &AttemptOutcome, attempt_number: u32) -> Option<Duration> {
        if !outcome.is_retryable() {
            return None;
        }
        match outcome {
            AttemptOutcome::RateLimited => Some(
                self.rate_limit_cooldown
                    .saturating_add(self.backoff(attempt_number)),
            ),
            _ => Some(self.backoff(attempt_number)),
        }
    }

    /// Largest delay this policy produces within `max_attempts`
    pub fn max_backoff(&self, max_attempts: u32) -> Duration {
        self.rate_limit_cooldown
            .saturating_add(self.backoff(max_attempts.saturating_sub(1)))
    }
}

/// Lets a caller abandon in-flight executions
pub struct CancelHandle {
    cancel_tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { cancel_tx: tx }, rx)
    }

    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }

    /// Resolves once cancellation is requested; never resolves if the handle is gone
    pub async fn cancelled(cancel: &mut watch::Receiver<bool>) {
        if cancel.wait_for(|c| *c).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Runs GETs with timeout, bounded retries, and outcome classification
pub struct RequestExecutor {
    fetcher: Arc<dyn Fetcher>,
    policy: RetryPolicy,
    format: BodyFormat,
}

impl RequestExecutor {
    pub fn new(fetcher: Arc<dyn Fetcher>, policy: RetryPolicy) -> Self {
        Self {
            fetcher,
            policy,
            format: BodyFormat::default(),
        }
    }

    pub fn with_format(mut self, format: BodyFormat) -> Self {
        self.format = format;
        self
    }

    /// Execute using the registry's configuration at call time
    pub async fn execute_current(
        &self,
        url: &Url,
        registry: &ProxyRegistry,
        timeout: Duration,
        max_attempts: u32,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<ExecutionReport> {
        let proxy = registry.current();
        self.execute(url, &proxy, timeout, max_attempts, cancel).await
    }

    /// GET `url` through `proxy`, making at most `max_attempts` attempts of at
    /// most `timeout` each.
    ///
    /// Returns `Err` only for bad arguments, before any attempt is made.
    /// Every network-level result, cancellation included, comes back as a
    /// report.
    #[instrument(skip(self, url, proxy, cancel), fields(url = %url, route = %proxy))]
    pub async fn execute(
        &self,
        url: &Url,
        proxy: &ProxyConfiguration,
        timeout: Duration,
        max_attempts: u32,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<ExecutionReport> {
        if max_attempts == 0 {
            return Err(ScoutError::InvalidArgument(
                "max_attempts must be at least 1".into(),
            ));
        }
        if timeout.is_zero() {
            return Err(ScoutError::InvalidArgument(
                "request timeout must be greater than zero".into(),
            ));
        }
        Target::parse(url)?;

        let mut attempts: Vec<RequestAttempt> = Vec::new();
        let mut attempt_number = 0u32;

        loop {
            attempt_number += 1;
            debug!("Sending request (attempt {}/{})", attempt_number, max_attempts);

            let started_at = Utc::now();
            let start = Instant::now();
            let outcome = tokio::select! {
                biased;
                _ = CancelHandle::cancelled(cancel) => AttemptOutcome::TransientFailure(TransientKind::Cancelled),
                result = tokio::time::timeout(timeout, self.fetcher.get(url, proxy)) => {
                    self.classify(result, start.elapsed())
                }
            };

            let retry_delay = if attempt_number < max_attempts {
                self.policy.delay_for(&outcome, attempt_number)
            } else {
                None
            };

            attempts.push(RequestAttempt {
                attempt_number,
                started_at,
                outcome: outcome.clone(),
                backoff: retry_delay,
            });

            if let AttemptOutcome::Success { body, status, elapsed } = &outcome {
                info!(
                    "Request succeeded with {} in {}ms (attempt {}/{})",
                    status,
                    elapsed.as_millis(),
                    attempt_number,
                    max_attempts
                );
                return Ok(ExecutionReport {
                    result: RequestResult::Ok(body.clone()),
                    attempts,
                });
            }

            let Some(delay) = retry_delay else {
                warn!(
                    "Giving up after {} attempt(s): {}",
                    attempt_number, outcome
                );
                return Ok(given_up(outcome, attempts));
            };

            warn!(
                "Attempt {}/{} failed: {}; retrying in {}ms",
                attempt_number,
                max_attempts,
                outcome,
                delay.as_millis()
            );

            let cancelled_while_waiting = tokio::select! {
                biased;
                _ = CancelHandle::cancelled(cancel) => true,
                _ = tokio::time::sleep(delay) => false,
            };
            if cancelled_while_waiting {
                warn!("Cancelled during backoff after {} attempt(s)", attempt_number);
                // The wait was cut short and nothing followed it.
                if let Some(last) = attempts.last_mut() {
                    last.backoff = None;
                }
                return Ok(given_up(
                    AttemptOutcome::TransientFailure(TransientKind::Cancelled),
                    attempts,
                ));
            }
        }
    }

    fn classify(
        &self,
        result: std::result::Result<Result<FetchedResponse>, Elapsed>,
        elapsed: Duration,
    ) -> AttemptOutcome {
        match result {
            Err(_) => AttemptOutcome::TransientFailure(TransientKind::Timeout),
            Ok(Err(e)) => {
                debug!("Transport failure: {}", e);
                AttemptOutcome::TransientFailure(e.transient_kind())
            }
            Ok(Ok(response)) => classify_response(response, elapsed, self.format),
        }
    }
}

/// Map a completed response onto an outcome
pub fn classify_response(
    response: FetchedResponse,
    elapsed: Duration,
    format: BodyFormat,
) -> AttemptOutcome {
    match response.status {
        429 => AttemptOutcome::RateLimited,
        403 => AttemptOutcome::Forbidden,
        status if (200..300).contains(&status) => {
            if format.accepts(&response.body) {
                AttemptOutcome::Success {
                    body: response.body,
                    status,
                    elapsed,
                }
            } else {
                AttemptOutcome::MalformedBody
            }
        }
        status => AttemptOutcome::FatalHttpError(status),
    }
}

fn given_up(outcome: AttemptOutcome, attempts: Vec<RequestAttempt>) -> ExecutionReport {
    ExecutionReport {
        result: RequestResult::GivenUp(outcome),
        attempts,
    }
}
