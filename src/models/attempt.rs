use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};

/// Why a transient failure happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransientKind {
    Timeout,
    ConnectionError,
    ProxyError,
    Cancelled,
}

impl TransientKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransientKind::Timeout => "timeout",
            TransientKind::ConnectionError => "connection_error",
            TransientKind::ProxyError => "proxy_error",
            TransientKind::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TransientKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Classified result of a single attempt
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Success {
        body: Bytes,
        status: u16,
        elapsed: Duration,
    },
    RateLimited,
    Forbidden,
    TransientFailure(TransientKind),
    MalformedBody,
    FatalHttpError(u16),
}

impl AttemptOutcome {
    /// Only network trouble and rate limiting are worth another attempt.
    /// A cancelled attempt never is.
    pub fn is_retryable(&self) -> bool {
        match self {
            AttemptOutcome::RateLimited => true,
            AttemptOutcome::TransientFailure(kind) => *kind != TransientKind::Cancelled,
            AttemptOutcome::Success { .. }
            | AttemptOutcome::Forbidden
            | AttemptOutcome::MalformedBody
            | AttemptOutcome::FatalHttpError(_) => false,
        }
    }

    pub fn kind_str(&self) -> &'static str {
        match self {
            AttemptOutcome::Success { .. } => "success",
            AttemptOutcome::RateLimited => "rate_limited",
            AttemptOutcome::Forbidden => "forbidden",
            AttemptOutcome::TransientFailure(kind) => kind.as_str(),
            AttemptOutcome::MalformedBody => "malformed_body",
            AttemptOutcome::FatalHttpError(_) => "fatal_http_error",
        }
    }
}

impl std::fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttemptOutcome::Success { status, elapsed, .. } => {
                write!(f, "success ({} in {}ms)", status, elapsed.as_millis())
            }
            AttemptOutcome::FatalHttpError(status) => write!(f, "fatal HTTP status {}", status),
            AttemptOutcome::TransientFailure(kind) => write!(f, "transient failure: {}", kind),
            other => write!(f, "{}", other.kind_str()),
        }
    }
}

/// One iteration of the retry loop
#[derive(Debug, Clone)]
pub struct RequestAttempt {
    pub attempt_number: u32,
    pub started_at: DateTime<Utc>,
    pub outcome: AttemptOutcome,
    /// Wait scheduled after this attempt, if another one followed
    pub backoff: Option<Duration>,
}

/// Terminal outcome of a whole call
#[derive(Debug, Clone, PartialEq)]
pub enum RequestResult {
    Ok(Bytes),
    GivenUp(AttemptOutcome),
}

/// Terminal result plus every attempt that led to it
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub result: RequestResult,
    pub attempts: Vec<RequestAttempt>,
}

impl ExecutionReport {
    pub fn attempt_count(&self) -> usize {
        self.attempts.len()
    }

    pub fn is_ok(&self) -> bool {
        matches!(self.result, RequestResult::Ok(_))
    }

    pub fn body(&self) -> Option<&Bytes> {
        match &self.result {
            RequestResult::Ok(body) => Some(body),
            RequestResult::GivenUp(_) => None,
        }
    }

    pub fn last_outcome(&self) -> Option<&AttemptOutcome> {
        match &self.result {
            RequestResult::GivenUp(outcome) => Some(outcome),
            RequestResult::Ok(_) => self.attempts.last().map(|a| &a.outcome),
        }
    }

    /// Gave up on a retryable outcome because the attempt budget ran out
    pub fn exhausted_retries(&self) -> bool {
        match &self.result {
            RequestResult::GivenUp(outcome) => outcome.is_retryable(),
            RequestResult::Ok(_) => false,
        }
    }

    /// Waits scheduled between consecutive attempts
    pub fn backoffs(&self) -> Vec<Duration> {
        self.attempts.iter().filter_map(|a| a.backoff).collect()
    }
}
