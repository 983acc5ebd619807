//! Error types for the storage E2E runner
//!
//! Every component returns [`E2eError`]. The variants follow the failure
//! taxonomy of the runner: network failures and HTTP failures are retry
//! candidates, protocol violations and assertion failures abort a scenario.

use std::collections::BTreeMap;
use std::time::Duration;

use thiserror::Error;

/// Provider-agnostic view of a non-2xx response.
///
/// Built once by the transport from the response envelope and never mutated.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpFailure {
    pub status: u16,
    pub method: String,
    pub path: String,
    /// Response headers, names lowercased
    pub headers: BTreeMap<String, String>,
    /// Body decoded as lossy UTF-8
    pub raw_body: String,
    /// `error.code` from the envelope
    pub provider_error_code: Option<String>,
    /// `error.normalizedError.code`
    pub normalized_code: Option<String>,
    /// `error.normalizedError.retryable`
    pub normalized_retryable: Option<bool>,
    pub retry_after: Option<String>,
    pub request_id: Option<String>,
}

impl std::fmt::Display for HttpFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HTTP {} {} {}", self.status, self.method, self.path)?;
        if let Some(code) = &self.provider_error_code {
            write!(f, " (code={code})")?;
        }
        Ok(())
    }
}

/// Main error type for runner operations
#[derive(Error, Debug)]
pub enum E2eError {
    /// No response was obtained (DNS, connection refused, timeout)
    #[error("Network error {method} {path}: {message}")]
    Network {
        method: String,
        path: String,
        message: String,
    },

    /// A response was obtained with a non-2xx status
    #[error("{0}")]
    Http(Box<HttpFailure>),

    /// The response violates the expected envelope or shape
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// Observed state has not converged yet
    #[error("Not settled: {0}")]
    Unsettled(String),

    /// A bounded wait elapsed
    #[error("{what} did not finish within {}{}", format_timeout(.timeout), last_error_suffix(.last_error))]
    Timeout {
        what: String,
        timeout: Duration,
        last_error: Option<String>,
    },

    /// A verified invariant did not hold
    #[error("Assertion failed: {0}")]
    Assertion(String),

    /// An asynchronous job reached a failed terminal state
    #[error("Job {job_id} ended with status={status}: {}", .error.as_deref().unwrap_or("no error reported"))]
    JobFailed {
        job_id: String,
        status: String,
        error: Option<String>,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn format_timeout(timeout: &Duration) -> String {
    if timeout.subsec_nanos() == 0 {
        format!("{}s", timeout.as_secs())
    } else {
        format!("{}ms", timeout.as_millis())
    }
}

fn last_error_suffix(last_error: &Option<String>) -> String {
    match last_error {
        Some(e) => format!(": {e}"),
        None => String::new(),
    }
}

impl E2eError {
    /// Whether the retry coordinator may attempt the operation again.
    ///
    /// This looks at the failure kind only; `normalizedRetryable` from the
    /// server is never consulted.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            E2eError::Network { .. }
                | E2eError::Http(_)
                | E2eError::Unsettled(_)
                | E2eError::Timeout { .. }
        )
    }

    /// The normalized HTTP failure, if this error carries one
    pub fn http_failure(&self) -> Option<&HttpFailure> {
        match self {
            E2eError::Http(failure) => Some(failure.as_ref()),
            _ => None,
        }
    }
}

impl From<HttpFailure> for E2eError {
    fn from(failure: HttpFailure) -> Self {
        E2eError::Http(Box::new(failure))
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, E2eError>;
