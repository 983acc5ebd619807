//! Asynchronous job polling
//!
//! A job moves `pending/queued → running → succeeded | failed | canceled` and
//! never leaves a terminal state. The poller observes it through
//! `GET /jobs/{id}` until it is terminal or the deadline passes.

use std::fmt;
use std::time::Duration;

use reqwest::Method;
use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::errors::{E2eError, Result};
use crate::transport::ApiClient;

/// How much of the job log to fetch when a job fails
pub const LOG_TAIL_BYTES: u64 = 64 * 1024;

/// Job status as reported by the API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[serde(alias = "queued")]
    Pending,
    Running,
    Succeeded,
    Failed,
    Canceled,
    /// Anything the runner does not know; treated as still in progress
    #[serde(other)]
    Unknown,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Canceled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Canceled => "canceled",
            JobStatus::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Job {
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    pub status: JobStatus,
    #[serde(default)]
    pub error: Option<String>,
}

/// Polls one job until it reaches a terminal state
#[derive(Debug, Clone, Copy)]
pub struct JobPoller {
    pub interval: Duration,
    pub timeout: Duration,
    pub log_tail_bytes: u64,
}

impl Default for JobPoller {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            timeout: Duration::from_secs(180),
            log_tail_bytes: LOG_TAIL_BYTES,
        }
    }
}

impl JobPoller {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            timeout,
            ..Self::default()
        }
    }

    /// Wait for `job_id` to succeed.
    ///
    /// # Errors
    ///
    /// - [`E2eError::JobFailed`] when the job ends failed or canceled, after
    ///   one best-effort attempt to log the tail of its output
    /// - [`E2eError::Timeout`] when no terminal state is seen before the deadline
    /// - any transport error from `GET /jobs/{id}`
    pub async fn wait(&self, api: &ApiClient, job_id: &str, profile_id: &str) -> Result<Job> {
        let deadline = Instant::now() + self.timeout;
        let path = format!("/jobs/{}", job_id);
        let mut last_status = None;

        while Instant::now() < deadline {
            let job: Job = api
                .request_json(Method::GET, &path, Some(profile_id), None)
                .await?;

            if last_status != Some(job.status) {
                debug!(
                    job_id,
                    job_type = job.kind.as_deref(),
                    status = %job.status,
                    "Job status"
                );
                last_status = Some(job.status);
            }

            match job.status {
                JobStatus::Succeeded => return Ok(job),
                JobStatus::Failed | JobStatus::Canceled => {
                    self.log_tail(api, job_id, profile_id).await;
                    return Err(E2eError::JobFailed {
                        job_id: job_id.to_string(),
                        status: job.status.to_string(),
                        error: job.error,
                    });
                }
                JobStatus::Pending | JobStatus::Running | JobStatus::Unknown => {
                    tokio::time::sleep(self.interval).await;
                }
            }
        }

        Err(E2eError::Timeout {
            what: format!("Job {}", job_id),
            timeout: self.timeout,
            last_error: last_status.map(|s| format!("last status={}", s)),
        })
    }

    /// Log the tail of the job log; failures here are only warnings
    async fn log_tail(&self, api: &ApiClient, job_id: &str, profile_id: &str) {
        let path = format!("/jobs/{}/logs?tailBytes={}", job_id, self.log_tail_bytes);
        match api.request_text(Method::GET, &path, Some(profile_id)).await {
            Ok(tail) if tail.trim().is_empty() => {}
            Ok(tail) => {
                info!(job_id, "---- job logs (tail) ----");
                for line in tail.trim_end().lines() {
                    info!(job_id, "{}", line);
                }
                info!(job_id, "---- end job logs ----");
            }
            Err(err) => warn!(job_id, error = %err, "failed to fetch job logs"),
        }
    }
}
