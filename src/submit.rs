//! Defines the submission client, which issues job submission
//! requests against a job API with bounded retries.
//!
//! Submissions are idempotent at the job name level: a job API that
//! reports an existing job with the requested name is treated as a
//! successful submission of that job.

use crate::error::TriggerError;
use crate::request::JobSubmissionRequest;
use anyhow::anyhow;
use async_trait::async_trait;
use core::time::Duration;
use thiserror::Error;
use tokio::time::{sleep, timeout};
use tracing::{info, instrument, warn};

/// The base of the exponential backoff sequence.
const BACKOFF_BASE: u32 = 2;

/// A failed call to the job API.
#[derive(Error, Debug)]
pub enum ApiError {
    /// The call may succeed if repeated.
    #[error("transient job API failure: {0:#}")]
    Transient(anyhow::Error),

    /// The request was rejected and would be rejected again.
    #[error("job API rejected the request: {0:#}")]
    Permanent(anyhow::Error),
}

/// What the job API did with a submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// A new job was created.
    Created { job_id: String },

    /// A job with the requested name already exists.
    AlreadyExists { job_id: String },
}

/// The job API receiving submissions.
#[async_trait]
pub trait JobApi: Send + Sync {
    /// Submit a job, unless one with the same name exists already.
    async fn submit_job(&self, request: &JobSubmissionRequest) -> Result<SubmitOutcome, ApiError>;
}

/// The result of a submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSubmissionResult {
    /// The submitted job, or the existing one with the same name.
    /// Empty when the submission wasn't accepted.
    pub job_id: String,

    /// Whether the job is known to the job API.
    pub accepted: bool,

    /// Why the submission wasn't accepted.
    pub failure_reason: Option<String>,
}

impl JobSubmissionResult {
    fn accepted(job_id: String) -> Self {
        JobSubmissionResult {
            job_id,
            accepted: true,
            failure_reason: None,
        }
    }

    fn rejected(reason: String) -> Self {
        JobSubmissionResult {
            job_id: String::new(),
            accepted: false,
            failure_reason: Some(reason),
        }
    }
}

/// How submissions are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,

    /// The delay after the first failed attempt.
    pub backoff_base: Duration,

    /// The maximum delay between attempts.
    pub max_backoff: Duration,

    /// The time allowed for each attempt.
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: 3,
            backoff_base: Duration::from_millis(300),
            max_backoff: Duration::from_millis(5000),
            attempt_timeout: Duration::from_millis(5000),
        }
    }
}

impl RetryPolicy {
    /// The delay after the given failed attempt, counting from 1.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = BACKOFF_BASE.saturating_pow(attempt.saturating_sub(1));
        std::cmp::min(self.backoff_base.saturating_mul(factor), self.max_backoff)
    }
}

/// Issues submissions against a job API.
pub struct SubmissionClient<A> {
    api: A,
    policy: RetryPolicy,
}

impl<A: JobApi> SubmissionClient<A> {
    pub fn new(api: A, policy: RetryPolicy) -> Self {
        SubmissionClient { api, policy }
    }

    /// The underlying job API.
    pub fn api(&self) -> &A {
        &self.api
    }

    /// Submit a job. Transient failures and timeouts are retried with
    /// exponential backoff. Permanent rejections are not retried, and
    /// produce an unaccepted result.
    #[instrument(skip_all, fields(job_name = %request.job_name))]
    pub async fn submit(
        &self,
        request: &JobSubmissionRequest,
    ) -> Result<JobSubmissionResult, TriggerError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let cause = match timeout(self.policy.attempt_timeout, self.api.submit_job(request)).await
            {
                Ok(Ok(SubmitOutcome::Created { job_id })) => {
                    info!("Submitted job {:?}", job_id);
                    return Ok(JobSubmissionResult::accepted(job_id));
                }
                Ok(Ok(SubmitOutcome::AlreadyExists { job_id })) => {
                    info!("Job {:?} already exists; not submitting again", job_id);
                    return Ok(JobSubmissionResult::accepted(job_id));
                }
                Ok(Err(ApiError::Permanent(e))) => {
                    warn!("Job submission was rejected: {:#}", e);
                    return Ok(JobSubmissionResult::rejected(format!("{:#}", e)));
                }
                Ok(Err(ApiError::Transient(e))) => e,
                Err(_) => anyhow!(
                    "submission attempt timed out after {:?}",
                    self.policy.attempt_timeout
                ),
            };
            if attempt > self.policy.max_retries {
                return Err(TriggerError::SubmissionFailed {
                    attempts: attempt,
                    source: cause,
                });
            }
            let delay = self.policy.delay(attempt);
            warn!(
                "Submission attempt {} failed; retrying in {:?}: {:#}",
                attempt, delay, cause
            );
            sleep(delay).await;
        }
    }
}
