//! Defines the trigger orchestrator, the entry point invoked once per
//! notification record.
//!
//! Each invocation goes through `Received → Decoded → RequestBuilt →
//! Submitted` and ends as either succeeded or failed. Nothing is kept
//! between invocations, so concurrent invocations need no
//! coordination besides what the job API does with duplicate job
//! names.

use crate::error::{InvocationError, Stage, TriggerError};
use crate::request::JobRequestBuilder;
use crate::submit::{JobApi, JobSubmissionResult, SubmissionClient};
use crate::trigger::{Decoder, StorageEvent};
use aws_lambda_events::event::s3::S3EventRecord;
use tracing::{debug, info, instrument, warn};

/// How a successful invocation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The record isn't an object creation, or its key doesn't match
    /// the configured filter.
    Ignored,

    /// The record was malformed, and dropped.
    Dropped,

    /// A job is known to the job API for the event.
    Submitted(JobSubmissionResult),
}

/// Coordinates decoding, request building and submission.
pub struct Orchestrator<A> {
    decoder: Decoder,
    builder: JobRequestBuilder,
    client: SubmissionClient<A>,
    drop_malformed: bool,
}

impl<A: JobApi> Orchestrator<A> {
    pub fn new(decoder: Decoder, builder: JobRequestBuilder, client: SubmissionClient<A>) -> Self {
        Orchestrator {
            decoder,
            builder,
            client,
            drop_malformed: true,
        }
    }

    /// Sets whether `handle_records` drops malformed records instead
    /// of failing.
    pub fn drop_malformed(mut self, drop_malformed: bool) -> Self {
        self.drop_malformed = drop_malformed;
        self
    }

    /// The submission client in use.
    pub fn client(&self) -> &SubmissionClient<A> {
        &self.client
    }

    /// Handle a single notification record.
    #[instrument(skip_all, fields(key = record.s3.object.key.as_deref().unwrap_or_default()))]
    pub async fn handle(&self, record: &S3EventRecord) -> Result<Outcome, InvocationError> {
        if !self.decoder.is_object_creation(record) {
            debug!("Ignoring {:?} event", record.event_name);
            return Ok(Outcome::Ignored);
        }
        let event = self.decoder.decode(record).map_err(|e| {
            let failure = InvocationError::new(Stage::Received, e);
            warn!("{}", failure);
            failure
        })?;
        self.handle_event(&event).await
    }

    /// Handle an already decoded storage event.
    #[instrument(skip_all, fields(bucket = %event.bucket_name, key = %event.object_key))]
    pub async fn handle_event(&self, event: &StorageEvent) -> Result<Outcome, InvocationError> {
        let mut stage = Stage::Decoded;
        match self.run(event, &mut stage).await {
            Ok(Outcome::Submitted(submission)) => {
                info!(stage = %stage, job_id = %submission.job_id, "Invocation succeeded");
                Ok(Outcome::Submitted(submission))
            }
            Ok(outcome) => {
                debug!("Ignoring key not matching the filter");
                Ok(outcome)
            }
            Err(e) => {
                let failure = InvocationError::new(stage, e);
                warn!("{}", failure);
                Err(failure)
            }
        }
    }

    async fn run(&self, event: &StorageEvent, stage: &mut Stage) -> Result<Outcome, TriggerError> {
        if !self.builder.accepts(event) {
            return Ok(Outcome::Ignored);
        }
        let request = self.builder.build(event)?;
        *stage = Stage::RequestBuilt;
        debug!(stage = %stage, job_name = %request.job_name);
        let submission = self.client.submit(&request).await?;
        *stage = Stage::Submitted;
        if !submission.accepted {
            return Err(TriggerError::Configuration(format!(
                "job {:?} was rejected: {}",
                request.job_name,
                submission.failure_reason.unwrap_or_default()
            )));
        }
        Ok(Outcome::Submitted(submission))
    }

    /// Handle every record of a notification, each one as an
    /// independent invocation. All records are attempted, and on
    /// success there is one outcome per record, in order. If any
    /// failed, the error reported is a retriable one when there is
    /// any, so that the runtime re-delivers the notification; the
    /// records already handled are safe to redeliver. Malformed
    /// records are only reported when not dropped.
    pub async fn handle_records(
        &self,
        records: &[S3EventRecord],
    ) -> Result<Vec<Outcome>, InvocationError> {
        let mut outcomes = Vec::with_capacity(records.len());
        let mut failure: Option<InvocationError> = None;
        for record in records {
            match self.handle(record).await {
                Ok(outcome) => outcomes.push(outcome),
                Err(InvocationError {
                    error: TriggerError::MalformedEvent(reason),
                    ..
                }) if self.drop_malformed => {
                    warn!("Dropping malformed record: {}", reason);
                    outcomes.push(Outcome::Dropped);
                }
                Err(e) => {
                    let replace = match &failure {
                        None => true,
                        Some(current) => e.is_retriable() && !current.is_retriable(),
                    };
                    if replace {
                        failure = Some(e);
                    }
                }
            }
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(outcomes),
        }
    }
}
