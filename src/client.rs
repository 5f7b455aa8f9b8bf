//! Defines the AWS configuration and the Batch job API.

use crate::request::JobSubmissionRequest;
use crate::submit::{ApiError, JobApi, SubmitOutcome};
use anyhow::anyhow;
use async_trait::async_trait;
use aws_config::retry::RetryConfig;
use aws_config::{from_env, SdkConfig};
use aws_sdk_batch::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_batch::types::{
    ContainerOverrides, JobStatus, KeyValuePair, KeyValuesPair, ResourceRequirement,
    ResourceType,
};
use aws_sdk_batch::Client;
use std::env;
use tracing::{debug, instrument};

/// Service error codes worth retrying.
const TRANSIENT_ERROR_CODES: [&str; 5] = [
    "ServerException",
    "TooManyRequestsException",
    "ThrottlingException",
    "ServiceUnavailable",
    "InternalError",
];

/// Load the shared AWS configuration, honoring an endpoint override
/// given in `AWS_ENDPOINT_URL`.
pub async fn sdk_config() -> SdkConfig {
    let endpoint_url_var = env::var("AWS_ENDPOINT_URL");
    if let Ok(endpoint_url) = endpoint_url_var {
        from_env()
            .endpoint_url(
                if endpoint_url.starts_with("http://") || endpoint_url.starts_with("https://") {
                    endpoint_url
                } else {
                    format!("https://{}", endpoint_url)
                },
            )
            .region("us-east-1") // should be OK since the endpoint was overridden
            .load()
    } else {
        from_env().load()
    }
    .await
}

/// Initialize the Batch job API. The SDK's own retries are disabled,
/// since submissions are retried by the submission client.
pub async fn init() -> BatchJobApi {
    let sdk_config = sdk_config().await;
    let config = aws_sdk_batch::config::Builder::from(&sdk_config)
        .retry_config(RetryConfig::disabled())
        .build();
    BatchJobApi::new(Client::from_conf(config))
}

/// Whether a service error code signals a transient failure.
pub fn is_transient_code(code: Option<&str>) -> bool {
    code.map_or(false, |code| TRANSIENT_ERROR_CODES.contains(&code))
}

/// Classify an SDK error as transient or permanent. Errors that
/// happened before a response was interpreted are transient, except
/// for the failure to build the request.
fn classify<E, R>(error: SdkError<E, R>) -> ApiError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    let message = anyhow!("{}", DisplayErrorContext(&error));
    match &error {
        SdkError::ServiceError(context) if is_transient_code(context.err().code()) => {
            ApiError::Transient(message)
        }
        SdkError::ServiceError(_) | SdkError::ConstructionFailure(_) => {
            ApiError::Permanent(message)
        }
        _ => ApiError::Transient(message),
    }
}

/// The job API backed by AWS Batch. Batch accepts duplicate job
/// names, so existing jobs are looked up before submitting.
pub struct BatchJobApi {
    client: Client,
}

impl BatchJobApi {
    pub fn new(client: Client) -> Self {
        BatchJobApi { client }
    }

    /// Finds a job in the request's queue with the request's name,
    /// that didn't fail.
    #[instrument(skip_all, fields(job_name = %request.job_name))]
    async fn find_existing(
        &self,
        request: &JobSubmissionRequest,
    ) -> Result<Option<String>, ApiError> {
        let mut next: Option<String> = None;
        loop {
            let response = self
                .client
                .list_jobs()
                .job_queue(&request.job_queue)
                .filters(
                    KeyValuesPair::builder()
                        .name("JOB_NAME")
                        .values(&request.job_name)
                        .build(),
                )
                .set_next_token(next.take())
                .send()
                .await
                .map_err(classify)?;
            let existing = response
                .job_summary_list()
                .unwrap_or_default()
                .iter()
                .filter(|summary| summary.job_name() == Some(request.job_name.as_str()))
                .filter(|summary| !matches!(summary.status(), Some(JobStatus::Failed)))
                .find_map(|summary| summary.job_id());
            if let Some(job_id) = existing {
                return Ok(Some(String::from(job_id)));
            }
            match response.next_token() {
                Some(token) => next = Some(String::from(token)),
                None => return Ok(None),
            }
        }
    }
}

/// Translate a request's overrides into Batch container overrides.
fn container_overrides(request: &JobSubmissionRequest) -> ContainerOverrides {
    let mut resource_requirements = Vec::new();
    if let Some(memory) = request.memory_limit_mib {
        resource_requirements.push(
            ResourceRequirement::builder()
                .r#type(ResourceType::Memory)
                .value(memory.to_string())
                .build(),
        );
    }
    if let Some(vcpus) = request.vcpus {
        resource_requirements.push(
            ResourceRequirement::builder()
                .r#type(ResourceType::Vcpu)
                .value(vcpus.to_string())
                .build(),
        );
    }
    ContainerOverrides::builder()
        .set_environment(Some(
            request
                .environment
                .iter()
                .map(|(name, value)| KeyValuePair::builder().name(name).value(value).build())
                .collect(),
        ))
        .set_resource_requirements(if resource_requirements.is_empty() {
            None
        } else {
            Some(resource_requirements)
        })
        .build()
}

#[async_trait]
impl JobApi for BatchJobApi {
    async fn submit_job(&self, request: &JobSubmissionRequest) -> Result<SubmitOutcome, ApiError> {
        if let Some(job_id) = self.find_existing(request).await? {
            return Ok(SubmitOutcome::AlreadyExists { job_id });
        }
        debug!("Submitting job {:?}", request.job_name);
        let output = self
            .client
            .submit_job()
            .job_name(&request.job_name)
            .job_queue(&request.job_queue)
            .job_definition(&request.job_definition)
            .set_parameters(Some(
                request
                    .parameters
                    .iter()
                    .map(|(name, value)| (name.clone(), value.clone()))
                    .collect(),
            ))
            .container_overrides(container_overrides(request))
            .send()
            .await
            .map_err(classify)?;
        // A response without an id is retried; the retry finds the
        // job if it was created
        let job_id = output
            .job_id()
            .ok_or_else(|| ApiError::Transient(anyhow!("SubmitJob response carried no job id")))?;
        Ok(SubmitOutcome::Created {
            job_id: String::from(job_id),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::tests::{builder, event};
    use aws_sdk_batch::operation::submit_job::SubmitJobError;
    use aws_smithy_types::error::metadata::ErrorMetadata;

    fn service_error(code: &str) -> SdkError<SubmitJobError, ()> {
        SdkError::service_error(
            SubmitJobError::generic(ErrorMetadata::builder().code(code).build()),
            (),
        )
    }

    #[test]
    fn throttling_and_server_errors_are_transient() {
        assert!(is_transient_code(Some("TooManyRequestsException")));
        assert!(is_transient_code(Some("ServerException")));
        assert!(!is_transient_code(Some("ClientException")));
        assert!(!is_transient_code(None));
    }

    #[test]
    fn classifies_sdk_errors() {
        assert!(matches!(
            classify(service_error("TooManyRequestsException")),
            ApiError::Transient(_)
        ));
        assert!(matches!(
            classify(service_error("ClientException")),
            ApiError::Permanent(_)
        ));
        assert!(matches!(
            classify(SdkError::<SubmitJobError, ()>::construction_failure("missing job queue")),
            ApiError::Permanent(_)
        ));
        assert!(matches!(
            classify(SdkError::<SubmitJobError, ()>::timeout_error("timed out")),
            ApiError::Transient(_)
        ));
    }

    #[test]
    fn overrides_carry_environment_and_resources() {
        let request = builder().build(&event("input/sample.fastq")).unwrap();
        let overrides = container_overrides(&request);
        let environment = overrides.environment().unwrap_or_default();
        assert_eq!(environment.len(), 4);
        assert!(environment
            .iter()
            .any(|pair| pair.name() == Some("OUTPUT_KEY")
                && pair.value() == Some("output/sample.fastq")));
        let resources = overrides.resource_requirements().unwrap_or_default();
        assert_eq!(resources.len(), 2);
        assert!(resources
            .iter()
            .any(|r| r.r#type() == Some(&ResourceType::Memory) && r.value() == Some("2048")));
        assert!(resources
            .iter()
            .any(|r| r.r#type() == Some(&ResourceType::Vcpu) && r.value() == Some("2")));
    }
}
