//! Defines the read-only application state, derived from settings
//! once at start-up and handed to the entry points.

use crate::conf::Settings;
use crate::error::TriggerError;
use crate::jq;
use crate::orchestrator::Orchestrator;
use crate::request::{JobConfig, JobRequestBuilder, KeyFilter};
use crate::submit::{JobApi, RetryPolicy, SubmissionClient};
use crate::trigger::Decoder;
use core::time::Duration;
use envy::from_env;

/// An App is an initialized application state, derived from
/// settings. Building it validates the whole configuration, so that
/// a misconfigured service never accepts traffic.
pub struct App {
    /// The original settings.
    pub settings: Settings,

    /// The builder of job requests.
    pub builder: JobRequestBuilder,

    /// The retry policy of submissions.
    pub retry_policy: RetryPolicy,
}

impl App {
    /// Initialize an App instance given a settings struct. Consumes
    /// the settings struct.
    pub fn new(settings: Settings) -> Result<Self, TriggerError> {
        let filter = KeyFilter::new(&settings.key_prefix, settings.match_key.as_deref())?;
        let parameters_filter = settings
            .parameters_filter
            .as_deref()
            .map(jq::compile)
            .transpose()
            .map_err(|e| TriggerError::Configuration(format!("invalid parameters filter: {}", e)))?;
        let builder = JobRequestBuilder::new(
            JobConfig {
                job_queue: settings.job_queue.clone(),
                job_definition: settings.job_definition.clone(),
                job_name_template: settings.job_name.clone(),
                key_prefix: settings.key_prefix.clone(),
                output_prefix: settings.output_prefix.clone(),
                artifact_bucket: settings.artifact_bucket.clone(),
                memory_limit_mib: settings.job_memory_limit,
                vcpus: settings.job_cpu_limit,
            },
            filter,
            parameters_filter,
        )?;
        if settings.submit_backoff_base_ms > settings.submit_max_backoff_ms {
            return Err(TriggerError::Configuration(String::from(
                "the submission backoff base exceeds its maximum",
            )));
        }
        if settings.submit_timeout_ms == 0 {
            return Err(TriggerError::Configuration(String::from(
                "the submission timeout must be positive",
            )));
        }
        let retry_policy = RetryPolicy {
            max_retries: settings.submit_max_retries,
            backoff_base: Duration::from_millis(settings.submit_backoff_base_ms),
            max_backoff: Duration::from_millis(settings.submit_max_backoff_ms),
            attempt_timeout: Duration::from_millis(settings.submit_timeout_ms),
        };
        Ok(App {
            settings,
            builder,
            retry_policy,
        })
    }

    /// Initialize an App instance from the environment.
    pub fn from_env() -> Result<Self, TriggerError> {
        let settings = from_env().map_err(|e| TriggerError::Configuration(e.to_string()))?;
        App::new(settings)
    }

    /// Wire the orchestrator around the given job API. Consumes the
    /// app.
    pub fn into_orchestrator<A: JobApi>(self, api: A) -> Orchestrator<A> {
        Orchestrator::new(
            Decoder,
            self.builder,
            SubmissionClient::new(api, self.retry_policy),
        )
        .drop_malformed(self.settings.drop_malformed_events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::Outcome;
    use crate::submit::tests::FakeJobApi;
    use crate::trigger::tests::record;
    use std::collections::BTreeMap;

    fn settings(pairs: &[(&str, &str)]) -> Settings {
        // Later pairs override the defaults
        let vars: BTreeMap<String, String> =
            [("JOB_QUEUE", "JobQueue"), ("JOB_DEFINITION", "batch-job-def")]
                .iter()
                .chain(pairs.iter())
                .map(|(k, v)| (String::from(*k), String::from(*v)))
                .collect();
        envy::from_iter(vars).unwrap()
    }

    #[test]
    fn builds_the_retry_policy() {
        let app = App::new(settings(&[
            ("SUBMIT_MAX_RETRIES", "5"),
            ("SUBMIT_TIMEOUT_MS", "2000"),
        ]))
        .unwrap();
        assert_eq!(app.retry_policy.max_retries, 5);
        assert_eq!(app.retry_policy.attempt_timeout, Duration::from_secs(2));
        assert_eq!(app.retry_policy.backoff_base, Duration::from_millis(300));
    }

    #[test]
    fn rejects_invalid_configuration() {
        for pairs in [
            &[("JOB_QUEUE", "")][..],
            &[("JOB_CPU_LIMIT", "0")][..],
            &[("JOB_NAME", "_job")][..],
            &[("PARAMETERS_FILTER", "{sample: ")][..],
            &[("SUBMIT_BACKOFF_BASE_MS", "9000")][..],
            &[("SUBMIT_TIMEOUT_MS", "0")][..],
        ] {
            assert!(matches!(
                App::new(settings(pairs)),
                Err(TriggerError::Configuration(_))
            ));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn wires_a_working_orchestrator() {
        let app = App::new(settings(&[
            ("MATCH_KEY", "input/*.fastq"),
            ("PARAMETERS_FILTER", "{sample: .objectKey}"),
        ]))
        .unwrap();
        let orchestrator = app.into_orchestrator(FakeJobApi::default());
        let outcomes = orchestrator
            .handle_records(&[
                record("sequencing-data", "input/sample.fastq"),
                record("sequencing-data", "input/sample.bam"),
            ])
            .await
            .unwrap();
        assert_eq!(outcomes.len(), 2);
        assert!(matches!(outcomes[0], Outcome::Submitted(_)));
        assert_eq!(outcomes[1], Outcome::Ignored);
        assert_eq!(orchestrator.client().api().job_count(), 1);
    }
}
