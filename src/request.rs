//! Defines the job submission request, and how it's built from a
//! storage event and the static job configuration.

use crate::error::TriggerError;
use crate::jq;
use crate::sign::{object_signature, SIGNATURE_LEN};
use crate::trigger::StorageEvent;
use regex::Regex;
use std::collections::BTreeMap;

/// Maximum length of a job name, as accepted by Batch.
pub const MAX_JOB_NAME_LEN: usize = 128;

/// Placeholder for the object's base name in job name templates.
const NAME_PLACEHOLDER: &str = "{name}";

/// Placeholder for the object's signature in job name templates.
const HASH_PLACEHOLDER: &str = "{hash}";

/// A request to submit a single job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobSubmissionRequest {
    /// The job name, a deterministic function of the triggering
    /// object.
    pub job_name: String,

    /// The queue that receives the job.
    pub job_queue: String,

    /// The job definition to instantiate.
    pub job_definition: String,

    /// Parameters substituted into the job definition's command.
    pub parameters: BTreeMap<String, String>,

    /// Environment variables overridden in the job's container.
    pub environment: BTreeMap<String, String>,

    /// Memory override, in MiB.
    pub memory_limit_mib: Option<u32>,

    /// vCPU override.
    pub vcpus: Option<f64>,
}

/// The static part of every job submission.
#[derive(Debug, Clone)]
pub struct JobConfig {
    pub job_queue: String,
    pub job_definition: String,
    pub job_name_template: String,
    pub key_prefix: String,
    pub output_prefix: String,
    pub artifact_bucket: Option<String>,
    pub memory_limit_mib: Option<u32>,
    pub vcpus: Option<f64>,
}

/// Selects the object keys that trigger jobs.
#[derive(Debug, Clone)]
pub struct KeyFilter {
    prefix: String,
    match_key_re: Option<Regex>,
}

impl KeyFilter {
    /// Builds a filter from a key prefix and an optional glob, where
    /// the star matches any number of non-slash characters.
    pub fn new(prefix: &str, match_key: Option<&str>) -> Result<Self, TriggerError> {
        let match_key_re = match_key
            .map(|glob| {
                Regex::new(&format!(
                    "^{}$",
                    glob.split('*').map(regex::escape).collect::<Vec<_>>().join("[^/]*?")
                ))
            })
            .transpose()
            .map_err(|e| TriggerError::Configuration(format!("invalid match key: {}", e)))?;
        Ok(KeyFilter {
            prefix: String::from(prefix),
            match_key_re,
        })
    }

    /// Whether the key selects a job.
    pub fn matches(&self, key: &str) -> bool {
        key.starts_with(&self.prefix)
            && self
                .match_key_re
                .as_ref()
                .map_or(true, |re| re.is_match(key))
    }
}

/// Builds job submission requests out of storage events.
pub struct JobRequestBuilder {
    config: JobConfig,
    filter: KeyFilter,
    parameters_filter: Option<jq::Filter>,
    invalid_name_chars_re: Regex,
}

impl JobRequestBuilder {
    /// Validates the static configuration and prepares a builder.
    pub fn new(
        mut config: JobConfig,
        filter: KeyFilter,
        parameters_filter: Option<jq::Filter>,
    ) -> Result<Self, TriggerError> {
        if config.job_queue.trim().is_empty() {
            return Err(TriggerError::Configuration(String::from(
                "the job queue is empty",
            )));
        }
        if config.job_definition.trim().is_empty() {
            return Err(TriggerError::Configuration(String::from(
                "the job definition is empty",
            )));
        }
        if !config.job_name_template.contains(HASH_PLACEHOLDER) {
            config.job_name_template = format!("{}-{}", config.job_name_template, HASH_PLACEHOLDER);
        }
        if config.memory_limit_mib == Some(0) {
            return Err(TriggerError::Configuration(String::from(
                "the job memory limit must be positive",
            )));
        }
        if config.vcpus.map_or(false, |vcpus| !(vcpus > 0.0)) {
            return Err(TriggerError::Configuration(String::from(
                "the job vCPU limit must be positive",
            )));
        }
        let builder = JobRequestBuilder {
            config,
            filter,
            parameters_filter,
            invalid_name_chars_re: Regex::new("[^A-Za-z0-9_-]")
                .map_err(|e| TriggerError::Configuration(e.to_string()))?,
        };
        builder.validate_template()?;
        Ok(builder)
    }

    /// Checks that the job name template renders valid job names,
    /// whatever the object.
    fn validate_template(&self) -> Result<(), TriggerError> {
        let template = &self.config.job_name_template;
        let rendered = template
            .replace(HASH_PLACEHOLDER, &"h".repeat(SIGNATURE_LEN))
            .replace(NAME_PLACEHOLDER, "");
        let limit = if template.contains(NAME_PLACEHOLDER) {
            MAX_JOB_NAME_LEN - 1
        } else {
            MAX_JOB_NAME_LEN
        };
        if rendered.len() > limit {
            return Err(TriggerError::Configuration(format!(
                "the job name template {:?} leaves no room for names",
                template
            )));
        }
        let starts_alphanumeric = template
            .chars()
            .next()
            .map_or(false, |c| c.is_ascii_alphanumeric());
        if !starts_alphanumeric || self.invalid_name_chars_re.is_match(&rendered) {
            return Err(TriggerError::Configuration(format!(
                "the job name template {:?} must start with a letter or digit, \
                 and contain only letters, digits, hyphens, underscores and \
                 the {} and {} placeholders",
                template, NAME_PLACEHOLDER, HASH_PLACEHOLDER
            )));
        }
        Ok(())
    }

    /// Whether the event should trigger a job.
    pub fn accepts(&self, event: &StorageEvent) -> bool {
        self.filter.matches(&event.object_key)
    }

    /// Derives the job name for an event. Repeated deliveries of the
    /// same event yield the same name, and the name is truncated to
    /// the maximum length while keeping the object signature.
    pub fn job_name(&self, event: &StorageEvent) -> String {
        let template = &self.config.job_name_template;
        let with_hash = template.replace(
            HASH_PLACEHOLDER,
            &object_signature(&event.bucket_name, &event.object_key),
        );
        let slots = with_hash.matches(NAME_PLACEHOLDER).count();
        if slots == 0 {
            return with_hash;
        }
        let fixed_len = with_hash.len() - slots * NAME_PLACEHOLDER.len();
        let budget = MAX_JOB_NAME_LEN.saturating_sub(fixed_len) / slots;
        let base_name = event
            .object_key
            .rsplit('/')
            .next()
            .unwrap_or(&event.object_key);
        let mut name = self
            .invalid_name_chars_re
            .replace_all(base_name, "_")
            .into_owned();
        name.truncate(budget);
        with_hash.replace(NAME_PLACEHOLDER, &name)
    }

    /// The key the job should write its output to.
    fn output_key(&self, key: &str) -> String {
        format!(
            "{}{}",
            self.config.output_prefix,
            key.strip_prefix(&self.config.key_prefix).unwrap_or(key)
        )
    }

    /// Builds the submission request for an event.
    pub fn build(&self, event: &StorageEvent) -> Result<JobSubmissionRequest, TriggerError> {
        let mut parameters = match &self.parameters_filter {
            Some(filter) => {
                let input = serde_json::to_value(event).map_err(|e| {
                    TriggerError::Configuration(format!("couldn't serialize event: {}", e))
                })?;
                jq::parameters(filter, input).map_err(|e| {
                    TriggerError::Configuration(format!("parameters filter failed: {:#}", e))
                })?
            }
            None => BTreeMap::new(),
        };
        parameters.insert(String::from("bucket"), event.bucket_name.clone());
        parameters.insert(String::from("key"), event.object_key.clone());
        parameters.insert(
            String::from("eventTime"),
            event.event_timestamp.to_rfc3339(),
        );

        let mut environment = BTreeMap::new();
        environment.insert(
            String::from("DATA_BUCKET"),
            self.config
                .artifact_bucket
                .clone()
                .unwrap_or_else(|| event.bucket_name.clone()),
        );
        environment.insert(String::from("INPUT_BUCKET"), event.bucket_name.clone());
        environment.insert(String::from("INPUT_KEY"), event.object_key.clone());
        environment.insert(String::from("OUTPUT_KEY"), self.output_key(&event.object_key));

        Ok(JobSubmissionRequest {
            job_name: self.job_name(event),
            job_queue: self.config.job_queue.clone(),
            job_definition: self.config.job_definition.clone(),
            parameters,
            environment,
            memory_limit_mib: self.config.memory_limit_mib,
            vcpus: self.config.vcpus,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    pub(crate) fn config() -> JobConfig {
        JobConfig {
            job_queue: String::from("arn:aws:batch:ap-southeast-1:123456789012:job-queue/JobQueue"),
            job_definition: String::from(
                "arn:aws:batch:ap-southeast-1:123456789012:job-definition/batch-job-def:1",
            ),
            job_name_template: String::from("testFromLambda"),
            key_prefix: String::from("input/"),
            output_prefix: String::from("output/"),
            artifact_bucket: None,
            memory_limit_mib: Some(2048),
            vcpus: Some(2.0),
        }
    }

    pub(crate) fn builder() -> JobRequestBuilder {
        JobRequestBuilder::new(config(), KeyFilter::new("input/", None).unwrap(), None).unwrap()
    }

    pub(crate) fn event(key: &str) -> StorageEvent {
        StorageEvent {
            bucket_name: String::from("sequencing-data"),
            object_key: String::from(key),
            event_timestamp: Utc.with_ymd_and_hms(2023, 9, 12, 8, 30, 0).unwrap(),
        }
    }

    #[test]
    fn job_name_is_deterministic() {
        let first = builder().build(&event("input/sample.fastq")).unwrap();
        let second = builder().build(&event("input/sample.fastq")).unwrap();
        assert_eq!(first.job_name, second.job_name);
        assert_eq!(first, second);
        assert!(first.job_name.starts_with("testFromLambda-"));
    }

    #[test]
    fn distinct_keys_get_distinct_names() {
        let builder = builder();
        assert_ne!(
            builder.job_name(&event("input/a.fastq")),
            builder.job_name(&event("input/b.fastq"))
        );
    }

    #[test]
    fn name_placeholder_is_sanitized() {
        let builder = JobRequestBuilder::new(
            JobConfig {
                job_name_template: String::from("seq-{name}-{hash}"),
                ..config()
            },
            KeyFilter::new("input/", None).unwrap(),
            None,
        )
        .unwrap();
        let name = builder.job_name(&event("input/run 1/sample.v2.fastq"));
        assert!(name.starts_with("seq-sample_v2_fastq-"));
        assert_eq!(name.len(), "seq-sample_v2_fastq-".len() + SIGNATURE_LEN);
    }

    #[test]
    fn long_names_are_truncated_keeping_the_hash() {
        let builder = JobRequestBuilder::new(
            JobConfig {
                job_name_template: String::from("j{name}{hash}"),
                ..config()
            },
            KeyFilter::new("input/", None).unwrap(),
            None,
        )
        .unwrap();
        let event = event(&format!("input/{}", "x".repeat(300)));
        let name = builder.job_name(&event);
        assert_eq!(name.len(), MAX_JOB_NAME_LEN);
        assert!(name.ends_with(&object_signature(&event.bucket_name, &event.object_key)));
    }

    #[test]
    fn templates_may_fill_the_whole_name() {
        let with_template = |template: String| {
            JobRequestBuilder::new(
                JobConfig {
                    job_name_template: template,
                    ..config()
                },
                KeyFilter::new("input/", None).unwrap(),
                None,
            )
        };
        let fixed = "a".repeat(MAX_JOB_NAME_LEN - SIGNATURE_LEN);
        let builder = with_template(format!("{}{{hash}}", fixed)).unwrap();
        assert_eq!(
            builder.job_name(&event("input/sample.fastq")).len(),
            MAX_JOB_NAME_LEN
        );
        assert!(with_template(format!("a{}{{hash}}", fixed)).is_err());

        let fixed = "a".repeat(MAX_JOB_NAME_LEN - SIGNATURE_LEN - 1);
        let builder = with_template(format!("{}{{name}}{{hash}}", fixed)).unwrap();
        let name = builder.job_name(&event("input/sample.fastq"));
        assert_eq!(name.len(), MAX_JOB_NAME_LEN);
        assert!(name.starts_with(&format!("{}s", fixed)));
        assert!(with_template(format!("a{}{{name}}{{hash}}", fixed)).is_err());
    }

    #[test]
    fn request_carries_parameters_and_overrides() {
        let request = builder().build(&event("input/run/sample.fastq")).unwrap();
        assert_eq!(request.parameters["bucket"], "sequencing-data");
        assert_eq!(request.parameters["key"], "input/run/sample.fastq");
        assert_eq!(request.parameters["eventTime"], "2023-09-12T08:30:00+00:00");
        assert_eq!(request.environment["DATA_BUCKET"], "sequencing-data");
        assert_eq!(request.environment["INPUT_KEY"], "input/run/sample.fastq");
        assert_eq!(request.environment["OUTPUT_KEY"], "output/run/sample.fastq");
        assert_eq!(request.memory_limit_mib, Some(2048));
        assert_eq!(request.vcpus, Some(2.0));
    }

    #[test]
    fn artifact_bucket_receives_outputs() {
        let builder = JobRequestBuilder::new(
            JobConfig {
                artifact_bucket: Some(String::from("results")),
                ..config()
            },
            KeyFilter::new("input/", None).unwrap(),
            None,
        )
        .unwrap();
        let request = builder.build(&event("input/sample.fastq")).unwrap();
        assert_eq!(request.environment["DATA_BUCKET"], "results");
        assert_eq!(request.environment["INPUT_BUCKET"], "sequencing-data");
    }

    #[test]
    fn filter_parameters_cannot_override_builtins() {
        let builder = JobRequestBuilder::new(
            config(),
            KeyFilter::new("input/", None).unwrap(),
            Some(jq::compile(r#"{key: "spoofed", sample: .objectKey}"#).unwrap()),
        )
        .unwrap();
        let request = builder.build(&event("input/sample.fastq")).unwrap();
        assert_eq!(request.parameters["key"], "input/sample.fastq");
        assert_eq!(request.parameters["sample"], "input/sample.fastq");
    }

    #[test]
    fn prefix_and_glob_select_keys() {
        let filter = KeyFilter::new("input/", Some("input/*.fastq")).unwrap();
        assert!(filter.matches("input/sample.fastq"));
        assert!(!filter.matches("input/nested/sample.fastq"));
        assert!(!filter.matches("input/sample.bam"));
        assert!(!filter.matches("output/sample.fastq"));
        let filter = KeyFilter::new("input/", None).unwrap();
        assert!(filter.matches("input/nested/sample.bam"));
        assert!(!filter.matches("inputs/sample.fastq"));
    }

    #[test]
    fn incomplete_configuration_is_rejected() {
        let filter = || KeyFilter::new("input/", None).unwrap();
        let empty_queue = JobConfig {
            job_queue: String::new(),
            ..config()
        };
        let empty_definition = JobConfig {
            job_definition: String::from("  "),
            ..config()
        };
        let bad_template = JobConfig {
            job_name_template: String::from("-{name}"),
            ..config()
        };
        let unknown_placeholder = JobConfig {
            job_name_template: String::from("job-{key}"),
            ..config()
        };
        let zero_memory = JobConfig {
            memory_limit_mib: Some(0),
            ..config()
        };
        for config in [
            empty_queue,
            empty_definition,
            bad_template,
            unknown_placeholder,
            zero_memory,
        ] {
            assert!(matches!(
                JobRequestBuilder::new(config, filter(), None),
                Err(TriggerError::Configuration(_))
            ));
        }
    }
}
