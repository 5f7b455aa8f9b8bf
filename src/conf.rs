//! Defines configuration as read from the environment.

use serde::Deserialize;

/// Default `job_name` value.
fn default_job_name() -> String {
    String::from("job")
}

/// Default `key_prefix` value.
fn default_key_prefix() -> String {
    String::from("input/")
}

/// Default `output_prefix` value.
fn default_output_prefix() -> String {
    String::from("output/")
}

/// Default `submit_max_retries` value.
fn default_submit_max_retries() -> u32 {
    3
}

/// Default `submit_backoff_base_ms` value.
fn default_submit_backoff_base_ms() -> u64 {
    300
}

/// Default `submit_max_backoff_ms` value.
fn default_submit_max_backoff_ms() -> u64 {
    5000
}

/// Default `submit_timeout_ms` value.
fn default_submit_timeout_ms() -> u64 {
    5000
}

/// Default `drop_malformed_events` value.
fn default_drop_malformed_events() -> bool {
    true
}

/// The trigger is configured to receive S3 object creation events,
/// and submit one batch job per matching object. The configuration
/// must be given as environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// The job queue that receives submitted jobs, either as a name
    /// or an ARN.
    pub job_queue: String,

    /// The job definition of submitted jobs, either as a name or an
    /// ARN.
    pub job_definition: String,

    /// The template for job names. The placeholder `{name}` is
    /// replaced with the base name of the object key, and `{hash}`
    /// with a digest of the bucket and key. A template without
    /// `{hash}` has `-{hash}` appended to it, so that distinct
    /// objects never share a job name. Must start with a letter or a
    /// digit.
    #[serde(default = "default_job_name")]
    pub job_name: String,

    /// Only keys starting with this prefix trigger a job.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Defines an additional filter to select only matching keys. The
    /// star (*) can be used as a wildcard matching any number of
    /// non-slash characters. E.g. to match only FASTQ files in the
    /// input folder, use `"input/*.fastq"`. Omitting this will make
    /// it match any key under `key_prefix`.
    #[serde(default)]
    pub match_key: Option<String>,

    /// Defines a bucket to receive the job's outputs. If omitted, it
    /// will be the same bucket as the one in the triggering event.
    #[serde(default)]
    pub artifact_bucket: Option<String>,

    /// The prefix that replaces `key_prefix` to form the output key
    /// handed to the job.
    #[serde(default = "default_output_prefix")]
    pub output_prefix: String,

    /// The per-job memory ceiling, in MiB. Omitting it keeps the job
    /// definition's value.
    #[serde(default)]
    pub job_memory_limit: Option<u32>,

    /// The per-job vCPU ceiling. Omitting it keeps the job
    /// definition's value.
    #[serde(default)]
    pub job_cpu_limit: Option<f64>,

    /// A jq filter evaluated over the storage event, which must
    /// produce an object. Its entries are added to the job
    /// parameters.
    #[serde(default)]
    pub parameters_filter: Option<String>,

    /// How many times a submission is retried after a transient
    /// failure, not counting the first attempt.
    #[serde(default = "default_submit_max_retries")]
    pub submit_max_retries: u32,

    /// The first backoff delay between submission attempts, in
    /// milliseconds. It doubles after each failure.
    #[serde(default = "default_submit_backoff_base_ms")]
    pub submit_backoff_base_ms: u64,

    /// The maximum backoff delay between submission attempts, in
    /// milliseconds.
    #[serde(default = "default_submit_max_backoff_ms")]
    pub submit_max_backoff_ms: u64,

    /// The time allowed for a single submission attempt, in
    /// milliseconds. A timed out attempt counts as a transient
    /// failure.
    #[serde(default = "default_submit_timeout_ms")]
    pub submit_timeout_ms: u64,

    /// Whether malformed events are logged and dropped. When false,
    /// they fail the invocation, so that the runtime's dead-letter
    /// destination receives them.
    #[serde(default = "default_drop_malformed_events")]
    pub drop_malformed_events: bool,
}
