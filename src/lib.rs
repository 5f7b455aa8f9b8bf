//! Submits AWS Batch jobs in response to S3 object creation events.
//!
//! Each notification record is decoded into a [`trigger::StorageEvent`],
//! turned into a [`request::JobSubmissionRequest`] with a job name
//! derived from the object, and submitted through a
//! [`submit::SubmissionClient`]. The [`orchestrator::Orchestrator`]
//! coordinates the three steps and decides what the invoking runtime
//! should do with failures.

pub mod app;
pub mod client;
pub mod conf;
pub mod error;
pub mod jq;
pub mod orchestrator;
pub mod request;
pub mod sign;
pub mod submit;
pub mod trigger;
