//! Defines a _storage event_, the normalized input of the trigger.
//! The storage event is decoded from an S3 notification record.

use crate::error::TriggerError;
use aws_lambda_events::event::s3::S3EventRecord;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::borrow::Cow;

/// The prefix of event names signalling a new object.
const OBJECT_CREATED_PREFIX: &str = "ObjectCreated:";

/// A newly created object, as notified by storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageEvent {
    /// The bucket holding the object.
    pub bucket_name: String,

    /// The decoded key of the object.
    pub object_key: String,

    /// When storage registered the event.
    pub event_timestamp: DateTime<Utc>,
}

/// Decodes notification records into storage events. Performs no
/// I/O.
#[derive(Debug, Default, Clone, Copy)]
pub struct Decoder;

impl Decoder {
    /// Whether the record notifies the creation of an object. Records
    /// without an event name are assumed to be creations.
    pub fn is_object_creation(&self, record: &S3EventRecord) -> bool {
        record
            .event_name
            .as_deref()
            .map_or(true, |name| name.starts_with(OBJECT_CREATED_PREFIX))
    }

    /// Builds a storage event from a notification record.
    pub fn decode(&self, record: &S3EventRecord) -> Result<StorageEvent, TriggerError> {
        let bucket_name = record
            .s3
            .bucket
            .name
            .as_deref()
            .filter(|name| !name.is_empty())
            .ok_or_else(|| TriggerError::MalformedEvent(String::from("record has no bucket name")))?;
        let raw_key = record
            .s3
            .object
            .key
            .as_deref()
            .filter(|key| !key.is_empty())
            .ok_or_else(|| TriggerError::MalformedEvent(String::from("record has no object key")))?;
        Ok(StorageEvent {
            bucket_name: String::from(bucket_name),
            object_key: decode_key(raw_key)?,
            event_timestamp: record.event_time,
        })
    }
}

/// Object keys are URL-encoded in notifications, with spaces encoded
/// as `+`.
fn decode_key(raw_key: &str) -> Result<String, TriggerError> {
    urlencoding::decode(&raw_key.replace('+', " "))
        .map(Cow::into_owned)
        .map_err(|e| {
            TriggerError::MalformedEvent(format!(
                "object key {:?} is not properly encoded: {}",
                raw_key, e
            ))
        })
}
