use anyhow::{Context, Result};
use aws_lambda_events::event::s3::{S3Event, S3EventRecord};
use aws_sdk_sqs::{types::DeleteMessageBatchRequestEntry, Client};
use core::time::Duration;
use s3_batch_trigger::app::App;
use s3_batch_trigger::client::{self, BatchJobApi};
use s3_batch_trigger::error::InvocationError;
use s3_batch_trigger::orchestrator::{Orchestrator, Outcome};
use std::env::var;
use tokio::time::sleep;
use tracing::{info, instrument, warn};

/// The minimum time to wait between ticks, in milliseconds.
const BASE_LAPSE_TIME: u64 = 300;

/// The base of the exponential backoff sequence.
const BACKOFF_BASE: u64 = 2;

/// The maximum amount of milliseconds to sleep between ticks. Set to
/// the equivalent of 20 minutes.
const MAX_SLEEP: u64 = 1200000;

/// Wrapper structure that executes successive SQS consumption cycles:
/// receive messages, parse the S3 notifications they carry, submit
/// jobs for their records, and finally delete messages.
struct SQSConsumer {
    queue_url: String,
    visibility_timeout: i32,
    max_number_of_messages: i32,
    client: Client,
    orchestrator: Orchestrator<BatchJobApi>,
    backoff: u32,
}

impl SQSConsumer {
    /// Record a success and wait a little while.
    async fn pass(&mut self) {
        self.backoff = 0;
        sleep(Duration::from_millis(BASE_LAPSE_TIME)).await;
    }

    /// Wait according to whether the cycle hit a retriable failure.
    async fn settle(&mut self, retriable_failure: bool) {
        if retriable_failure {
            self.fail().await
        } else {
            self.pass().await
        }
    }

    /// Record a failure and wait a while.
    async fn fail(&mut self) {
        sleep(Duration::from_millis(std::cmp::min(
            BASE_LAPSE_TIME.saturating_mul(BACKOFF_BASE.saturating_pow(self.backoff)),
            MAX_SLEEP,
        )))
        .await;
        self.backoff = self.backoff.saturating_add(1);
    }

    /// Perform a single pass of the SQS consumption cycle.
    #[instrument(skip(self))]
    pub async fn tick(&mut self) {
        let command_result = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .visibility_timeout(self.visibility_timeout)
            .max_number_of_messages(self.max_number_of_messages)
            .wait_time_seconds(20)
            .send()
            .await;
        let result = match command_result {
            Ok(result) => result,
            Err(e) => {
                warn!("Error while consuming messages from SQS queue: {:?}", e);
                return self.fail().await;
            }
        };
        let messages = result.messages().unwrap_or_default();
        if messages.is_empty() {
            return self.pass().await;
        }

        // Each message is handled on its own, so that only the ones
        // whose records were all handled get deleted. Bodies that
        // aren't notifications, such as the test event S3 sends when
        // notifications are configured, are deleted too
        let mut deletable = Vec::with_capacity(messages.len());
        let mut retriable_failure = false;
        for message in messages {
            let handled = match parse_records(message.body()) {
                Some(records) => Some(self.orchestrator.handle_records(&records).await),
                None => None,
            };
            if let Some(Err(e)) = &handled {
                retriable_failure |= e.is_retriable();
                warn!(
                    "Error encountered while handling events; SQS message {:?} won't be deleted: {}",
                    message.message_id(),
                    e
                );
            }
            if should_delete(handled.as_ref()) {
                deletable.push(
                    DeleteMessageBatchRequestEntry::builder()
                        .set_id(message.message_id().map(String::from))
                        .set_receipt_handle(message.receipt_handle().map(String::from))
                        .build(),
                );
            }
        }
        if deletable.is_empty() {
            return self.settle(retriable_failure).await;
        }

        let total = deletable.len();
        info!("Deleting {} SQS message(s)", total);
        let delete_command_result = self
            .client
            .delete_message_batch()
            .queue_url(&self.queue_url)
            .set_entries(Some(deletable))
            .send()
            .await;
        let result = match delete_command_result {
            Ok(result) => result,
            Err(e) => {
                warn!("Couldn't delete SQS messages: {:?}", e);
                return self.fail().await;
            }
        };
        if !result.failed().unwrap_or_default().is_empty() {
            let failed = result.failed().unwrap_or_default().len();
            warn!(
                "Couldn't delete some SQS messages: {:?} out of {:?} weren't deleted",
                failed, total
            );
        }
        self.settle(retriable_failure).await;
    }
}

/// Parse the S3 notification carried by an SQS message body. Bodies
/// that aren't notifications give nothing.
fn parse_records(body: Option<&str>) -> Option<Vec<S3EventRecord>> {
    let body = body?;
    serde_json::from_str::<S3Event>(body)
        .map_err(|e| {
            warn!("Couldn't parse the body of SQS message: {:?}", e);
            e
        })
        .ok()
        .map(|event| event.records)
}

/// Whether a message can be deleted after handling its records.
/// Messages that failed are kept: retriable failures are redelivered
/// once the visibility timeout lapses, and the rest reach the queue's
/// dead-letter destination through its redrive policy. Messages that
/// couldn't be parsed (`None`) are deleted.
fn should_delete(result: Option<&Result<Vec<Outcome>, InvocationError>>) -> bool {
    !matches!(result, Some(Err(_)))
}


/// Continuously consume S3 notifications from an SQS queue, and
/// submit a Batch job for each object matching the configured
/// filter. Messages whose jobs couldn't be submitted are left in the
/// queue, so that its redrive policy applies.
#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(false)
        .without_time()
        .init();
    let app = App::from_env().context("Invalid configuration")?;
    let orchestrator = app.into_orchestrator(client::init().await);

    let queue_url = var("SQS_QUEUE_URL").context("SQS_QUEUE_URL is required")?;
    let visibility_timeout = var("SQS_VISIBILITY_TIMEOUT")
        .unwrap_or(String::from("60"))
        .parse::<i32>()
        .context("SQS_VISIBILITY_TIMEOUT must be a number")?;
    let max_number_of_messages = var("SQS_MAX_NUMBER_OF_MESSAGES")
        .unwrap_or(String::from("1"))
        .parse::<i32>()
        .context("SQS_MAX_NUMBER_OF_MESSAGES must be a number")?;
    let sqs_client = Client::new(&client::sdk_config().await);

    let mut consumer = SQSConsumer {
        queue_url,
        visibility_timeout,
        max_number_of_messages,
        client: sqs_client,
        orchestrator,
        backoff: 0,
    };

    // Listen for abort signals
    let (stop_processing, mut should_stop) = tokio::sync::oneshot::channel();
    tokio::spawn(async {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("CTRL-C");
        }
        let _ = stop_processing.send(());
    });

    // Continuously receive messages and submit the corresponding
    // jobs
    loop {
        tokio::select! {
            _ = consumer.tick() => (),
            _ = &mut should_stop => break
        }
    }
    Ok(())
}
