use anyhow::{Context, Result};
use chrono::Utc;
use s3_batch_trigger::app::App;
use s3_batch_trigger::client;
use s3_batch_trigger::orchestrator::Outcome;
use s3_batch_trigger::trigger::StorageEvent;
use std::env::var;
use tracing::info;

/// Submit the job for a single object, given as the `BUCKET` and
/// `KEY` environment variables. Useful to re-drive events that ended
/// in a dead-letter destination.
#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(false)
        .without_time()
        .init();
    let app = App::from_env().context("Invalid configuration")?;
    let orchestrator = app.into_orchestrator(client::init().await);

    let event = StorageEvent {
        bucket_name: var("BUCKET").context("BUCKET is required")?,
        object_key: var("KEY").context("KEY is required")?,
        event_timestamp: Utc::now(),
    };

    match orchestrator
        .handle_event(&event)
        .await
        .with_context(|| format!("Failed to handle event {:?}", &event))?
    {
        Outcome::Ignored | Outcome::Dropped => info!("The key doesn't match the configured filter"),
        Outcome::Submitted(result) => info!("Job {} is queued", result.job_id),
    }
    Ok(())
}
