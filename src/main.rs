use anyhow::{anyhow, Context, Result};
use aws_lambda_events::event::s3::S3Event;
use lambda_runtime::{run, service_fn, LambdaEvent};
use s3_batch_trigger::app::App;
use s3_batch_trigger::client;
use s3_batch_trigger::orchestrator::Orchestrator;
use s3_batch_trigger::submit::JobApi;

/// Submit one job per matching record of an S3 notification. A
/// failed invocation should be redelivered only when its error is
/// retriable; malformed events and configuration errors belong in the
/// function's dead-letter destination.
async fn function_handler<A: JobApi>(
    orchestrator: &Orchestrator<A>,
    event: LambdaEvent<S3Event>,
) -> Result<()> {
    orchestrator
        .handle_records(&event.payload.records)
        .await
        .with_context(|| format!("Failed to handle request {:?}", event.context.request_id))?;
    Ok(())
}

/// Run an AWS Lambda function that listens to S3 object creation
/// events, and submits a Batch job for each object matching the
/// configured filter.
#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(false)
        .without_time()
        .init();
    let app = App::from_env().context("Invalid configuration")?;
    let orchestrator = app.into_orchestrator(client::init().await);
    let orchestrator = &orchestrator;

    run(service_fn(move |event| async move {
        function_handler(orchestrator, event).await
    }))
    .await
    .map_err(|e| anyhow!("{:?}", e))
}
