//! Supplier-matching worker.
//!
//! Consumes queued matching jobs from Redis, runs the chunked matching
//! pass over a job's accepted extraction results, and replaces the stored
//! matches wholesale. Matching runs out of band from extraction on
//! purpose: results need human review before they are worth matching.

use std::sync::Arc;
use std::time::Duration;

use docpipe::{
    config::AppConfig,
    db::{self, Persistence, PgPersistence},
    models::job::JobLogEntry,
    services::{
        matching::SupplierMatcher,
        model::WorkersAiClient,
        queue::{MatchQueue, QueuedMatchJob},
    },
};
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;

const MAX_RETRIES: u32 = 3;
const POLL_INTERVAL_MS: u64 = 1000; // 1 second

struct WorkerContext {
    persistence: Arc<dyn Persistence>,
    queue: MatchQueue,
    matcher: SupplierMatcher,
}

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting supplier matching worker");

    // Load configuration
    let config = AppConfig::from_env().expect("Failed to load configuration");

    // Initialize database
    tracing::info!("Connecting to PostgreSQL");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    // Initialize services
    tracing::info!("Initializing services");
    let queue = MatchQueue::new(&config.redis_url).expect("Failed to initialize match queue");
    let model = Arc::new(WorkersAiClient::new(
        config.cf_account_id.clone(),
        config.cf_api_token.clone(),
    ));

    let ctx = WorkerContext {
        persistence: Arc::new(PgPersistence::new(db_pool)),
        queue,
        matcher: SupplierMatcher::new(model),
    };

    tracing::info!("Worker ready, starting matching loop");

    let mut retry_counts: std::collections::HashMap<uuid::Uuid, u32> =
        std::collections::HashMap::new();

    // Main processing loop
    loop {
        match process_next_job(&ctx, &mut retry_counts).await {
            Ok(true) => {
                tracing::debug!("Matching job processed, checking for next job");
            }
            Ok(false) => {
                tracing::trace!("No matching jobs available, sleeping");
                sleep(Duration::from_millis(POLL_INTERVAL_MS)).await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Error processing matching job, will retry");
                sleep(Duration::from_millis(POLL_INTERVAL_MS)).await;
            }
        }
    }
}

/// Process the next matching job from the queue.
/// Returns Ok(true) if a job was processed, Ok(false) if no job available.
async fn process_next_job(
    ctx: &WorkerContext,
    retry_counts: &mut std::collections::HashMap<uuid::Uuid, u32>,
) -> Result<bool, Box<dyn std::error::Error>> {
    let job = match ctx.queue.dequeue().await? {
        Some(j) => j,
        None => return Ok(false),
    };

    tracing::info!(job_id = %job.job_id, "Processing supplier matching job");

    match run_matching(ctx, &job).await {
        Ok(match_count) => {
            ctx.queue.complete(&job).await?;
            retry_counts.remove(&job.job_id);

            ctx.persistence
                .append_job_log(
                    job.job_id,
                    JobLogEntry::info(format!("Supplier matching stored {match_count} match(es)")),
                )
                .await?;

            tracing::info!(
                job_id = %job.job_id,
                matches = match_count,
                "Matching job completed"
            );
            Ok(true)
        }
        Err(e) => {
            tracing::error!(job_id = %job.job_id, error = %e, "Matching job failed");

            let retries = retry_counts.entry(job.job_id).or_insert(0);
            *retries += 1;

            if *retries >= MAX_RETRIES {
                ctx.queue.complete(&job).await?;
                retry_counts.remove(&job.job_id);

                ctx.persistence
                    .append_job_log(
                        job.job_id,
                        JobLogEntry::error(format!(
                            "Supplier matching failed after {MAX_RETRIES} attempts: {e}"
                        )),
                    )
                    .await?;

                tracing::warn!(job_id = %job.job_id, "Matching job dropped after max retries");
            } else {
                // Re-queue for another attempt
                ctx.queue.enqueue(&job).await?;
                ctx.queue.complete(&job).await?;

                tracing::info!(
                    job_id = %job.job_id,
                    retry = *retries,
                    "Matching job re-queued for retry"
                );
            }

            Ok(true)
        }
    }
}

/// Run one matching pass and replace the stored matches for the job.
async fn run_matching(
    ctx: &WorkerContext,
    job: &QueuedMatchJob,
) -> Result<usize, Box<dyn std::error::Error>> {
    let results = ctx.persistence.list_accepted_results(job.job_id).await?;
    if results.is_empty() {
        tracing::info!(job_id = %job.job_id, "No accepted results to match");
        ctx.persistence
            .replace_supplier_matches(job.job_id, &[])
            .await?;
        return Ok(0);
    }

    let suppliers = ctx.persistence.list_suppliers().await?;
    if suppliers.is_empty() {
        tracing::warn!(job_id = %job.job_id, "Supplier catalogue is empty, nothing to match");
        ctx.persistence
            .replace_supplier_matches(job.job_id, &[])
            .await?;
        return Ok(0);
    }

    tracing::info!(
        job_id = %job.job_id,
        results = results.len(),
        suppliers = suppliers.len(),
        "Running supplier matching"
    );

    let start = std::time::Instant::now();
    let outcome = ctx.matcher.match_results(&results, &suppliers).await;

    if !outcome.failed_chunks.is_empty() {
        tracing::warn!(
            job_id = %job.job_id,
            failed_chunks = outcome.failed_chunks.len(),
            "Some matching chunks failed, their results have no matches"
        );
        ctx.persistence
            .append_job_log(
                job.job_id,
                JobLogEntry::warning(format!(
                    "{} matching chunk(s) failed, affected results have no matches",
                    outcome.failed_chunks.len()
                )),
            )
            .await?;
    }

    // Full replace: a re-run always reflects the current catalogue.
    ctx.persistence
        .replace_supplier_matches(job.job_id, &outcome.matches)
        .await?;

    metrics::histogram!("matching_pass_seconds").record(start.elapsed().as_secs_f64());

    Ok(outcome.matches.len())
}
