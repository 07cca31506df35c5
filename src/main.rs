mod app_state;
mod config;
mod db;
mod models;
mod routes;
mod services;

use axum::{routing::get, routing::post, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use std::time::Duration;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use app_state::AppState;
use config::AppConfig;
use db::PgPersistence;
use services::{
    agents::AgentPipeline,
    model::WorkersAiClient,
    orchestrator::{Orchestrator, OrchestratorConfig},
    pdf::PdfBatchExtractor,
    queue::MatchQueue,
    schema::PgSchemaProvider,
    storage::R2Client,
};
use services::archive::ZipExpander;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing docpipe server");

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);

    // Register application metrics
    metrics::describe_histogram!(
        "extraction_job_seconds",
        "Time to process one extraction job end to end"
    );
    metrics::describe_counter!(
        "extraction_jobs_submitted",
        "Total extraction jobs submitted"
    );
    metrics::describe_counter!(
        "extraction_jobs_completed",
        "Total extraction jobs completed"
    );
    metrics::describe_counter!("extraction_jobs_failed", "Total extraction jobs that failed");
    metrics::describe_counter!(
        "extraction_batches_failed",
        "Page batches the model failed on"
    );
    metrics::describe_counter!(
        "matching_jobs_queued",
        "Supplier matching passes queued over completed jobs"
    );
    metrics::describe_counter!(
        "matching_chunks_failed",
        "Supplier matching chunks that failed"
    );

    // Initialize database connection pool
    tracing::info!("Connecting to PostgreSQL database");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    // Run database migrations
    tracing::info!("Running database migrations");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");

    // Initialize R2 storage client
    tracing::info!("Initializing R2 storage client");
    let storage = Arc::new(
        R2Client::new(
            &config.r2_bucket,
            &config.r2_endpoint,
            &config.r2_access_key,
            &config.r2_secret_key,
        )
        .expect("Failed to initialize R2 client"),
    );

    // Initialize Redis matching queue
    tracing::info!("Connecting to Redis matching queue");
    let queue =
        Arc::new(MatchQueue::new(&config.redis_url).expect("Failed to initialize match queue"));

    // Initialize Workers AI client
    tracing::info!("Initializing Cloudflare Workers AI client");
    let model: Arc<dyn services::model::ModelClient> = Arc::new(WorkersAiClient::new(
        config.cf_account_id.clone(),
        config.cf_api_token.clone(),
    ));

    let persistence = Arc::new(PgPersistence::new(db_pool.clone()));
    let schemas = Arc::new(PgSchemaProvider::new(db_pool.clone()));
    let _cache_sweeper = schemas.start_cache_sweeper();

    let orchestrator = Arc::new(Orchestrator::new(
        persistence.clone(),
        storage.clone(),
        schemas.clone(),
        Arc::new(ZipExpander),
        PdfBatchExtractor::new(model.clone()),
        AgentPipeline::new(model.clone()),
        OrchestratorConfig {
            flush_size: config.result_flush_size,
            job_deadline: Duration::from_secs(config.job_deadline_secs),
        },
    ));

    // Create shared application state
    let state = AppState::new(
        db_pool,
        persistence,
        storage,
        queue,
        schemas,
        orchestrator,
    );

    // Build API routes
    let app = Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/api/v1/data-layers", post(routes::upload::upload_data_layer))
        .route("/api/v1/jobs", post(routes::jobs::submit_job))
        .route("/api/v1/jobs/{job_id}", get(routes::jobs::get_job_status))
        .route(
            "/api/v1/jobs/{job_id}/match",
            post(routes::jobs::queue_matching),
        )
        .with_state(state)
        // Prometheus metrics endpoint (separate state)
        .route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state(prometheus_handle),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(50 * 1024 * 1024)); // 50 MB: zip uploads

    tracing::info!("Starting docpipe on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app).await.expect("Server error");
}
