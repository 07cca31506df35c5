use async_trait::async_trait;
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;
use uuid::Uuid;

use crate::models::data_layer::{DataLayerRef, DataLayerStatus};
use crate::models::extraction::ExtractionResult;
use crate::models::job::{Job, JobLogEntry, JobStatus};
use crate::models::supplier::{Supplier, SupplierMatch};

pub mod queries;
pub mod supplier_queries;

/// Initialize PostgreSQL connection pool
pub async fn init_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(20)
        .min_connections(5)
        .acquire_timeout(Duration::from_secs(10))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await
}

/// Run database migrations
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| sqlx::Error::Migrate(Box::new(e)))
}

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("Database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("Job {0} not found")]
    JobNotFound(Uuid),

    #[error("Data layer {0} not found")]
    DataLayerNotFound(Uuid),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// The persistence collaborator. Everything the pipeline writes or reads
/// goes through this seam; Postgres is the production implementation and
/// tests swap in an in-memory one.
#[async_trait]
pub trait Persistence: Send + Sync {
    async fn create_job(
        &self,
        schema_id: Uuid,
        data_layer_ids: &[Uuid],
    ) -> Result<Job, PersistenceError>;

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>, PersistenceError>;

    /// Update status and optionally progress, terminal error, and a
    /// metadata patch merged over the existing metadata. Progress never
    /// decreases.
    async fn update_job_status(
        &self,
        job_id: Uuid,
        status: JobStatus,
        progress: Option<u8>,
        error: Option<&str>,
        metadata_patch: Option<serde_json::Value>,
    ) -> Result<(), PersistenceError>;

    async fn append_job_log(
        &self,
        job_id: Uuid,
        entry: JobLogEntry,
    ) -> Result<(), PersistenceError>;

    /// All data layers attached to a job, in processing order.
    async fn get_job_data_layers(
        &self,
        job_id: Uuid,
    ) -> Result<Vec<DataLayerRef>, PersistenceError>;

    /// Register a freshly uploaded file as a standalone data layer.
    async fn create_data_layer(&self, layer: &DataLayerRef) -> Result<(), PersistenceError>;

    /// Create a data layer record and attach it to the job at the given
    /// order (used for archive members).
    async fn add_data_layer_to_job(
        &self,
        job_id: Uuid,
        layer: &DataLayerRef,
        order: i32,
    ) -> Result<(), PersistenceError>;

    async fn update_data_layer_status(
        &self,
        job_id: Uuid,
        data_layer_id: Uuid,
        status: DataLayerStatus,
    ) -> Result<(), PersistenceError>;

    async fn bulk_insert_results(
        &self,
        job_id: Uuid,
        records: &[ExtractionResult],
    ) -> Result<(), PersistenceError>;

    /// Accepted results for a job, for the supplier-matching pass.
    async fn list_accepted_results(
        &self,
        job_id: Uuid,
    ) -> Result<Vec<ExtractionResult>, PersistenceError>;

    async fn list_suppliers(&self) -> Result<Vec<Supplier>, PersistenceError>;

    /// Replace the stored matches for the given results with the new pass
    /// output (at most the top 3 per result arrive here).
    async fn replace_supplier_matches(
        &self,
        job_id: Uuid,
        matches: &[SupplierMatch],
    ) -> Result<(), PersistenceError>;
}

/// Postgres-backed persistence.
pub struct PgPersistence {
    pool: PgPool,
}

impl PgPersistence {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Persistence for PgPersistence {
    async fn create_job(
        &self,
        schema_id: Uuid,
        data_layer_ids: &[Uuid],
    ) -> Result<Job, PersistenceError> {
        queries::create_job(&self.pool, schema_id, data_layer_ids).await
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>, PersistenceError> {
        queries::get_job(&self.pool, job_id).await
    }

    async fn update_job_status(
        &self,
        job_id: Uuid,
        status: JobStatus,
        progress: Option<u8>,
        error: Option<&str>,
        metadata_patch: Option<serde_json::Value>,
    ) -> Result<(), PersistenceError> {
        queries::update_job_status(&self.pool, job_id, status, progress, error, metadata_patch)
            .await
    }

    async fn append_job_log(
        &self,
        job_id: Uuid,
        entry: JobLogEntry,
    ) -> Result<(), PersistenceError> {
        queries::append_job_log(&self.pool, job_id, entry).await
    }

    async fn get_job_data_layers(
        &self,
        job_id: Uuid,
    ) -> Result<Vec<DataLayerRef>, PersistenceError> {
        queries::get_job_data_layers(&self.pool, job_id).await
    }

    async fn create_data_layer(&self, layer: &DataLayerRef) -> Result<(), PersistenceError> {
        queries::create_data_layer(&self.pool, layer).await
    }

    async fn add_data_layer_to_job(
        &self,
        job_id: Uuid,
        layer: &DataLayerRef,
        order: i32,
    ) -> Result<(), PersistenceError> {
        queries::add_data_layer_to_job(&self.pool, job_id, layer, order).await
    }

    async fn update_data_layer_status(
        &self,
        job_id: Uuid,
        data_layer_id: Uuid,
        status: DataLayerStatus,
    ) -> Result<(), PersistenceError> {
        queries::update_data_layer_status(&self.pool, job_id, data_layer_id, status).await
    }

    async fn bulk_insert_results(
        &self,
        job_id: Uuid,
        records: &[ExtractionResult],
    ) -> Result<(), PersistenceError> {
        queries::bulk_insert_results(&self.pool, job_id, records).await
    }

    async fn list_accepted_results(
        &self,
        job_id: Uuid,
    ) -> Result<Vec<ExtractionResult>, PersistenceError> {
        supplier_queries::list_accepted_results(&self.pool, job_id).await
    }

    async fn list_suppliers(&self) -> Result<Vec<Supplier>, PersistenceError> {
        supplier_queries::list_suppliers(&self.pool).await
    }

    async fn replace_supplier_matches(
        &self,
        job_id: Uuid,
        matches: &[SupplierMatch],
    ) -> Result<(), PersistenceError> {
        supplier_queries::replace_supplier_matches(&self.pool, job_id, matches).await
    }
}
