use std::str::FromStr;

use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::db::PersistenceError;
use crate::models::data_layer::{DataLayerRef, DataLayerStatus, FileType};
use crate::models::extraction::ExtractionResult;
use crate::models::job::{Job, JobLogEntry, JobStatus};

/// Insert a new extraction job with its submitted data layers attached.
pub async fn create_job(
    pool: &PgPool,
    schema_id: Uuid,
    data_layer_ids: &[Uuid],
) -> Result<Job, PersistenceError> {
    let mut tx = pool.begin().await?;

    let row = sqlx::query(
        r#"
        INSERT INTO jobs (status, progress, schema_id)
        VALUES ('queued', 0, $1)
        RETURNING id, created_at, updated_at
        "#,
    )
    .bind(schema_id)
    .fetch_one(&mut *tx)
    .await?;

    let job_id: Uuid = row.try_get("id")?;

    for (i, layer_id) in data_layer_ids.iter().enumerate() {
        sqlx::query(
            r#"
            INSERT INTO job_data_layers (job_id, data_layer_id, ord, status)
            VALUES ($1, $2, $3, 'pending')
            "#,
        )
        .bind(job_id)
        .bind(layer_id)
        .bind(i as i32)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;

    Ok(Job {
        id: job_id,
        status: JobStatus::Queued,
        progress_percentage: 0,
        schema_id,
        data_layer_ids: data_layer_ids.to_vec(),
        log: Vec::new(),
        error: None,
        metadata: serde_json::json!({}),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Get a job by ID
pub async fn get_job(pool: &PgPool, job_id: Uuid) -> Result<Option<Job>, PersistenceError> {
    let row = sqlx::query(
        r#"
        SELECT j.id, j.status, j.progress, j.schema_id, j.error, j.metadata, j.log,
               j.created_at, j.updated_at,
               COALESCE(
                   (SELECT array_agg(jdl.data_layer_id ORDER BY jdl.ord)
                    FROM job_data_layers jdl
                    WHERE jdl.job_id = j.id),
                   '{}'
               ) AS data_layer_ids
        FROM jobs j
        WHERE j.id = $1
        "#,
    )
    .bind(job_id)
    .fetch_optional(pool)
    .await?;

    Ok(match row {
        Some(r) => {
            let status_str: String = r.try_get("status")?;
            let status = JobStatus::from_str(&status_str).unwrap_or(JobStatus::Queued);
            let progress: i32 = r.try_get("progress")?;
            let log_value: serde_json::Value = r.try_get("log")?;
            let log: Vec<JobLogEntry> = serde_json::from_value(log_value)?;

            Some(Job {
                id: r.try_get("id")?,
                status,
                progress_percentage: progress.clamp(0, 100) as u8,
                schema_id: r.try_get("schema_id")?,
                data_layer_ids: r.try_get("data_layer_ids")?,
                log,
                error: r.try_get("error")?,
                metadata: r.try_get("metadata")?,
                created_at: r.try_get("created_at")?,
                updated_at: r.try_get("updated_at")?,
            })
        }
        None => None,
    })
}

/// Update job status, progress, error and metadata patch in one statement.
/// GREATEST keeps progress monotonically non-decreasing even if a caller
/// passes a stale value.
pub async fn update_job_status(
    pool: &PgPool,
    job_id: Uuid,
    status: JobStatus,
    progress: Option<u8>,
    error: Option<&str>,
    metadata_patch: Option<serde_json::Value>,
) -> Result<(), PersistenceError> {
    sqlx::query(
        r#"
        UPDATE jobs
        SET status = $1,
            progress = GREATEST(progress, COALESCE($2, progress)),
            error = COALESCE($3, error),
            metadata = metadata || COALESCE($4, '{}'::jsonb),
            updated_at = NOW()
        WHERE id = $5
        "#,
    )
    .bind(status.to_string())
    .bind(progress.map(|p| p as i32))
    .bind(error)
    .bind(metadata_patch)
    .bind(job_id)
    .execute(pool)
    .await?;

    Ok(())
}

/// Append one entry to the job's user-visible log array.
pub async fn append_job_log(
    pool: &PgPool,
    job_id: Uuid,
    entry: JobLogEntry,
) -> Result<(), PersistenceError> {
    let entry_json = serde_json::to_value(&entry)?;
    sqlx::query(
        r#"
        UPDATE jobs
        SET log = log || $1::jsonb,
            updated_at = NOW()
        WHERE id = $2
        "#,
    )
    .bind(entry_json)
    .bind(job_id)
    .execute(pool)
    .await?;

    Ok(())
}

/// All data layers attached to a job, in processing order.
pub async fn get_job_data_layers(
    pool: &PgPool,
    job_id: Uuid,
) -> Result<Vec<DataLayerRef>, PersistenceError> {
    let rows = sqlx::query(
        r#"
        SELECT dl.id, dl.file_name, dl.file_type, dl.storage_path, dl.parent_id, jdl.status
        FROM job_data_layers jdl
        JOIN data_layers dl ON dl.id = jdl.data_layer_id
        WHERE jdl.job_id = $1
        ORDER BY jdl.ord ASC
        "#,
    )
    .bind(job_id)
    .fetch_all(pool)
    .await?;

    rows.into_iter()
        .map(|r| {
            let file_type_str: String = r.try_get("file_type")?;
            let status_str: String = r.try_get("status")?;
            Ok(DataLayerRef {
                id: r.try_get("id")?,
                file_name: r.try_get("file_name")?,
                file_type: FileType::from_str(&file_type_str).unwrap_or(FileType::Other),
                storage_path: r.try_get("storage_path")?,
                status: DataLayerStatus::from_str(&status_str).unwrap_or(DataLayerStatus::Pending),
                parent_id: r.try_get("parent_id")?,
            })
        })
        .collect()
}

/// Create a data layer record (upsert for archive members created during
/// processing) and attach it to the job.
/// Register an uploaded file as a standalone data layer, before any job
/// references it.
pub async fn create_data_layer(
    pool: &PgPool,
    layer: &DataLayerRef,
) -> Result<(), PersistenceError> {
    sqlx::query(
        r#"
        INSERT INTO data_layers (id, file_name, file_type, storage_path, parent_id)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(layer.id)
    .bind(&layer.file_name)
    .bind(layer.file_type.to_string())
    .bind(&layer.storage_path)
    .bind(layer.parent_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn add_data_layer_to_job(
    pool: &PgPool,
    job_id: Uuid,
    layer: &DataLayerRef,
    order: i32,
) -> Result<(), PersistenceError> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        INSERT INTO data_layers (id, file_name, file_type, storage_path, parent_id)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (id) DO NOTHING
        "#,
    )
    .bind(layer.id)
    .bind(&layer.file_name)
    .bind(layer.file_type.to_string())
    .bind(&layer.storage_path)
    .bind(layer.parent_id)
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        INSERT INTO job_data_layers (job_id, data_layer_id, ord, status)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (job_id, data_layer_id) DO NOTHING
        "#,
    )
    .bind(job_id)
    .bind(layer.id)
    .bind(order)
    .bind(layer.status.to_string())
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}

/// Update a data layer's per-job processing status.
pub async fn update_data_layer_status(
    pool: &PgPool,
    job_id: Uuid,
    data_layer_id: Uuid,
    status: DataLayerStatus,
) -> Result<(), PersistenceError> {
    sqlx::query(
        r#"
        UPDATE job_data_layers
        SET status = $1
        WHERE job_id = $2 AND data_layer_id = $3
        "#,
    )
    .bind(status.to_string())
    .bind(job_id)
    .bind(data_layer_id)
    .execute(pool)
    .await?;

    Ok(())
}

/// Persist a flushed buffer of extraction results in one transaction.
pub async fn bulk_insert_results(
    pool: &PgPool,
    job_id: Uuid,
    records: &[ExtractionResult],
) -> Result<(), PersistenceError> {
    let mut tx = pool.begin().await?;

    for record in records {
        sqlx::query(
            r#"
            INSERT INTO extraction_results
                (id, job_id, raw_extraction, evidence, verified_data,
                 agent_execution_metadata, status, confidence_score,
                 source_file_id, source_file_name)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(record.id)
        .bind(job_id)
        .bind(&record.raw_extraction)
        .bind(serde_json::to_value(&record.evidence)?)
        .bind(&record.verified_data)
        .bind(serde_json::to_value(&record.agent_execution_metadata)?)
        .bind(record.status.to_string())
        .bind(record.confidence_score)
        .bind(record.source_file_id)
        .bind(&record.source_file_name)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(())
}
