use std::str::FromStr;

use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::db::PersistenceError;
use crate::models::extraction::{Evidence, ExtractionResult, ResultStatus};
use crate::models::supplier::{Supplier, SupplierMatch};

/// Accepted results for a job, in insertion order. These are the inputs to
/// a supplier-matching pass.
pub async fn list_accepted_results(
    pool: &PgPool,
    job_id: Uuid,
) -> Result<Vec<ExtractionResult>, PersistenceError> {
    let rows = sqlx::query(
        r#"
        SELECT id, job_id, raw_extraction, evidence, verified_data,
               agent_execution_metadata, status, confidence_score,
               source_file_id, source_file_name
        FROM extraction_results
        WHERE job_id = $1 AND status = 'accepted'
        ORDER BY created_at ASC
        "#,
    )
    .bind(job_id)
    .fetch_all(pool)
    .await?;

    rows.into_iter()
        .map(|r| {
            let status_str: String = r.try_get("status")?;
            let evidence_value: serde_json::Value = r.try_get("evidence")?;
            let evidence: Evidence = serde_json::from_value(evidence_value)?;
            let metadata_value: serde_json::Value = r.try_get("agent_execution_metadata")?;

            Ok(ExtractionResult {
                id: r.try_get("id")?,
                job_id: r.try_get("job_id")?,
                raw_extraction: r.try_get("raw_extraction")?,
                evidence,
                verified_data: r.try_get("verified_data")?,
                agent_execution_metadata: serde_json::from_value(metadata_value)?,
                status: ResultStatus::from_str(&status_str).unwrap_or(ResultStatus::Accepted),
                confidence_score: r.try_get("confidence_score")?,
                source_file_id: r.try_get("source_file_id")?,
                source_file_name: r.try_get("source_file_name")?,
            })
        })
        .collect()
}

/// The organization's full supplier catalogue.
pub async fn list_suppliers(pool: &PgPool) -> Result<Vec<Supplier>, PersistenceError> {
    let rows = sqlx::query(
        r#"
        SELECT id, name, materials_offered, contact_email, city
        FROM suppliers
        ORDER BY name ASC
        "#,
    )
    .fetch_all(pool)
    .await?;

    rows.into_iter()
        .map(|r| {
            Ok(Supplier {
                id: r.try_get("id")?,
                name: r.try_get("name")?,
                materials_offered: r.try_get("materials_offered")?,
                contact_email: r.try_get("contact_email")?,
                city: r.try_get("city")?,
            })
        })
        .collect()
}

/// Replace the matches for all of a job's results with the output of a new
/// pass. Old matches go first so a re-run never accumulates stale rows.
pub async fn replace_supplier_matches(
    pool: &PgPool,
    job_id: Uuid,
    matches: &[SupplierMatch],
) -> Result<(), PersistenceError> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        DELETE FROM supplier_matches
        WHERE extraction_result_id IN
            (SELECT id FROM extraction_results WHERE job_id = $1)
        "#,
    )
    .bind(job_id)
    .execute(&mut *tx)
    .await?;

    for m in matches {
        sqlx::query(
            r#"
            INSERT INTO supplier_matches
                (extraction_result_id, supplier_id, confidence_score, match_reason, is_selected)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(m.extraction_result_id)
        .bind(m.supplier_id)
        .bind(m.confidence_score)
        .bind(&m.match_reason)
        .bind(m.is_selected)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(())
}
