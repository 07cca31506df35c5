use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use garde::Validate;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::models::job::{
    Job, JobStatus, MatchKickoffResponse, SubmitJobRequest, SubmitJobResponse,
};
use crate::services::orchestrator::OrchestratorError;
use crate::services::queue::QueuedMatchJob;

/// POST /api/v1/jobs — Submit an extraction job over uploaded data layers.
///
/// Returns immediately with the queued job; extraction runs in the
/// background and is observed through the status endpoint.
pub async fn submit_job(
    State(state): State<AppState>,
    Json(request): Json<SubmitJobRequest>,
) -> Result<(StatusCode, Json<SubmitJobResponse>), (StatusCode, String)> {
    request
        .validate()
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;

    // Reject unknown schemas up front rather than failing the job later.
    state
        .schemas
        .get_and_compile_by_id(request.schema_id)
        .await
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;

    let job = state
        .orchestrator
        .submit(request.schema_id, request.data_layer_ids)
        .await
        .map_err(|e| match e {
            OrchestratorError::NoDataLayers => (StatusCode::BAD_REQUEST, e.to_string()),
            _ => {
                tracing::error!(error = %e, "Job submission failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Failed to create job".to_string(),
                )
            }
        })?;

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitJobResponse {
            job_id: job.id,
            status: job.status,
        }),
    ))
}

/// GET /api/v1/jobs/{job_id} — Job status, progress and log.
pub async fn get_job_status(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<Job>, (StatusCode, String)> {
    let job = state
        .persistence
        .get_job(job_id)
        .await
        .map_err(|e| {
            tracing::error!(job_id = %job_id, error = %e, "Failed to load job");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to load job".to_string(),
            )
        })?
        .ok_or((StatusCode::NOT_FOUND, format!("Job {job_id} not found")))?;

    Ok(Json(job))
}

/// POST /api/v1/jobs/{job_id}/match — Queue the supplier-matching pass for
/// a completed job's accepted results.
pub async fn queue_matching(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<(StatusCode, Json<MatchKickoffResponse>), (StatusCode, String)> {
    let job = state
        .persistence
        .get_job(job_id)
        .await
        .map_err(|e| {
            tracing::error!(job_id = %job_id, error = %e, "Failed to load job");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to load job".to_string(),
            )
        })?
        .ok_or((StatusCode::NOT_FOUND, format!("Job {job_id} not found")))?;

    if job.status != JobStatus::Completed {
        return Err((
            StatusCode::CONFLICT,
            format!("Job {job_id} is {}, matching needs a completed job", job.status),
        ));
    }

    let queued = QueuedMatchJob {
        job_id,
        requested_by: None,
    };
    state.queue.enqueue(&queued).await.map_err(|e| {
        tracing::error!(job_id = %job_id, error = %e, "Failed to enqueue matching job");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to queue matching".to_string(),
        )
    })?;

    metrics::counter!("matching_jobs_queued").increment(1);

    Ok((
        StatusCode::ACCEPTED,
        Json(MatchKickoffResponse {
            job_id,
            queued: true,
        }),
    ))
}
