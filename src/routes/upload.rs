use axum::extract::{Multipart, State};
use axum::http::StatusCode;
use axum::Json;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::models::data_layer::{DataLayerRef, DataLayerStatus, FileType, UploadResponse};

/// POST /api/v1/data-layers — Upload a source file (pdf or zip) to object
/// storage and register it as a data layer for later job submission.
pub async fn upload_data_layer(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<UploadResponse>), (StatusCode, String)> {
    let mut upload: Option<(String, Vec<u8>)> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?
    {
        if field.name() == Some("file") {
            let file_name = field
                .file_name()
                .map(str::to_string)
                .ok_or((StatusCode::BAD_REQUEST, "Missing file name".to_string()))?;
            let data = field
                .bytes()
                .await
                .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
            upload = Some((file_name, data.to_vec()));
        }
    }

    let (file_name, data) =
        upload.ok_or((StatusCode::BAD_REQUEST, "Missing 'file' field".to_string()))?;
    if data.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "Empty file".to_string()));
    }

    let file_type = FileType::from_name(&file_name);
    let content_type = match file_type {
        FileType::Pdf => "application/pdf",
        FileType::Zip => "application/zip",
        FileType::Other => "application/octet-stream",
    };

    let layer_id = Uuid::new_v4();
    let path = format!("uploads/{layer_id}/{file_name}");
    let storage_path = state
        .storage
        .put_bytes(&path, &data, content_type)
        .await
        .map_err(|e| {
            tracing::error!(file = %file_name, error = %e, "Upload to object storage failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to store file".to_string(),
            )
        })?;

    let layer = DataLayerRef {
        id: layer_id,
        file_name: file_name.clone(),
        file_type,
        storage_path,
        status: DataLayerStatus::Pending,
        parent_id: None,
    };
    state.persistence.create_data_layer(&layer).await.map_err(|e| {
        tracing::error!(file = %file_name, error = %e, "Failed to register data layer");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to register file".to_string(),
        )
    })?;

    tracing::info!(
        data_layer_id = %layer_id,
        file = %file_name,
        size_bytes = data.len(),
        "Data layer uploaded"
    );

    Ok((
        StatusCode::CREATED,
        Json(UploadResponse {
            data_layer_id: layer_id,
            file_name,
            file_type,
        }),
    ))
}
