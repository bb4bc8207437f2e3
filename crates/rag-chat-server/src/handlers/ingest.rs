use axum::{
    extract::{Extension, Multipart},
    Json,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info};

use crate::services::KnowledgeIndex;
use crate::utils::error::ApiError;

#[derive(Debug, Serialize)]
pub struct IngestResponse {
    pub success: bool,
    pub message: String,
    pub total: usize,
}

/// Rebuild the knowledge index from an uploaded CSV. All-or-nothing:
/// a failed load leaves the previous index serving searches.
pub async fn ingest_handler(
    Extension(index): Extension<Arc<KnowledgeIndex>>,
    mut multipart: Multipart,
) -> Result<Json<IngestResponse>, ApiError> {
    info!("Knowledge base upload request received");

    let mut file_data: Option<Vec<u8>> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("Failed to read field: {}", e)))?
    {
        if field.name() == Some("file") {
            file_data = Some(
                field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::BadRequest(format!("Failed to read file: {}", e)))?
                    .to_vec(),
            );
        }
    }

    let file_data = file_data.ok_or_else(|| ApiError::BadRequest("file required".to_string()))?;

    match index.load_from_csv(&file_data).await {
        Ok(total) => {
            info!("Knowledge index replaced with {} entries", total);
            Ok(Json(IngestResponse {
                success: true,
                message: "File uploaded and processed".to_string(),
                total,
            }))
        }
        Err(e) => {
            error!("Failed to rebuild knowledge index: {}", e);
            Err(ApiError::InternalError(format!(
                "Failed to process upload: {}",
                e
            )))
        }
    }
}
