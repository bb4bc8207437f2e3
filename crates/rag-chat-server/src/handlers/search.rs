use axum::{extract::Extension, Json};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::config::RetrievalConfig;
use crate::services::KnowledgeIndex;
use crate::utils::error::{ApiError, RetrievalError};

#[derive(Debug, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    pub threshold: Option<f32>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub results: Vec<SearchResult>,
    pub total: usize,
}

#[derive(Debug, Serialize)]
pub struct SearchResult {
    pub question: String,
    pub answer: String,
    pub similarity: f32,
}

/// Ad-hoc similarity query against the knowledge index. Never touches
/// session state.
pub async fn search_handler(
    Extension(index): Extension<Arc<KnowledgeIndex>>,
    Extension(retrieval): Extension<RetrievalConfig>,
    Json(request): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, ApiError> {
    if request.query.trim().is_empty() {
        return Err(ApiError::BadRequest("Missing query".to_string()));
    }

    info!("Ad-hoc search: {}", request.query);

    let threshold = request.threshold.unwrap_or(retrieval.similarity_threshold);
    let limit = request.limit.unwrap_or(retrieval.limit).min(50);

    let hits = index
        .search(&request.query, threshold, limit)
        .await
        .map_err(|e| match e {
            RetrievalError::Embedding(e) => ApiError::LlmError(e.to_string()),
            RetrievalError::Integrity(msg) => ApiError::InternalError(msg),
        })?;

    let results: Vec<SearchResult> = hits
        .into_iter()
        .map(|hit| SearchResult {
            question: hit.question,
            answer: hit.answer,
            similarity: hit.similarity,
        })
        .collect();

    let total = results.len();

    Ok(Json(SearchResponse { results, total }))
}
