//! Analytics query API
//!
//! Every endpoint except `/analytics/stats` answers 503 while analytics is
//! disabled.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::header,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};

use crate::analytics::export::{self, ExportFormat};
use crate::analytics::{
    AnalyticsRecord, BasicStats, EnhancedStats, SearchFilter, SearchParams, StatsParams,
};
use crate::error::{AppError, AppResult};
use crate::handlers::AppState;

/// `GET /analytics/stats`
pub async fn stats(State(state): State<AppState>) -> Json<BasicStats> {
    Json(state.analytics().stats().await)
}

/// `GET /analytics/stats/enhanced?hours=N`
pub async fn enhanced_stats(
    State(state): State<AppState>,
    Query(params): Query<StatsParams>,
) -> AppResult<Json<EnhancedStats>> {
    let stats = state.analytics().aggregate(params.hours()).await?;
    Ok(Json(stats))
}

/// `GET /analytics/messages`
pub async fn messages(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> AppResult<Json<Vec<AnalyticsRecord>>> {
    let records = state.analytics().search(SearchFilter::from(params)).await?;
    Ok(Json(records))
}

/// `GET /analytics/messages/{id}`
pub async fn message(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> AppResult<Json<AnalyticsRecord>> {
    Ok(Json(state.analytics().get(id).await?))
}

/// `GET /analytics/models`
pub async fn models(State(state): State<AppState>) -> AppResult<Json<Vec<String>>> {
    Ok(Json(state.analytics().models().await?))
}

#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub results: Vec<AnalyticsRecord>,
    pub count: usize,
}

/// `GET /analytics/search`
pub async fn search(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> AppResult<Json<SearchResponse>> {
    let results = state.analytics().search(SearchFilter::from(params)).await?;
    Ok(Json(SearchResponse {
        count: results.len(),
        results,
    }))
}

#[derive(Debug, Default, Deserialize)]
pub struct ExportParams {
    pub format: Option<String>,
    pub message_id: Option<String>,
    #[serde(flatten)]
    pub search: SearchParams,
}

/// `GET /analytics/export?format=json|csv[&message_id=N]`
///
/// Without `message_id`, exports the records matching the search parameters.
pub async fn export(
    State(state): State<AppState>,
    Query(params): Query<ExportParams>,
) -> AppResult<Response> {
    let format = ExportFormat::parse_lenient(params.format.as_deref());

    let message_id = match params.message_id.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(raw) => Some(
            raw.parse::<i64>()
                .map_err(|_| AppError::Validation("Invalid message ID".to_string()))?,
        ),
    };

    let body = match message_id {
        Some(id) => {
            let record = state.analytics().get(id).await?;
            export::render_one(&record, format)
        }
        None => {
            let records = state
                .analytics()
                .search(SearchFilter::from(params.search))
                .await?;
            tracing::info!(format = format.extension(), records = records.len(), "Exporting analytics");
            export::render(&records, format)
        }
    }
    .map_err(|e| AppError::Internal(format!("Failed to render export: {}", e)))?;

    Ok((
        [
            (header::CONTENT_TYPE, format.content_type().to_string()),
            (
                header::CONTENT_DISPOSITION,
                export::content_disposition(format, message_id),
            ),
        ],
        body,
    )
        .into_response())
}
