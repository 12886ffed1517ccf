//! `POST /api/cancel_job` (§6): signals the registered cancellation
//! token for a job and marks it terminal in the registry.

use axum::{
    extract::{Query, State},
    routing::post,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct CancelQuery {
    pub job_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub status: &'static str,
    pub job_id: Uuid,
}

async fn cancel_job(
    State(state): State<AppState>,
    Query(query): Query<CancelQuery>,
) -> ApiResult<Json<CancelResponse>> {
    if !state.registry.exists(query.job_id).await {
        return Err(ApiError::NotFound(format!("no job with id {}", query.job_id)));
    }
    state.registry.cancel(query.job_id).await;
    Ok(Json(CancelResponse { status: "cancellation_requested", job_id: query.job_id }))
}

pub fn cancel_routes() -> Router<AppState> {
    Router::new().route("/api/cancel_job", post(cancel_job))
}
