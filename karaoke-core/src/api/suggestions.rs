//! `GET /api/suggestions` (§6): metadata-only search results for the
//! input box, backed by the fetcher's best-effort lookup.

use axum::{extract::Query, routing::get, Json, Router};
use serde::Deserialize;

use crate::pipeline::fetcher::{self, SuggestionItem};
use crate::AppState;

const DEFAULT_MAX_RESULTS: u32 = 5;

#[derive(Debug, Deserialize)]
pub struct SuggestionsQuery {
    pub q: String,
    pub max_results: Option<u32>,
}

async fn suggestions(Query(query): Query<SuggestionsQuery>) -> Json<Vec<SuggestionItem>> {
    let max_results = query.max_results.unwrap_or(DEFAULT_MAX_RESULTS).clamp(1, 25);
    Json(fetcher::suggestions(&query.q, max_results).await)
}

pub fn suggestions_routes() -> Router<AppState> {
    Router::new().route("/api/suggestions", get(suggestions))
}
