//! `GET /api/genius_candidates` (§6): ranked lyric-provider hits for a
//! title/artist pair, so the caller can offer a manual override before
//! a job commits to one.

use axum::{extract::Query, routing::get, Json, Router};
use serde::Deserialize;

use crate::pipeline::lyrics::LyricHit;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct GeniusQuery {
    pub title: String,
    pub artist: Option<String>,
}

async fn genius_candidates(
    axum::extract::State(state): axum::extract::State<AppState>,
    Query(query): Query<GeniusQuery>,
) -> Json<Vec<LyricHit>> {
    let hits = state.lyrics.search(&query.title, query.artist.as_deref()).await;
    Json(hits)
}

pub fn genius_routes() -> Router<AppState> {
    Router::new().route("/api/genius_candidates", get(genius_candidates))
}
