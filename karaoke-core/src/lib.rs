//! karaoke-core: the pipeline library and its HTTP/WebSocket boundary.

pub mod api;
pub mod cache;
pub mod config;
pub mod error;
pub mod models;
pub mod pipeline;
pub mod registry;

pub use error::{ApiError, ApiResult};

use crate::api::rate_limit::{rate_limit, ClientRateLimiter};
use crate::config::Settings;
use crate::pipeline::lyrics::LyricProvider;
use crate::pipeline::Orchestrator;
use crate::registry::ProgressRegistry;
use axum::{middleware, Router};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, services::ServeDir, trace::TraceLayer};

/// Shared state handed to every handler via axum's `with_state`.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub registry: ProgressRegistry,
    pub orchestrator: Arc<Orchestrator>,
    pub lyrics: Arc<LyricProvider>,
    pub rate_limiter: Arc<ClientRateLimiter>,
}

/// Assembles the full router: rate-limited API routes, the unthrottled
/// health and WebSocket upgrade routes (§5's bypass rule), and a
/// read-only mount over the processed-artifacts directory.
pub fn build_router(state: AppState) -> Router {
    let cors = cors_layer(&state.settings);
    let processed_dir = state.settings.processed_dir.clone();

    let rate_limited = Router::new()
        .merge(api::process_routes())
        .merge(api::suggestions_routes())
        .merge(api::genius_routes())
        .merge(api::cancel_routes())
        .route_layer(middleware::from_fn_with_state(state.clone(), rate_limit));

    let unthrottled = Router::new().merge(api::health_routes()).merge(api::ws_routes());

    Router::new()
        .merge(rate_limited)
        .merge(unthrottled)
        .nest_service("/processed", ServeDir::new(processed_dir))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(settings: &Settings) -> CorsLayer {
    let origins = settings.allowed_origins();
    if origins.iter().any(|o| o == "*") {
        CorsLayer::permissive()
    } else {
        let parsed: Vec<axum::http::HeaderValue> = origins.iter().filter_map(|o| o.parse().ok()).collect();
        CorsLayer::new().allow_origin(parsed).allow_methods(tower_http::cors::Any)
    }
}
