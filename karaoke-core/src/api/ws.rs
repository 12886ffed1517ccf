//! `WS /api/ws/progress/{job_id}` (§6): push-on-change progress frames.
//!
//! Deliberately polls the progress registry directly rather than
//! subscribing to the event bus — `karaoke_common::events` documents
//! that bus as an auxiliary observer channel, not the source of truth
//! for this per-job contract.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::Response,
    routing::get,
    Router,
};
use serde::Serialize;
use serde_json::json;
use std::time::Duration;
use uuid::Uuid;

use crate::AppState;

const POLL_INTERVAL: Duration = Duration::from_millis(300);

#[derive(Debug, Serialize)]
struct ProgressFrame {
    progress: u8,
    message: String,
    stage: String,
    is_step_start: bool,
    error: bool,
}

pub async fn progress_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, job_id))
}

async fn handle_socket(mut socket: WebSocket, state: AppState, job_id: Uuid) {
    let Some(mut last) = state.registry.get(job_id).await else {
        let frame = json!({ "progress": 100, "message": "Job not found", "error": true });
        let _ = socket.send(Message::Text(frame.to_string())).await;
        let _ = socket
            .send(Message::Close(Some(axum::extract::ws::CloseFrame {
                code: axum::extract::ws::close_code::POLICY,
                reason: "job not found".into(),
            })))
            .await;
        return;
    };

    if send_frame(&mut socket, &last, false).await.is_err() {
        return;
    }
    if last.progress >= 100 {
        return;
    }

    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    loop {
        ticker.tick().await;
        let Some(current) = state.registry.get(job_id).await else {
            break;
        };
        let changed = current.progress != last.progress
            || current.message != last.message
            || current.is_step_start != last.is_step_start;
        if changed {
            if send_frame(&mut socket, &current, false).await.is_err() {
                break;
            }
            last = current;
        }
        if last.progress >= 100 {
            break;
        }
    }
}

async fn send_frame(
    socket: &mut WebSocket,
    state: &crate::models::JobState,
    error: bool,
) -> Result<(), axum::Error> {
    let frame = ProgressFrame {
        progress: state.progress,
        message: state.message.clone(),
        stage: state.stage.clone(),
        is_step_start: state.is_step_start,
        error: error || state.message.to_lowercase().contains("error"),
    };
    socket.send(Message::Text(serde_json::to_string(&frame).unwrap_or_default())).await
}

pub fn ws_routes() -> Router<AppState> {
    Router::new().route("/api/ws/progress/:job_id", get(progress_ws))
}
