//! Job admission (§6): `POST /api/process` for a URL/search input, and
//! `POST /api/process-local-file` for a direct upload. Both validate
//! their input, create a registry entry, and spawn the orchestrator as
//! a detached background task — admission itself never blocks on the
//! pipeline.

use axum::{
    extract::{Multipart, State},
    routing::post,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::models::{Job, ProcessOptions, SourceSpec, SubtitlePosition, VideoId};
use crate::AppState;

const ALLOWED_UPLOAD_EXTENSIONS: &[&str] =
    &["mp4", "mkv", "webm", "avi", "mov", "m4v", "mp3", "wav", "flac", "m4a", "ogg"];
const MAX_UPLOAD_BYTES: u64 = 500 * 1024 * 1024;
const UPLOAD_CHUNK_HINT: usize = 1024 * 1024;

#[derive(Debug, Deserialize)]
pub struct ProcessRequest {
    pub url: Option<String>,
    pub search: Option<String>,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default)]
    pub subtitle_position: SubtitlePosition,
    #[serde(default = "default_true")]
    pub generate_subtitles: bool,
    #[serde(default)]
    pub custom_lyrics: Option<String>,
    #[serde(default)]
    pub global_pitch: Option<f32>,
    #[serde(default = "default_subtitle_size")]
    pub final_subtitle_size: u32,
}

fn default_language() -> String {
    "auto".to_string()
}

fn default_true() -> bool {
    true
}

fn default_subtitle_size() -> u32 {
    36
}

impl ProcessRequest {
    fn into_options(self) -> ProcessOptions {
        ProcessOptions {
            language: self.language,
            subtitle_position: self.subtitle_position,
            generate_subtitles: self.generate_subtitles,
            custom_lyrics: self.custom_lyrics,
            global_pitch: self.global_pitch,
            final_subtitle_size: self.final_subtitle_size,
        }
    }

    fn source(&self) -> ApiResult<SourceSpec> {
        match (&self.url, &self.search) {
            (Some(url), _) if !url.trim().is_empty() => Ok(SourceSpec::Url(url.trim().to_string())),
            (_, Some(search)) if !search.trim().is_empty() => {
                Ok(SourceSpec::Search(search.trim().to_string()))
            }
            _ => Err(ApiError::BadRequest("one of 'url' or 'search' is required".to_string())),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ProcessAccepted {
    pub job_id: Uuid,
}

/// Admits `job` into the registry and spawns the orchestrator as a
/// detached background task, returning immediately.
async fn admit(state: &AppState, source: SourceSpec, options: ProcessOptions) -> ApiResult<Uuid> {
    options.validate().map_err(ApiError::BadRequest)?;

    let job_id = Uuid::new_v4();
    let job = Job { job_id, source, options };
    state.registry.create(job_id, "Job queued").await;

    let orchestrator = state.orchestrator.clone();
    let cancel = CancellationToken::new();
    tokio::spawn(async move {
        orchestrator.run(job_id, job, cancel).await;
    });

    Ok(job_id)
}

async fn create_process_job(
    State(state): State<AppState>,
    Json(request): Json<ProcessRequest>,
) -> ApiResult<Json<ProcessAccepted>> {
    let source = request.source()?;
    let options = request.into_options();
    let job_id = admit(&state, source, options).await?;
    Ok(Json(ProcessAccepted { job_id }))
}

fn extension_of(filename: &str) -> Option<String> {
    std::path::Path::new(filename)
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
}

async fn create_local_file_job(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> ApiResult<Json<ProcessAccepted>> {
    let mut options = ProcessOptions::default();
    let mut saved_path: Option<std::path::PathBuf> = None;

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?
    {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "file" => {
                let filename = field
                    .file_name()
                    .map(str::to_string)
                    .ok_or_else(|| ApiError::BadRequest("upload field is missing a filename".to_string()))?;
                let extension = extension_of(&filename)
                    .filter(|ext| ALLOWED_UPLOAD_EXTENSIONS.contains(&ext.as_str()))
                    .ok_or_else(|| ApiError::BadRequest(format!("unsupported file extension in '{filename}'")))?;

                let stem = std::path::Path::new(&filename)
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .unwrap_or("upload");
                let video_id = VideoId::sanitize(stem).map_err(ApiError::BadRequest)?;

                tokio::fs::create_dir_all(&state.settings.downloads_dir)
                    .await
                    .map_err(|e| ApiError::Internal(e.to_string()))?;
                let dest = state.settings.downloads_dir.join(format!("{}.{extension}", video_id.as_str()));

                let mut file = tokio::fs::File::create(&dest)
                    .await
                    .map_err(|e| ApiError::Internal(e.to_string()))?;
                let mut total: u64 = 0;
                let mut sniffed = false;
                while let Some(chunk) = field
                    .chunk(UPLOAD_CHUNK_HINT)
                    .await
                    .map_err(|e| ApiError::BadRequest(e.to_string()))?
                {
                    total += chunk.len() as u64;
                    if total > MAX_UPLOAD_BYTES {
                        drop(file);
                        let _ = tokio::fs::remove_file(&dest).await;
                        return Err(ApiError::PayloadTooLarge(format!(
                            "upload exceeds the {MAX_UPLOAD_BYTES}-byte limit"
                        )));
                    }
                    if !sniffed {
                        sniffed = true;
                        if let Some(kind) = infer::get(&chunk) {
                            let matcher = kind.matcher_type();
                            if !matches!(matcher, infer::MatcherType::Video | infer::MatcherType::Audio) {
                                drop(file);
                                let _ = tokio::fs::remove_file(&dest).await;
                                return Err(ApiError::BadRequest(format!(
                                    "uploaded content does not look like audio or video ({})",
                                    kind.mime_type()
                                )));
                            }
                        }
                    }
                    use tokio::io::AsyncWriteExt;
                    file.write_all(&chunk).await.map_err(|e| ApiError::Internal(e.to_string()))?;
                }
                saved_path = Some(dest);
            }
            "language" => options.language = field_text(field).await?,
            "subtitle_position" => {
                let value = field_text(field).await?;
                options.subtitle_position = match value.as_str() {
                    "top" => SubtitlePosition::Top,
                    _ => SubtitlePosition::Bottom,
                };
            }
            "generate_subtitles" => {
                options.generate_subtitles = field_text(field).await?.eq_ignore_ascii_case("true")
            }
            "custom_lyrics" => {
                let value = field_text(field).await?;
                options.custom_lyrics = (!value.is_empty()).then_some(value);
            }
            "global_pitch" => {
                let value = field_text(field).await?;
                options.global_pitch = value.parse().ok();
            }
            "final_subtitle_size" => {
                if let Ok(size) = field_text(field).await?.parse() {
                    options.final_subtitle_size = size;
                }
            }
            _ => {}
        }
    }

    let path = saved_path.ok_or_else(|| ApiError::BadRequest("no 'file' field in upload".to_string()))?;
    let job_id = admit(&state, SourceSpec::LocalFile(path), options).await?;
    Ok(Json(ProcessAccepted { job_id }))
}

async fn field_text(field: axum::extract::multipart::Field<'_>) -> ApiResult<String> {
    field.text().await.map_err(|e| ApiError::BadRequest(e.to_string()))
}

pub fn process_routes() -> Router<AppState> {
    Router::new()
        .route("/api/process", post(create_process_job))
        .route("/api/process-local-file", post(create_local_file_job))
}
