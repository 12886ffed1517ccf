//! Job orchestrator (C12): drives the linear stage pipeline end to end,
//! grounded on the teacher's `import_v2::session_orchestrator`
//! phase-sequencing shape and the original's `processing.py`
//! `run_step`/cleanup-on-failure pattern.

use crate::cache::{hash_file, CacheStore};
use crate::config::Settings;
use crate::error::StageError;
use crate::models::{
    AudioAnalysisCache, Job, JobResult, KaraokeSegment, ProcessOptions, SourceSpec, StemsCache,
    TranscriptionCache, VideoId,
};
use crate::pipeline::lyrics::LyricProvider;
use crate::pipeline::recognizer::RecognizerHandle;
use crate::pipeline::separator::{SeparatorConfig, StemPaths};
use crate::pipeline::{alignment, analyzer, extractor, fetcher, muxer, separator, subtitles};
use crate::registry::ProgressRegistry;
use karaoke_common::{EventBus, JobEvent};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Everything a single job run needs; built once per job from config
/// and shared collaborators.
#[derive(Clone)]
pub struct Orchestrator {
    registry: ProgressRegistry,
    settings: Arc<Settings>,
    cache: Arc<CacheStore>,
    lyrics: Arc<LyricProvider>,
    recognizer: RecognizerHandle,
    job_semaphore: Arc<Semaphore>,
    events: Arc<EventBus>,
}

/// Stem audio paths once relocated into the cache's flat per-video
/// layout (instrumental + vocals only — the per-stem raw files demucs
/// produced are transient working files, not part of the cache contract).
struct CachedStemPaths {
    instrumental: PathBuf,
    vocals: PathBuf,
}

impl Orchestrator {
    pub fn new(
        registry: ProgressRegistry,
        settings: Arc<Settings>,
        lyrics: Arc<LyricProvider>,
        recognizer: RecognizerHandle,
        events: Arc<EventBus>,
    ) -> Self {
        let cache = Arc::new(CacheStore::new(settings.processed_dir.clone()));
        let job_semaphore = Arc::new(Semaphore::new(settings.max_concurrent_jobs));
        Self { registry, settings, cache, lyrics, recognizer, job_semaphore, events }
    }

    /// Runs `job` to completion, writing every progress transition into
    /// the registry. Never returns an error: failures are terminal
    /// registry states, not propagated to the caller (this is spawned
    /// as a detached background task by the admission handler).
    pub async fn run(&self, job_id: Uuid, job: Job, cancel: CancellationToken) {
        self.registry.register_task(job_id, Arc::new(cancel.clone())).await;
        self.events.publish(JobEvent::JobCreated { job_id, message: "queued".to_string() });

        let mut video_id: Option<VideoId> = None;
        let result = self.run_inner(job_id, &job, &cancel, &mut video_id).await;

        match result {
            Ok(job_result) => {
                self.registry
                    .update(
                        job_id,
                        100,
                        "Karaoke video created successfully!",
                        false,
                        Some(job_result),
                        Some("finalize"),
                    )
                    .await;
                self.events.publish(JobEvent::Completed { job_id });
            }
            Err(StageError::Cancelled) => {
                info!(%job_id, "job pipeline observed cancellation");
                self.events.publish(JobEvent::Cancelled { job_id });
            }
            Err(e) => {
                error!(%job_id, error = %e, "job pipeline failed");
                self.registry.update(job_id, 100, e.surface(), false, None, None).await;
                self.events.publish(JobEvent::Failed {
                    job_id,
                    stage: "unknown".to_string(),
                    message: e.surface(),
                });
            }
        }

        let state = self.registry.get(job_id).await;
        let succeeded = state.map(|s| s.result.is_some()).unwrap_or(false);
        if !succeeded {
            if let Some(vid) = &video_id {
                self.cleanup_failed_job(vid).await;
            } else {
                warn!(%job_id, "job failed before video_id was determined; skipping cleanup");
            }
        }
    }

    /// Runs one stage: cancellation check, start event, the stage body,
    /// then an end or error event (§4.11's per-stage lifecycle).
    async fn run_stage<T, F, Fut>(
        &self,
        job_id: Uuid,
        cancel: &CancellationToken,
        stage: &str,
        body: F,
    ) -> Result<T, StageError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, StageError>>,
    {
        if cancel.is_cancelled() {
            return Err(StageError::Cancelled);
        }
        let start = crate::registry::stage_progress_to_global(stage, 0);
        let label = stage.replace('_', " ");
        self.registry.update(job_id, start, format!("Starting: {label}..."), true, None, Some(stage)).await;
        self.events.publish(JobEvent::Progress {
            job_id,
            progress: start,
            message: format!("Starting: {label}..."),
            is_step_start: true,
            step_name: Some(stage.to_string()),
        });

        let outcome = body().await;

        if cancel.is_cancelled() {
            return Err(StageError::Cancelled);
        }

        match outcome {
            Ok(value) => {
                let end = crate::registry::stage_progress_to_global(stage, 100);
                self.registry.update(job_id, end, format!("Completed: {label}"), false, None, Some(stage)).await;
                self.events.publish(JobEvent::Progress {
                    job_id,
                    progress: end,
                    message: format!("Completed: {label}"),
                    is_step_start: false,
                    step_name: Some(stage.to_string()),
                });
                Ok(value)
            }
            Err(e) => {
                self.registry.update(job_id, 100, e.surface(), false, None, Some(&format!("{stage}_error"))).await;
                self.events.publish(JobEvent::Failed {
                    job_id,
                    stage: stage.to_string(),
                    message: e.surface(),
                });
                Err(e)
            }
        }
    }

    async fn skip_stage(&self, job_id: Uuid, stage: &str, reason: &str) {
        let end = crate::registry::stage_progress_to_global(stage, 100);
        self.registry.update(job_id, end, format!("Skipped: {reason}"), false, None, Some(stage)).await;
    }

    async fn run_inner(
        &self,
        job_id: Uuid,
        job: &Job,
        cancel: &CancellationToken,
        video_id_out: &mut Option<VideoId>,
    ) -> Result<JobResult, StageError> {
        let (video_id, video_path, title, uploader) = self.resolve_input(job_id, job, cancel).await?;
        *video_id_out = Some(video_id.clone());

        let audio_path = self
            .run_stage(job_id, cancel, "extract_audio", || {
                extractor::extract_audio(&video_path, video_id.as_str(), &self.settings.downloads_dir)
            })
            .await?;

        let analysis = self
            .run_stage(job_id, cancel, "analyze_audio", || self.analyze_with_cache(&video_id, &audio_path))
            .await
            .unwrap_or_else(|_| analyzer::AnalysisResult::empty());

        // Heavyweight stages wait for a concurrency-cap permit; request
        // admission itself (everything above) never blocks on it.
        let _permit = self.job_semaphore.acquire().await.expect("semaphore not closed");

        let stems = self
            .run_stage(job_id, cancel, "separate_tracks", || self.separate_with_cache(&video_id, &audio_path))
            .await?;

        let karaoke_segments = if job.options.generate_subtitles {
            let recognized = self
                .run_stage(job_id, cancel, "transcribe", || {
                    self.transcribe_with_record(&video_id, &stems.vocals, &job.options)
                })
                .await?;

            if recognized.is_empty() {
                self.skip_stage(job_id, "process_lyrics", "no transcription").await;
                self.skip_stage(job_id, "generate_subtitles", "no transcription").await;
                Vec::new()
            } else {
                self.run_stage(job_id, cancel, "process_lyrics", || {
                    self.select_lyrics(&job.options, &title, &uploader, &recognized)
                })
                .await?
            }
        } else {
            self.skip_stage(job_id, "transcribe", "subtitles disabled").await;
            self.skip_stage(job_id, "process_lyrics", "subtitles disabled").await;
            self.skip_stage(job_id, "generate_subtitles", "subtitles disabled").await;
            Vec::new()
        };

        let subtitle_path = if !karaoke_segments.is_empty() {
            self.run_stage(job_id, cancel, "generate_subtitles", || {
                self.write_subtitles(&video_id, &karaoke_segments, &job.options)
            })
            .await
            .ok()
        } else {
            None
        };

        let pitch = match job.options.global_pitch {
            Some(p) => muxer::PitchMode::Global(p),
            None => muxer::PitchMode::None,
        };

        let processed_video_path = self
            .run_stage(job_id, cancel, "merge", || {
                self.merge(&video_id, &video_path, &stems.instrumental, subtitle_path.as_deref(), pitch)
            })
            .await?;

        self.run_stage(job_id, cancel, "finalize", || {
            self.finalize(&video_id, &processed_video_path, &title, &analysis)
        })
        .await
    }

    /// Determines `video_id`/local path/title/uploader, either via the
    /// fetcher (URL or search input) or by validating a local upload
    /// (§4.11's "import local file" step 1 substitution).
    async fn resolve_input(
        &self,
        job_id: Uuid,
        job: &Job,
        cancel: &CancellationToken,
    ) -> Result<(VideoId, PathBuf, String, String), StageError> {
        match &job.source {
            SourceSpec::LocalFile(path) => {
                if cancel.is_cancelled() {
                    return Err(StageError::Cancelled);
                }
                let start = crate::registry::stage_progress_to_global("download", 0);
                self.registry.update(job_id, start, "Processing local file...", true, None, Some("download")).await;

                if !path.is_file() {
                    let e = StageError::Generic(format!("local file not found: {}", path.display()));
                    self.registry.update(job_id, 100, e.surface(), false, None, Some("download_error")).await;
                    return Err(e);
                }
                let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("upload");
                let video_id = VideoId::sanitize(stem)
                    .map_err(|e| StageError::Generic(format!("invalid local file name: {e}")))?;
                let title = path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();

                let end = crate::registry::stage_progress_to_global("download", 100);
                self.registry.update(job_id, end, "Local file provided", false, None, Some("download")).await;
                Ok((video_id, path.clone(), title, "Local Upload".to_string()))
            }
            SourceSpec::Url(url) => self.fetch_remote(job_id, url, cancel).await,
            SourceSpec::Search(query) => self.fetch_remote(job_id, query, cancel).await,
        }
    }

    async fn fetch_remote(
        &self,
        job_id: Uuid,
        input: &str,
        cancel: &CancellationToken,
    ) -> Result<(VideoId, PathBuf, String, String), StageError> {
        let config = fetcher::FetcherConfig {
            socket_timeout_secs: self.settings.ytdlp_socket_timeout_secs,
            retries: self.settings.ytdlp_retries,
        };
        let downloads_dir = self.settings.downloads_dir.clone();
        let result = self
            .run_stage(job_id, cancel, "download", || fetcher::fetch(input, &downloads_dir, &config))
            .await?;
        let video_id = VideoId::new(&result.video_id)
            .map_err(|e| StageError::Generic(format!("fetcher returned invalid video id: {e}")))?;
        Ok((video_id, result.local_path, result.title, result.uploader))
    }

    /// Audio analysis cache read-through (§4.6): a hit skips the decode
    /// and Goertzel/autocorrelation work entirely.
    async fn analyze_with_cache(
        &self,
        video_id: &VideoId,
        audio_path: &Path,
    ) -> Result<analyzer::AnalysisResult, StageError> {
        let metadata = self.cache.read_metadata(video_id).await;
        if let Some(cached) = CacheStore::analysis(&metadata) {
            return Ok(analyzer::AnalysisResult {
                bpm: cached.bpm,
                key: cached.key.clone(),
                key_confidence: cached.key_confidence,
            });
        }

        let result = analyzer::analyze(audio_path).await;
        if result.bpm.is_some() || result.key.is_some() {
            let mut metadata = metadata;
            metadata.audio_analysis = Some(AudioAnalysisCache {
                bpm: result.bpm,
                key: result.key.clone(),
                key_confidence: result.key_confidence,
            });
            let _ = self.cache.write_metadata(video_id, &metadata).await;
        }
        Ok(result)
    }

    /// Stem separation cache read-through (§4.4): a hit skips the
    /// demucs subprocess and ffmpeg mixdown entirely.
    async fn separate_with_cache(&self, video_id: &VideoId, audio_path: &Path) -> Result<CachedStemPaths, StageError> {
        let input_hash = hash_file(audio_path)
            .await
            .map_err(|e| StageError::SeparationFailed(e.to_string()))?;
        let current = StemsCache {
            model: self.settings.demucs_model.clone(),
            library_version: env!("CARGO_PKG_VERSION").to_string(),
            input_audio_sha256: input_hash,
        };
        let metadata = self.cache.read_metadata(video_id).await;

        let instrumental_path = self.cache.instrumental_path(video_id);
        let vocals_path = self.cache.vocals_path(video_id);

        if self.cache.stems_valid(video_id, &current, &metadata).await {
            info!(video_id = %video_id, "stem separation cache hit");
            return Ok(CachedStemPaths { instrumental: instrumental_path, vocals: vocals_path });
        }

        let work_dir = self.cache.video_dir(video_id).join("stem_work");
        let config = SeparatorConfig {
            model: self.settings.demucs_model.clone(),
            device: self.settings.device.clone(),
            timeout: Duration::from_secs(self.settings.demucs_timeout_secs),
            wait_timeout: Duration::from_secs(self.settings.demucs_wait_timeout_secs),
            check_interval: Duration::from_millis(self.settings.demucs_check_interval_ms),
        };
        let stems: StemPaths = separator::separate(audio_path, &work_dir, &config).await?;
        separator::mix_instrumental(&stems, &instrumental_path).await?;
        tokio::fs::copy(&stems.vocals, &vocals_path)
            .await
            .map_err(|e| StageError::SeparationFailed(e.to_string()))?;

        let mut metadata = metadata;
        metadata.stems = Some(current);
        let _ = self.cache.write_metadata(video_id, &metadata).await;

        Ok(CachedStemPaths { instrumental: instrumental_path, vocals: vocals_path })
    }

    /// Transcribes, then records the identity tuple used (§4.5's cache
    /// metadata bookkeeping); unlike stems/analysis this never short
    /// circuits on the recorded identity, since no prior run persists
    /// the segments themselves to reload.
    async fn transcribe_with_record(
        &self,
        video_id: &VideoId,
        vocals_path: &Path,
        options: &ProcessOptions,
    ) -> Result<Vec<KaraokeSegment>, StageError> {
        let segments = self
            .recognizer
            .transcribe(vocals_path, Some(options.language.as_str()), None)
            .await?;

        let mut metadata = self.cache.read_metadata(video_id).await;
        metadata.transcription = Some(TranscriptionCache {
            model: self.settings.whisper_model_tag.clone(),
            library_version: env!("CARGO_PKG_VERSION").to_string(),
            language: options.language.clone(),
        });
        let _ = self.cache.write_metadata(video_id, &metadata).await;

        Ok(segments)
    }

    /// Lyric-selection policy (§4.11): custom lyrics first, then the
    /// lyric provider, then recognized speech pass-through.
    async fn select_lyrics(
        &self,
        options: &ProcessOptions,
        title: &str,
        uploader: &str,
        recognized: &[KaraokeSegment],
    ) -> Result<Vec<KaraokeSegment>, StageError> {
        if let Some(custom) = &options.custom_lyrics {
            let aligned = alignment::align_or_fallback(Some(custom.as_str()), recognized);
            if !aligned.is_empty() {
                return Ok(aligned);
            }
        }

        if self.lyrics.enabled() {
            let hits = self.lyrics.search(title, Some(uploader)).await;
            if let Some(best) = hits.first() {
                let lyric_text = self.lyrics.lyrics_for(best.id, &best.url).await;
                if !lyric_text.trim().is_empty() {
                    let aligned = alignment::align_or_fallback(Some(lyric_text.as_str()), recognized);
                    if !aligned.is_empty() {
                        return Ok(aligned);
                    }
                }
            }
        }

        Ok(alignment::align_or_fallback(None, recognized))
    }

    async fn write_subtitles(
        &self,
        video_id: &VideoId,
        segments: &[KaraokeSegment],
        options: &ProcessOptions,
    ) -> Result<PathBuf, StageError> {
        let style = subtitles::SubtitleStyle {
            size: options.final_subtitle_size,
            position: options.subtitle_position,
            ..Default::default()
        };
        let doc = subtitles::emit(segments, &style).map_err(StageError::Generic)?;
        let path = self.settings.processed_dir.join(format!("{}.ass", video_id.as_str()));
        tokio::fs::write(&path, doc).await.map_err(|e| StageError::Generic(e.to_string()))?;
        Ok(path)
    }

    async fn merge(
        &self,
        video_id: &VideoId,
        video_path: &Path,
        instrumental: &Path,
        subtitle_path: Option<&Path>,
        pitch: muxer::PitchMode,
    ) -> Result<PathBuf, StageError> {
        let out_path = self.settings.processed_dir.join(format!("{}_karaoke.mp4", video_id.as_str()));
        match subtitle_path {
            Some(subs) => {
                muxer::merge_with_subtitles(video_path, instrumental, subs, pitch, &out_path).await?;
            }
            None => {
                muxer::merge_without_subtitles(video_path, instrumental, pitch, &out_path).await?;
            }
        }
        Ok(out_path)
    }

    /// Builds the finalization result, expressing artifact paths
    /// relative to the processed root as `processed/<rel-path>` (§4.11).
    async fn finalize(
        &self,
        video_id: &VideoId,
        processed_video_path: &Path,
        title: &str,
        analysis: &analyzer::AnalysisResult,
    ) -> Result<JobResult, StageError> {
        if tokio::fs::metadata(processed_video_path).await.is_err() {
            return Err(StageError::Generic("final karaoke video file not found".to_string()));
        }

        let processed_path = relative_processed_uri(&self.settings.processed_dir, processed_video_path)
            .unwrap_or_else(|| format!("processed/{}_karaoke.mp4", video_id.as_str()));

        let stems_base_path = relative_processed_uri(&self.settings.processed_dir, &self.cache.video_dir(video_id));

        Ok(JobResult {
            video_id: video_id.as_str().to_string(),
            processed_path,
            title: title.to_string(),
            stems_base_path,
            bpm: analysis.bpm,
            key: analysis.key.clone(),
            key_confidence: analysis.key_confidence,
        })
    }

    /// Removes transient artifacts for a job that didn't succeed (§4.11
    /// cleanup policy); never removes anything on a successful job.
    async fn cleanup_failed_job(&self, video_id: &VideoId) {
        for ext in ["mp4", "webm", "mkv", "m4a", "mp3", "wav", "flac"] {
            let path = self.settings.downloads_dir.join(format!("{}.{ext}", video_id.as_str()));
            let _ = tokio::fs::remove_file(&path).await;
        }
        let _ = tokio::fs::remove_dir_all(self.cache.video_dir(video_id)).await;
        let karaoke_mp4 = self.settings.processed_dir.join(format!("{}_karaoke.mp4", video_id.as_str()));
        let _ = tokio::fs::remove_file(&karaoke_mp4).await;
        let ass = self.settings.processed_dir.join(format!("{}.ass", video_id.as_str()));
        let _ = tokio::fs::remove_file(&ass).await;
    }
}

fn relative_processed_uri(processed_root: &Path, artifact: &Path) -> Option<String> {
    let root = processed_root.canonicalize().unwrap_or_else(|_| processed_root.to_path_buf());
    let artifact_abs = artifact.canonicalize().unwrap_or_else(|_| artifact.to_path_buf());
    let rel = artifact_abs.strip_prefix(&root).ok()?;
    Some(format!("processed/{}", rel.to_string_lossy().replace('\\', "/")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::recognizer::{DecodeOptions, ModelLoader, RawSegment, SpeechModel};

    #[test]
    fn relative_uri_is_none_outside_processed_root() {
        let result = relative_processed_uri(Path::new("/does/not/exist/processed"), Path::new("/elsewhere/file.mp4"));
        assert!(result.is_none());
    }

    struct NoopModel;

    #[async_trait::async_trait]
    impl SpeechModel for NoopModel {
        async fn transcribe(
            &self,
            _audio_path: &Path,
            _options: &DecodeOptions,
        ) -> Result<(Vec<RawSegment>, String), StageError> {
            Ok((Vec::new(), "en".to_string()))
        }
    }

    struct NoopLoader;

    #[async_trait::async_trait]
    impl ModelLoader for NoopLoader {
        async fn load(&self, _model_tag: &str, _device: &str) -> Result<Arc<dyn SpeechModel>, StageError> {
            Ok(Arc::new(NoopModel))
        }
    }

    fn test_orchestrator(settings: Settings) -> Orchestrator {
        let registry = ProgressRegistry::new();
        let lyrics = Arc::new(LyricProvider::new(None));
        let recognizer = RecognizerHandle::new(Arc::new(NoopLoader), "large-v3", "cpu");
        let events = Arc::new(EventBus::new(16));
        Orchestrator::new(registry, Arc::new(settings), lyrics, recognizer, events)
    }

    #[tokio::test]
    async fn cleanup_removes_transient_artifacts_but_not_other_videos() {
        let dir = tempfile::tempdir().unwrap();
        let downloads = dir.path().join("downloads");
        let processed = dir.path().join("processed");
        tokio::fs::create_dir_all(&downloads).await.unwrap();
        tokio::fs::create_dir_all(&processed).await.unwrap();

        let mut settings = Settings::default();
        settings.downloads_dir = downloads.clone();
        settings.processed_dir = processed.clone();

        let video_id = VideoId::new("abc123").unwrap();
        tokio::fs::write(downloads.join("abc123.mp4"), b"x").await.unwrap();
        tokio::fs::write(processed.join("abc123_karaoke.mp4"), b"x").await.unwrap();
        tokio::fs::create_dir_all(processed.join("abc123")).await.unwrap();
        tokio::fs::write(downloads.join("other.mp4"), b"x").await.unwrap();

        let orchestrator = test_orchestrator(settings);
        orchestrator.cleanup_failed_job(&video_id).await;

        assert!(tokio::fs::metadata(downloads.join("abc123.mp4")).await.is_err());
        assert!(tokio::fs::metadata(processed.join("abc123_karaoke.mp4")).await.is_err());
        assert!(tokio::fs::metadata(processed.join("abc123")).await.is_err());
        assert!(tokio::fs::metadata(downloads.join("other.mp4")).await.is_ok());
    }

    #[tokio::test]
    async fn select_lyrics_falls_back_to_recognized_when_nothing_else_available() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::default();
        settings.processed_dir = dir.path().join("processed");
        let orchestrator = test_orchestrator(settings);

        let recognized = vec![KaraokeSegment {
            start: 0.0,
            end: 1.0,
            text: "hello there".to_string(),
            words: vec![
                crate::models::Word { text: "hello".to_string(), start: 0.0, end: 0.5 },
                crate::models::Word { text: "there".to_string(), start: 0.5, end: 1.0 },
            ],
            aligned: false,
            confidence: None,
        }];

        let options = ProcessOptions::default();
        let result = orchestrator.select_lyrics(&options, "Song", "Artist", &recognized).await.unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].text, "hello there");
    }

    #[tokio::test]
    async fn select_lyrics_prefers_custom_lyrics_when_present() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::default();
        settings.processed_dir = dir.path().join("processed");
        let orchestrator = test_orchestrator(settings);

        let recognized = vec![KaraokeSegment {
            start: 0.0,
            end: 1.0,
            text: "hello there".to_string(),
            words: vec![
                crate::models::Word { text: "hello".to_string(), start: 0.0, end: 0.5 },
                crate::models::Word { text: "there".to_string(), start: 0.5, end: 1.0 },
            ],
            aligned: false,
            confidence: None,
        }];

        let mut options = ProcessOptions::default();
        options.custom_lyrics = Some("hello there".to_string());
        let result = orchestrator.select_lyrics(&options, "Song", "Artist", &recognized).await.unwrap();
        assert_eq!(result.len(), 1);
        assert!(result[0].aligned);
    }
}
