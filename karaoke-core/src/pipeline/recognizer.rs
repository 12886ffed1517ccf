//! Speech recognizer (C6): word-timestamped transcription behind a
//! lazy, mutex-guarded single model load.
//!
//! The neural model itself is an opaque callable service (out of
//! scope); what this module owns is the load-once-then-reuse lifecycle
//! and the segment validation/filtering that sits around it, grounded
//! on the double-checked-lock shape in `original_source`'s transcriber,
//! made async-safe throughout per Design Note 1 (no fast unsynchronized
//! check racing the locked path).

use crate::error::StageError;
use crate::models::{KaraokeSegment, Word};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

pub const MIN_AUDIO_BYTES: u64 = 1024;

/// Decoder parameters fixed by the specification (§4.5): not
/// configurable per job, only per deployment (model tag, device).
#[derive(Debug, Clone)]
pub struct DecodeOptions {
    pub beam_size: u32,
    pub temperature: f32,
    pub patience: f32,
    pub condition_on_previous_text: bool,
    pub word_timestamps: bool,
    pub fp16: bool,
    pub language: Option<String>,
    pub initial_prompt: Option<String>,
}

impl DecodeOptions {
    pub fn new(language: Option<&str>, use_gpu: bool, initial_prompt: Option<String>) -> Self {
        Self {
            beam_size: 5,
            temperature: 0.0,
            patience: 2.0,
            condition_on_previous_text: false,
            word_timestamps: true,
            fp16: use_gpu,
            language: language.filter(|l| *l != "auto").map(str::to_string),
            initial_prompt,
        }
    }
}

/// A raw segment as the underlying model would hand it back, before
/// validation/filtering.
#[derive(Debug, Clone)]
pub struct RawSegment {
    pub start: f64,
    pub end: f64,
    pub text: String,
    pub words: Vec<Word>,
}

/// Everything the recognizer needs from an already-loaded model.
/// Abstracted as a trait so tests can substitute a fake without
/// depending on the real model's weights.
#[async_trait::async_trait]
pub trait SpeechModel: Send + Sync {
    async fn transcribe(
        &self,
        audio_path: &Path,
        options: &DecodeOptions,
    ) -> Result<(Vec<RawSegment>, String), StageError>;
}

/// How to obtain a loaded model the first time it's needed.
#[async_trait::async_trait]
pub trait ModelLoader: Send + Sync {
    async fn load(&self, model_tag: &str, device: &str) -> Result<Arc<dyn SpeechModel>, StageError>;
}

/// Lazy, mutex-guarded single model load (§4.5). Cheap to clone; clones
/// share the same underlying cell so only the first caller across the
/// whole process pays the load cost.
#[derive(Clone)]
pub struct RecognizerHandle {
    model: Arc<Mutex<Option<Arc<dyn SpeechModel>>>>,
    loader: Arc<dyn ModelLoader>,
    model_tag: String,
    device: String,
}

impl RecognizerHandle {
    pub fn new(loader: Arc<dyn ModelLoader>, model_tag: impl Into<String>, device: impl Into<String>) -> Self {
        Self {
            model: Arc::new(Mutex::new(None)),
            loader,
            model_tag: model_tag.into(),
            device: device.into(),
        }
    }

    async fn ensure_loaded(&self) -> Result<Arc<dyn SpeechModel>, StageError> {
        let mut guard = self.model.lock().await;
        if let Some(model) = &*guard {
            return Ok(model.clone());
        }
        info!(model_tag = %self.model_tag, device = %self.device, "loading speech model");
        let model = self.loader.load(&self.model_tag, &self.device).await?;
        *guard = Some(model.clone());
        Ok(model)
    }

    /// Transcribes `vocals_path`, filtering raw output per §4.5: drop
    /// segments without valid, non-empty text, without a valid
    /// `[start,end]`, or with no validly-timed words.
    pub async fn transcribe(
        &self,
        vocals_path: &Path,
        language: Option<&str>,
        initial_prompt: Option<String>,
    ) -> Result<Vec<KaraokeSegment>, StageError> {
        let meta = tokio::fs::metadata(vocals_path).await;
        match meta {
            Ok(m) if m.len() >= MIN_AUDIO_BYTES => {}
            _ => {
                warn!(path = ?vocals_path, "vocals file missing or too small, skipping transcription");
                return Ok(Vec::new());
            }
        }

        let model = self.ensure_loaded().await?;
        let options = DecodeOptions::new(language, self.device == "cuda", initial_prompt);
        let (raw, _detected_language) = model.transcribe(vocals_path, &options).await?;

        let mut segments = Vec::with_capacity(raw.len());
        for seg in raw {
            let text = seg.text.trim();
            if text.is_empty() || seg.end < seg.start {
                continue;
            }
            let valid_words: Vec<Word> = seg
                .words
                .into_iter()
                .filter(|w| w.end >= w.start && !w.text.trim().is_empty())
                .collect();
            if valid_words.is_empty() {
                continue;
            }
            segments.push(KaraokeSegment {
                start: seg.start,
                end: seg.end,
                text: text.to_string(),
                words: valid_words,
                aligned: false,
                confidence: None,
            });
        }

        info!(segment_count = segments.len(), "transcription complete");
        Ok(segments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeModel;

    #[async_trait::async_trait]
    impl SpeechModel for FakeModel {
        async fn transcribe(
            &self,
            _audio_path: &Path,
            _options: &DecodeOptions,
        ) -> Result<(Vec<RawSegment>, String), StageError> {
            Ok((
                vec![
                    RawSegment {
                        start: 0.0,
                        end: 1.0,
                        text: "hello there".to_string(),
                        words: vec![
                            Word { text: "hello".to_string(), start: 0.0, end: 0.5 },
                            Word { text: "there".to_string(), start: 0.5, end: 1.0 },
                        ],
                    },
                    RawSegment {
                        start: 2.0,
                        end: 1.5,
                        text: "broken timing".to_string(),
                        words: vec![],
                    },
                    RawSegment { start: 3.0, end: 4.0, text: String::new(), words: vec![] },
                ],
                "en".to_string(),
            ))
        }
    }

    struct CountingLoader {
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl ModelLoader for CountingLoader {
        async fn load(&self, _model_tag: &str, _device: &str) -> Result<Arc<dyn SpeechModel>, StageError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(FakeModel))
        }
    }

    #[tokio::test]
    async fn filters_invalid_segments() {
        let loader = Arc::new(CountingLoader { calls: AtomicUsize::new(0) });
        let handle = RecognizerHandle::new(loader, "large-v3", "cpu");
        let dir = tempfile::tempdir().unwrap();
        let audio = dir.path().join("vocals.wav");
        tokio::fs::write(&audio, vec![0u8; 2048]).await.unwrap();

        let segments = handle.transcribe(&audio, Some("en"), None).await.unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].text, "hello there");
    }

    #[tokio::test]
    async fn model_is_loaded_only_once_across_calls() {
        let loader = Arc::new(CountingLoader { calls: AtomicUsize::new(0) });
        let handle = RecognizerHandle::new(loader.clone(), "large-v3", "cpu");
        let dir = tempfile::tempdir().unwrap();
        let audio = dir.path().join("vocals.wav");
        tokio::fs::write(&audio, vec![0u8; 2048]).await.unwrap();

        handle.transcribe(&audio, None, None).await.unwrap();
        handle.transcribe(&audio, None, None).await.unwrap();
        assert_eq!(loader.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn tiny_vocals_file_skips_transcription_without_loading_model() {
        let loader = Arc::new(CountingLoader { calls: AtomicUsize::new(0) });
        let handle = RecognizerHandle::new(loader.clone(), "large-v3", "cpu");
        let dir = tempfile::tempdir().unwrap();
        let audio = dir.path().join("vocals.wav");
        tokio::fs::write(&audio, b"x").await.unwrap();

        let segments = handle.transcribe(&audio, None, None).await.unwrap();
        assert!(segments.is_empty());
        assert_eq!(loader.calls.load(Ordering::SeqCst), 0);
    }
}
