//! CacheMetadata: the per-video_id structured document (§3, §4.4, §4.5, §4.6).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StemsCache {
    pub model: String,
    pub library_version: String,
    pub input_audio_sha256: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptionCache {
    pub model: String,
    pub library_version: String,
    pub language: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioAnalysisCache {
    pub bpm: Option<f32>,
    pub key: Option<String>,
    pub key_confidence: Option<f32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheMetadata {
    pub stems: Option<StemsCache>,
    pub transcription: Option<TranscriptionCache>,
    pub audio_analysis: Option<AudioAnalysisCache>,
}
