//! Job: the unit of work the orchestrator drives end to end.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// Opaque, filesystem-safe content identifier for a piece of media.
///
/// For streaming-site sources this is the site's own video id; for
/// uploads it's the sanitized filename stem. All cache keys, artifact
/// paths, and the on-disk layout in §6 derive from this value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VideoId(String);

impl VideoId {
    /// Construct a `VideoId`, rejecting anything that isn't safe to use
    /// as a path segment.
    pub fn new(raw: impl Into<String>) -> Result<Self, String> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err("video id must not be empty".to_string());
        }
        if raw == "." || raw == ".." {
            return Err("video id must not be a path traversal token".to_string());
        }
        if raw.contains(['/', '\\', '\0']) {
            return Err(format!("video id '{raw}' contains a path separator"));
        }
        Ok(Self(raw))
    }

    /// Sanitize an arbitrary filename stem into a valid `VideoId` by
    /// keeping only `[A-Za-z0-9_]`, mirroring the upload-validation rule
    /// in §6.
    pub fn sanitize(stem: &str) -> Result<Self, String> {
        let cleaned: String = stem
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
            .collect();
        Self::new(cleaned)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for VideoId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How the job's source was expressed by the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceSpec {
    Url(String),
    Search(String),
    LocalFile(PathBuf),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SubtitlePosition {
    Top,
    #[default]
    Bottom,
}

/// Immutable inputs accepted at job creation time (§3 Job, §6 ProcessRequest).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessOptions {
    pub language: String,
    pub subtitle_position: SubtitlePosition,
    pub generate_subtitles: bool,
    pub custom_lyrics: Option<String>,
    pub global_pitch: Option<f32>,
    pub final_subtitle_size: u32,
}

impl Default for ProcessOptions {
    fn default() -> Self {
        Self {
            language: "auto".to_string(),
            subtitle_position: SubtitlePosition::Bottom,
            generate_subtitles: true,
            custom_lyrics: None,
            global_pitch: None,
            final_subtitle_size: 36,
        }
    }
}

impl ProcessOptions {
    /// Validated against the closed set named in §6.
    pub const VALID_SUBTITLE_SIZES: [u32; 4] = [24, 30, 36, 42];

    pub fn validate(&self) -> Result<(), String> {
        if !Self::VALID_SUBTITLE_SIZES.contains(&self.final_subtitle_size) {
            return Err(format!(
                "final_subtitle_size must be one of {:?}, got {}",
                Self::VALID_SUBTITLE_SIZES,
                self.final_subtitle_size
            ));
        }
        if let Some(p) = self.global_pitch {
            if !(-12.0..=12.0).contains(&p) {
                return Err(format!("global_pitch must be in [-12, 12], got {p}"));
            }
        }
        Ok(())
    }
}

/// Terminal payload carried by a successfully completed job (§4.11 Finalization).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub video_id: String,
    pub processed_path: String,
    pub title: String,
    pub stems_base_path: Option<String>,
    pub bpm: Option<f32>,
    pub key: Option<String>,
    pub key_confidence: Option<f32>,
}

/// Mutable lifecycle state of a job, owned by the progress registry for
/// the job's lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobState {
    pub stage: String,
    pub progress: u8,
    pub message: String,
    pub is_step_start: bool,
    pub cancelled: bool,
    pub result: Option<JobResult>,
}

impl JobState {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            stage: "queued".to_string(),
            progress: 0,
            message: message.into(),
            is_step_start: true,
            cancelled: false,
            result: None,
        }
    }

    /// A terminal state is progress==100 with either a result or an
    /// error/cancel marker in the message (§3 ProgressEntry, §4.1).
    pub fn is_terminal(&self) -> bool {
        self.progress >= 100
            && (self.result.is_some()
                || self.message.to_lowercase().contains("error")
                || self.message.to_lowercase().contains("cancel"))
    }
}

/// The full job record as seen by the orchestrator: immutable inputs
/// plus the current mutable state snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: Uuid,
    pub source: SourceSpec,
    pub options: ProcessOptions,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn video_id_rejects_path_separators() {
        assert!(VideoId::new("abc/def").is_err());
        assert!(VideoId::new("abc\\def").is_err());
        assert!(VideoId::new("").is_err());
        assert!(VideoId::new("..").is_err());
    }

    #[test]
    fn video_id_sanitize_keeps_only_alnum_and_underscore() {
        let id = VideoId::sanitize("My Song (Live) #1.mp4").unwrap();
        assert_eq!(id.as_str(), "My_Song__Live___1_mp4");
    }

    #[test]
    fn subtitle_size_validation_rejects_non_member_values() {
        let mut opts = ProcessOptions::default();
        opts.final_subtitle_size = 33;
        assert!(opts.validate().is_err());
        opts.final_subtitle_size = 30;
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn global_pitch_out_of_range_rejected() {
        let mut opts = ProcessOptions::default();
        opts.global_pitch = Some(13.0);
        assert!(opts.validate().is_err());
        opts.global_pitch = Some(-12.0);
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn terminal_state_requires_full_progress_and_marker() {
        let mut state = JobState::new("working");
        state.progress = 100;
        assert!(!state.is_terminal());
        state.message = "Job cancelled by user.".to_string();
        assert!(state.is_terminal());
    }
}
