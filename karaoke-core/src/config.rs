//! Settings loaded from CLI args, environment variables, and an optional
//! TOML file, grounded on `original_source/backend/config.py`.

use serde::Deserialize;
use std::path::PathBuf;

const WHISPER_MODELS: [&str; 8] =
    ["tiny", "base", "small", "medium", "large", "large-v2", "large-v3", "turbo"];

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub host: String,
    pub port: u16,
    pub debug: bool,
    pub cors_origins: String,

    pub downloads_dir: PathBuf,
    pub processed_dir: PathBuf,

    pub whisper_model_tag: String,
    pub demucs_model: String,
    pub device: String,

    pub genius_api_token: Option<String>,

    pub rate_limit_requests: u32,
    pub rate_limit_window_secs: u64,
    pub max_concurrent_jobs: usize,

    pub ytdlp_socket_timeout_secs: u64,
    pub ytdlp_retries: u32,

    pub demucs_timeout_secs: u64,
    pub demucs_wait_timeout_secs: u64,
    pub demucs_check_interval_ms: u64,

    pub lyrics_alignment_threshold: f64,

    pub cleanup_delay_progress_secs: u64,
    pub cleanup_delay_files_secs: u64,
    pub progress_ttl_secs: u64,

    pub shutdown_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            debug: false,
            cors_origins: "*".to_string(),
            downloads_dir: PathBuf::from("downloads"),
            processed_dir: PathBuf::from("processed"),
            whisper_model_tag: "large-v3".to_string(),
            demucs_model: "mdx_extra_q".to_string(),
            device: "cpu".to_string(),
            genius_api_token: None,
            rate_limit_requests: 10,
            rate_limit_window_secs: 60,
            max_concurrent_jobs: 3,
            ytdlp_socket_timeout_secs: 60,
            ytdlp_retries: 3,
            demucs_timeout_secs: 2400,
            demucs_wait_timeout_secs: 15,
            demucs_check_interval_ms: 500,
            lyrics_alignment_threshold: 0.45,
            cleanup_delay_progress_secs: 600,
            cleanup_delay_files_secs: 700,
            progress_ttl_secs: 3600,
            shutdown_timeout_secs: 30,
        }
    }
}

impl Settings {
    /// Whether the Genius lyric provider is usable at all — mirrors the
    /// original's `ENABLE_GENIUS_FETCH` property.
    pub fn genius_enabled(&self) -> bool {
        self.genius_api_token.is_some()
    }

    /// Comma-separated origins parsed into a list for a CORS layer.
    pub fn allowed_origins(&self) -> Vec<String> {
        self.cors_origins
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    pub fn validate(&self) -> Result<(), String> {
        if !WHISPER_MODELS.contains(&self.whisper_model_tag.as_str()) {
            return Err(format!(
                "whisper_model_tag must be one of {WHISPER_MODELS:?}, got '{}'",
                self.whisper_model_tag
            ));
        }
        if !(1..=10).contains(&self.max_concurrent_jobs) {
            return Err("max_concurrent_jobs must be in [1, 10]".to_string());
        }
        if !(10..=300).contains(&self.ytdlp_socket_timeout_secs) {
            return Err("ytdlp_socket_timeout_secs must be in [10, 300]".to_string());
        }
        if !(300..=7200).contains(&self.demucs_timeout_secs) {
            return Err("demucs_timeout_secs must be in [300, 7200]".to_string());
        }
        if !(0.0..=1.0).contains(&self.lyrics_alignment_threshold) {
            return Err("lyrics_alignment_threshold must be in [0, 1]".to_string());
        }
        Ok(())
    }

    /// Load from (in order of increasing priority) a TOML file, then
    /// environment variables.
    pub fn load(toml_path: Option<&std::path::Path>) -> anyhow::Result<Self> {
        let mut settings = if let Some(path) = toml_path {
            let text = std::fs::read_to_string(path)?;
            toml::from_str(&text)?
        } else {
            Settings::default()
        };

        if let Ok(v) = std::env::var("HOST") {
            settings.host = v;
        }
        if let Ok(v) = std::env::var("PORT") {
            settings.port = v.parse()?;
        }
        if let Ok(v) = std::env::var("WHISPER_MODEL_TAG") {
            settings.whisper_model_tag = v;
        }
        if let Ok(v) = std::env::var("DEMUCS_MODEL") {
            settings.demucs_model = v;
        }
        if let Ok(v) = std::env::var("GENIUS_API_TOKEN") {
            settings.genius_api_token = Some(v);
        }
        if let Ok(v) = std::env::var("MAX_CONCURRENT_JOBS") {
            settings.max_concurrent_jobs = v.parse()?;
        }

        settings.validate().map_err(anyhow::Error::msg)?;
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_validate() {
        assert!(Settings::default().validate().is_ok());
    }

    #[test]
    fn rejects_unknown_whisper_model() {
        let mut s = Settings::default();
        s.whisper_model_tag = "xl-turbo-pro".to_string();
        assert!(s.validate().is_err());
    }

    #[test]
    fn genius_enabled_tracks_token_presence() {
        let mut s = Settings::default();
        assert!(!s.genius_enabled());
        s.genius_api_token = Some("token".to_string());
        assert!(s.genius_enabled());
    }

    #[test]
    fn allowed_origins_splits_and_trims() {
        let mut s = Settings::default();
        s.cors_origins = "http://a.com, http://b.com".to_string();
        assert_eq!(s.allowed_origins(), vec!["http://a.com", "http://b.com"]);
    }
}
