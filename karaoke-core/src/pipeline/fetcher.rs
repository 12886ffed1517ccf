//! Media fetcher (C3): resolves a URL or free-text search to a local
//! download, via the `yt-dlp` binary invoked as a subprocess and its
//! `--dump-json` metadata mode, grounded on the subprocess-wrapper shape
//! in the teacher's Essentia extractor (availability check + piped
//! output + JSON parse).

use crate::error::StageError;
use regex::Regex;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;
use tokio::process::Command;
use tracing::{info, warn};

fn video_id_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?:youtube\.com/watch\?v=|youtu\.be/|youtube\.com/shorts/)([A-Za-z0-9_-]{11})")
            .expect("static regex is valid")
    })
}

/// Whether `input` looks like a direct URL (as opposed to a free-text
/// search query), per §4.2.
pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Extracts the canonical 11-character video id embedded in a
/// recognized streaming-site URL form, if any.
pub fn extract_video_id_from_url(url: &str) -> Option<String> {
    video_id_regex().captures(url).map(|c| c[1].to_string())
}

#[derive(Debug, Deserialize)]
struct YtDlpInfo {
    id: Option<String>,
    title: Option<String>,
    uploader: Option<String>,
    webpage_url: Option<String>,
    thumbnail: Option<String>,
    thumbnails: Option<Vec<YtDlpThumbnail>>,
    entries: Option<Vec<YtDlpInfo>>,
    #[serde(default)]
    ie_key: Option<String>,
    #[serde(rename = "_type", default)]
    entry_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct YtDlpThumbnail {
    url: Option<String>,
    width: Option<u32>,
}

/// What the fetcher hands back to the orchestrator once a local file is
/// available (§4.2).
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub video_id: String,
    pub local_path: PathBuf,
    pub title: String,
    pub uploader: String,
}

/// A single search/suggestion hit (§4.2's `SuggestionItem`).
#[derive(Debug, Clone, serde::Serialize)]
pub struct SuggestionItem {
    pub id: String,
    pub title: String,
    pub thumbnail: Option<String>,
    pub url: String,
    pub uploader: Option<String>,
    pub uploader_id: Option<String>,
}

pub struct FetcherConfig {
    pub socket_timeout_secs: u64,
    pub retries: u32,
}

/// Translates yt-dlp's stderr text into the §4.2 error taxonomy.
fn classify_error(stderr: &str) -> StageError {
    let lower = stderr.to_lowercase();
    if lower.contains("unsupported url") {
        StageError::UnsupportedUrl
    } else if lower.contains("video unavailable") {
        StageError::Unavailable
    } else if lower.contains("private video") {
        StageError::Private
    } else if lower.contains("sign in") || lower.contains("login") {
        StageError::LoginRequired
    } else if lower.contains("live event will begin") {
        StageError::FutureLiveEvent
    } else if lower.contains("urlopen error") || lower.contains("timed out") {
        StageError::Network(stderr.lines().last().unwrap_or("network error").to_string())
    } else if lower.contains("no search results") || lower.contains("no video results") {
        StageError::NoResults(stderr.to_string())
    } else if lower.contains("copyright") {
        StageError::Copyright
    } else if lower.contains("requested format") {
        StageError::FormatUnavailable
    } else {
        StageError::Generic(stderr.lines().last().unwrap_or(stderr).to_string())
    }
}

/// Finds an already-downloaded file `<download_dir>/<video_id>.<ext>`
/// for any known extension (§4.2's download cache elision).
pub async fn find_existing_download(
    download_dir: &Path,
    video_id: &str,
) -> Option<PathBuf> {
    const EXTS: &[&str] = &["mp4", "webm", "mkv", "m4a", "mp3", "wav", "flac"];
    for ext in EXTS {
        let candidate = download_dir.join(format!("{video_id}.{ext}"));
        if tokio::fs::metadata(&candidate).await.is_ok() {
            return Some(candidate);
        }
    }
    None
}

/// Resolves `input` (a URL or search query) to a local file, honoring
/// the download-dir cache elision rule. Runs `yt-dlp` twice: once with
/// `--dump-json` to resolve metadata (and check the cache before
/// spending bandwidth), then again to actually download if no cached
/// file was found.
pub async fn fetch(
    input: &str,
    download_dir: &Path,
    config: &FetcherConfig,
) -> Result<FetchResult, StageError> {
    tokio::fs::create_dir_all(download_dir)
        .await
        .map_err(|e| StageError::Generic(e.to_string()))?;

    let target = if is_url(input) {
        input.to_string()
    } else {
        format!("ytsearch1:{input}")
    };

    let dump = Command::new("yt-dlp")
        .arg("--dump-json")
        .arg("--no-warnings")
        .arg("--no-playlist")
        .arg("--socket-timeout")
        .arg(config.socket_timeout_secs.to_string())
        .arg("--retries")
        .arg(config.retries.to_string())
        .arg(&target)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| StageError::Generic(format!("failed to spawn yt-dlp: {e}")))?;

    if !dump.status.success() {
        let stderr = String::from_utf8_lossy(&dump.stderr);
        warn!(%stderr, "yt-dlp metadata lookup failed");
        return Err(classify_error(&stderr));
    }

    let stdout = String::from_utf8_lossy(&dump.stdout);
    let first_line = stdout.lines().next().unwrap_or("");
    let mut info: YtDlpInfo = serde_json::from_str(first_line)
        .map_err(|e| StageError::Generic(format!("could not parse yt-dlp output: {e}")))?;

    if let Some(mut entries) = info.entries.take() {
        if entries.is_empty() {
            return Err(StageError::NoResults(input.to_string()));
        }
        info = entries.remove(0);
    }

    let video_id = info.id.ok_or_else(|| StageError::Generic("no video id in metadata".to_string()))?;
    let title = info.title.unwrap_or_else(|| "Unknown Title".to_string());
    let uploader = info.uploader.unwrap_or_else(|| "Unknown Uploader".to_string());

    if let Some(existing) = find_existing_download(download_dir, &video_id).await {
        info!(video_id = %video_id, path = ?existing, "download cache hit");
        return Ok(FetchResult { video_id, local_path: existing, title, uploader });
    }

    let download_target = info.webpage_url.unwrap_or(target);
    let output_template = download_dir.join("%(id)s.%(ext)s");

    let download = Command::new("yt-dlp")
        .arg("-f")
        .arg("bestvideo[ext=mp4][height<=1080]+bestaudio[ext=m4a]/best[ext=mp4][height<=1080]/best[height<=1080]/best")
        .arg("--no-warnings")
        .arg("--no-playlist")
        .arg("--socket-timeout")
        .arg(config.socket_timeout_secs.to_string())
        .arg("--retries")
        .arg(config.retries.to_string())
        .arg("-o")
        .arg(&output_template)
        .arg(&download_target)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| StageError::Generic(format!("failed to spawn yt-dlp: {e}")))?;

    if !download.status.success() {
        let stderr = String::from_utf8_lossy(&download.stderr);
        warn!(%stderr, "yt-dlp download failed");
        return Err(classify_error(&stderr));
    }

    let downloaded = find_existing_download(download_dir, &video_id)
        .await
        .ok_or_else(|| StageError::Generic("downloaded file not found post-download".to_string()))?;

    Ok(FetchResult { video_id, local_path: downloaded, title, uploader })
}

fn best_thumbnail(thumbs: &[YtDlpThumbnail]) -> Option<String> {
    thumbs
        .iter()
        .rev()
        .find(|t| t.url.is_some() && t.width.unwrap_or(0) >= 300)
        .or_else(|| thumbs.iter().rev().find(|t| t.url.is_some() && t.width.unwrap_or(0) >= 121))
        .or_else(|| thumbs.last())
        .and_then(|t| t.url.clone())
}

fn parse_entry(entry: YtDlpInfo) -> Option<SuggestionItem> {
    let entry_type = entry.entry_type.as_deref().unwrap_or("video");
    if entry_type != "video" && entry_type != "url" {
        return None;
    }
    if matches!(entry.ie_key.as_deref(), Some("YoutubePlaylist") | Some("YoutubeChannel")) {
        return None;
    }
    let id = entry.id?;
    let title = entry.title.unwrap_or_else(|| "Unknown Title".to_string());
    let thumbnail = entry
        .thumbnails
        .as_deref()
        .and_then(best_thumbnail)
        .or(entry.thumbnail);
    let url = entry
        .webpage_url
        .unwrap_or_else(|| format!("https://www.youtube.com/watch?v={id}"));
    Some(SuggestionItem { id, title, thumbnail, url, uploader: entry.uploader, uploader_id: None })
}

/// Metadata-only suggestions for `query` (§4.2). Never downloads a
/// file; returns an empty list rather than propagating a `StageError`,
/// since suggestions are a best-effort affordance, not a pipeline stage.
pub async fn suggestions(query: &str, max_results: u32) -> Vec<SuggestionItem> {
    let query = query.trim();
    if query.is_empty() {
        return Vec::new();
    }

    let target = if is_url(query) {
        query.to_string()
    } else {
        format!("ytsearch{max_results}:{query}")
    };

    let output = Command::new("yt-dlp")
        .arg("--dump-single-json")
        .arg("--no-warnings")
        .arg("--no-playlist")
        .arg("--socket-timeout")
        .arg("15")
        .arg("--retries")
        .arg("2")
        .arg("--flat-playlist")
        .arg(&target)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await;

    let Ok(output) = output else {
        return Vec::new();
    };
    if !output.status.success() {
        return Vec::new();
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let Ok(info) = serde_json::from_str::<YtDlpInfo>(&stdout) else {
        return Vec::new();
    };

    let mut raw: Vec<YtDlpInfo> = match info.entries {
        Some(entries) => entries,
        None if info.id.is_some() => vec![info],
        None => Vec::new(),
    };

    let mut seen = std::collections::HashSet::new();
    let mut results = Vec::new();
    for entry in raw.drain(..) {
        if let Some(item) = parse_entry(entry) {
            if seen.insert(item.id.clone()) {
                results.push(item);
            }
        }
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_url_recognizes_scheme() {
        assert!(is_url("https://www.youtube.com/watch?v=dQw4w9WgXcQ"));
        assert!(!is_url("some search terms"));
    }

    #[test]
    fn extracts_canonical_video_id() {
        assert_eq!(
            extract_video_id_from_url("https://www.youtube.com/watch?v=dQw4w9WgXcQ"),
            Some("dQw4w9WgXcQ".to_string())
        );
        assert_eq!(
            extract_video_id_from_url("https://youtu.be/dQw4w9WgXcQ"),
            Some("dQw4w9WgXcQ".to_string())
        );
        assert_eq!(extract_video_id_from_url("not a url"), None);
    }

    #[test]
    fn classifies_known_error_strings() {
        assert!(matches!(classify_error("ERROR: Private video"), StageError::Private));
        assert!(matches!(
            classify_error("ERROR: Video unavailable"),
            StageError::Unavailable
        ));
        assert!(matches!(
            classify_error("urlopen error timed out"),
            StageError::Network(_)
        ));
        assert!(matches!(
            classify_error("No video results"),
            StageError::NoResults(_)
        ));
        assert!(matches!(classify_error("something weird"), StageError::Generic(_)));
    }

    #[tokio::test]
    async fn find_existing_download_checks_known_extensions() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("abc123.m4a"), b"x").await.unwrap();
        let found = find_existing_download(dir.path(), "abc123").await;
        assert_eq!(found, Some(dir.path().join("abc123.m4a")));
    }

    #[tokio::test]
    async fn find_existing_download_returns_none_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        assert!(find_existing_download(dir.path(), "missing").await.is_none());
    }

    #[test]
    fn best_thumbnail_prefers_high_width() {
        let thumbs = vec![
            YtDlpThumbnail { url: Some("small.jpg".to_string()), width: Some(80) },
            YtDlpThumbnail { url: Some("big.jpg".to_string()), width: Some(640) },
        ];
        assert_eq!(best_thumbnail(&thumbs), Some("big.jpg".to_string()));
    }
}
