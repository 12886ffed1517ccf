//! Source separator (C5): subprocess supervision of the neural stem
//! separator plus the instrumental mixdown.
//!
//! The nested output layout below (`<base>/<model>/<model>/<stem>/...`)
//! is an empirically observed quirk of the tool this wraps, not a
//! derivable convention — kept exactly as specified rather than
//! "cleaned up", since changing it would silently break cache reads
//! against directories the tool actually wrote.

use crate::error::StageError;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{info, warn};

pub const CORE_STEMS: [&str; 4] = ["vocals", "drums", "bass", "other"];
const MIN_STEM_BYTES: u64 = 1024;

pub struct SeparatorConfig {
    pub model: String,
    pub device: String,
    pub timeout: Duration,
    pub wait_timeout: Duration,
    pub check_interval: Duration,
}

/// Paths to the four separated stems, once verified present.
#[derive(Debug, Clone)]
pub struct StemPaths {
    pub vocals: PathBuf,
    pub drums: PathBuf,
    pub bass: PathBuf,
    pub other: PathBuf,
}

fn stem_dir(base: &Path, model: &str, input_stem: &str) -> PathBuf {
    base.join(model).join(model).join(input_stem)
}

async fn all_stems_valid(dir: &Path) -> bool {
    for stem in CORE_STEMS {
        let path = dir.join(format!("{stem}.wav"));
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.len() >= MIN_STEM_BYTES => continue,
            _ => return false,
        }
    }
    true
}

/// Runs the separator subprocess, then polls for the four stems to
/// appear (§4.4). Returns the directory and typed stem paths.
pub async fn separate(
    input: &Path,
    out_base: &Path,
    config: &SeparatorConfig,
) -> Result<StemPaths, StageError> {
    let input_stem = input
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| StageError::SeparationFailed("input path has no stem".to_string()))?
        .to_string();

    tokio::fs::create_dir_all(out_base)
        .await
        .map_err(|e| StageError::SeparationFailed(e.to_string()))?;

    let mut child = Command::new("demucs")
        .arg("--out")
        .arg(out_base)
        .arg("-n")
        .arg(&config.model)
        .arg("-d")
        .arg(&config.device)
        .arg(input)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| StageError::SeparationFailed(format!("failed to spawn demucs: {e}")))?;

    let wait_result = timeout(config.timeout, child.wait()).await;
    match wait_result {
        Err(_) => {
            warn!(timeout_secs = config.timeout.as_secs(), "separator timed out, killing");
            let _ = child.kill().await;
            return Err(StageError::SeparationFailed(format!(
                "separator exceeded {}s timeout",
                config.timeout.as_secs()
            )));
        }
        Ok(Ok(status)) if !status.success() => {
            return Err(StageError::SeparationFailed(format!(
                "separator exited with status {status}"
            )));
        }
        Ok(Err(e)) => {
            return Err(StageError::SeparationFailed(format!("wait on separator failed: {e}")));
        }
        Ok(Ok(_)) => {}
    }

    let dir = stem_dir(out_base, &config.model, &input_stem);
    let deadline = tokio::time::Instant::now() + config.wait_timeout;
    loop {
        if all_stems_valid(&dir).await {
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            let listing = list_dir_names(&dir).await;
            return Err(StageError::SeparationFailed(format!(
                "stems not found in {} after waiting; directory contains: {:?}",
                dir.display(),
                listing
            )));
        }
        let listing = list_dir_names(&dir).await;
        warn!(dir = %dir.display(), ?listing, "waiting for stem files to appear");
        tokio::time::sleep(config.check_interval).await;
    }

    info!(dir = %dir.display(), "separator produced all core stems");

    Ok(StemPaths {
        vocals: dir.join("vocals.wav"),
        drums: dir.join("drums.wav"),
        bass: dir.join("bass.wav"),
        other: dir.join("other.wav"),
    })
}

async fn list_dir_names(dir: &Path) -> Vec<String> {
    let mut names = Vec::new();
    if let Ok(mut entries) = tokio::fs::read_dir(dir).await {
        while let Ok(Some(entry)) = entries.next_entry().await {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
    }
    names
}

/// Mixes `drums + bass + other` into an equal-weight stereo sum with a
/// peak-safety normalization filter, at PCM 24-bit 48 kHz (§4.4).
pub async fn mix_instrumental(stems: &StemPaths, out_path: &Path) -> Result<(), StageError> {
    let filter =
        "[0:a][1:a][2:a]amerge=inputs=3,pan=stereo|c0<c0+c2+c4|c1<c1+c3+c5,dynaudnorm[a]";

    let output = Command::new("ffmpeg")
        .arg("-y")
        .arg("-i")
        .arg(&stems.drums)
        .arg("-i")
        .arg(&stems.bass)
        .arg("-i")
        .arg(&stems.other)
        .arg("-filter_complex")
        .arg(filter)
        .arg("-map")
        .arg("[a]")
        .arg("-c:a")
        .arg("pcm_s24le")
        .arg("-ar")
        .arg("48000")
        .arg(out_path)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| StageError::CodecFailure(format!("failed to spawn ffmpeg: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let reason = stderr.lines().last().unwrap_or("ffmpeg failed").to_string();
        return Err(StageError::CodecFailure(reason));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stem_dir_doubles_the_model_segment() {
        let dir = stem_dir(Path::new("/out"), "mdx_extra_q", "song");
        assert_eq!(dir, PathBuf::from("/out/mdx_extra_q/mdx_extra_q/song"));
    }

    #[tokio::test]
    async fn all_stems_valid_requires_every_core_stem() {
        let dir = tempfile::tempdir().unwrap();
        for stem in ["vocals", "drums", "bass"] {
            tokio::fs::write(dir.path().join(format!("{stem}.wav")), vec![0u8; 2048])
                .await
                .unwrap();
        }
        assert!(!all_stems_valid(dir.path()).await);
        tokio::fs::write(dir.path().join("other.wav"), vec![0u8; 2048]).await.unwrap();
        assert!(all_stems_valid(dir.path()).await);
    }

    #[tokio::test]
    async fn all_stems_valid_rejects_undersized_file() {
        let dir = tempfile::tempdir().unwrap();
        for stem in CORE_STEMS {
            tokio::fs::write(dir.path().join(format!("{stem}.wav")), b"x").await.unwrap();
        }
        assert!(!all_stems_valid(dir.path()).await);
    }
}
