//! Audio extractor (C4): normalizes any downloaded input into a
//! canonical WAV via the external codec subprocess.

use crate::cache::file_is_valid;
use crate::error::StageError;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::info;

/// Extracts `input` into `<video_id>.wav` at 44.1 kHz stereo PCM 16-bit,
/// short-circuiting if the target already exists and clears the
/// minimum-size validity threshold (§4.3).
pub async fn extract_audio(
    input: &Path,
    video_id: &str,
    out_dir: &Path,
) -> Result<PathBuf, StageError> {
    tokio::fs::create_dir_all(out_dir)
        .await
        .map_err(|e| StageError::CodecFailure(e.to_string()))?;
    let target = out_dir.join(format!("{video_id}.wav"));

    if file_is_valid(&target).await {
        info!(video_id, "audio extraction cache hit");
        return Ok(target);
    }

    let output = Command::new("ffmpeg")
        .arg("-y")
        .arg("-i")
        .arg(input)
        .arg("-ar")
        .arg("44100")
        .arg("-ac")
        .arg("2")
        .arg("-sample_fmt")
        .arg("s16")
        .arg(&target)
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

    if !file_is_valid(&target).await {
        return Err(StageError::CodecFailure(
            "ffmpeg reported success but output is missing or empty".to_string(),
        ));
    }

    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn short_circuits_when_target_already_valid() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("abc.wav");
        tokio::fs::write(&target, vec![0u8; 4096]).await.unwrap();
        let result = extract_audio(Path::new("/does/not/matter.mp4"), "abc", dir.path())
            .await
            .unwrap();
        assert_eq!(result, target);
    }
}
