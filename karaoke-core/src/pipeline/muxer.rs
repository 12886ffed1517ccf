//! Muxer (C11): combines the original video stream with the
//! instrumental audio, optionally burning in (soft-muxing) subtitles
//! and applying a pitch-shift filter (§4.10).

use crate::error::StageError;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;

const MIN_OUTPUT_BYTES: u64 = 1024;

/// How the instrumental track should be pitch-shifted before muxing.
#[derive(Debug, Clone, Copy)]
pub enum PitchMode {
    /// Tempo-preserving shift applied once to the final mix.
    Global(f32),
    None,
}

/// Builds the `ffmpeg` audio filter string for a pitch mode, or `None`
/// if the audio should pass through unfiltered.
fn pitch_filter(mode: PitchMode) -> Option<String> {
    match mode {
        PitchMode::None => None,
        PitchMode::Global(semitones) => {
            let semitones = semitones.clamp(-12.0, 12.0);
            let factor = 2f64.powf(semitones as f64 / 12.0);
            Some(format!("rubberband=pitch={factor:.4}:tempo=1"))
        }
    }
}

fn last_stderr_line(stderr: &[u8]) -> String {
    String::from_utf8_lossy(stderr)
        .lines()
        .filter(|l| !l.trim().is_empty())
        .last()
        .unwrap_or("ffmpeg failed")
        .to_string()
}

async fn output_is_valid(path: &Path) -> bool {
    matches!(tokio::fs::metadata(path).await, Ok(meta) if meta.len() >= MIN_OUTPUT_BYTES)
}

async fn run_ffmpeg(mut cmd: Command, out_path: &Path) -> Result<(), StageError> {
    let output = cmd
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| StageError::CodecFailure(format!("failed to spawn ffmpeg: {e}")))?;

    if !output.status.success() {
        return Err(StageError::CodecFailure(last_stderr_line(&output.stderr)));
    }
    if !output_is_valid(out_path).await {
        return Err(StageError::CodecFailure(
            "ffmpeg reported success but output is missing or too small".to_string(),
        ));
    }
    Ok(())
}

fn base_encode_args(cmd: &mut Command) {
    cmd.arg("-c:v")
        .arg("libx264")
        .arg("-preset")
        .arg("medium")
        .arg("-crf")
        .arg("20")
        .arg("-c:a")
        .arg("aac")
        .arg("-b:a")
        .arg("320k")
        .arg("-ar")
        .arg("48000")
        .arg("-movflags")
        .arg("+faststart");
}

/// Merges `video` (video stream only) with `instrumental` plus a burned
/// subtitle track, re-encoding video and audio (§4.10).
pub async fn merge_with_subtitles(
    video: &Path,
    instrumental: &Path,
    subtitles: &Path,
    pitch: PitchMode,
    out_path: &Path,
) -> Result<(), StageError> {
    let vf = format!("subtitles='{}'", subtitles.display().to_string().replace('\'', r"\'"));

    let mut cmd = Command::new("ffmpeg");
    cmd.arg("-y")
        .arg("-i")
        .arg(video)
        .arg("-i")
        .arg(instrumental)
        .arg("-map")
        .arg("0:v:0")
        .arg("-map")
        .arg("1:a:0")
        .arg("-vf")
        .arg(vf);

    if let Some(af) = pitch_filter(pitch) {
        cmd.arg("-af").arg(af);
    }
    base_encode_args(&mut cmd);
    cmd.arg(out_path);

    run_ffmpeg(cmd, out_path).await
}

/// Merges `video` with `instrumental` and no subtitle track. Tries a
/// video stream-copy first; on codec failure, falls back to a full
/// re-encode (§4.10, §7's "one automatic re-encode retry").
pub async fn merge_without_subtitles(
    video: &Path,
    instrumental: &Path,
    pitch: PitchMode,
    out_path: &Path,
) -> Result<(), StageError> {
    let mut copy_cmd = Command::new("ffmpeg");
    copy_cmd
        .arg("-y")
        .arg("-i")
        .arg(video)
        .arg("-i")
        .arg(instrumental)
        .arg("-map")
        .arg("0:v:0")
        .arg("-map")
        .arg("1:a:0")
        .arg("-c:v")
        .arg("copy");

    if let Some(af) = pitch_filter(pitch) {
        copy_cmd.arg("-af").arg(af);
    }
    copy_cmd
        .arg("-c:a")
        .arg("aac")
        .arg("-b:a")
        .arg("320k")
        .arg("-ar")
        .arg("48000")
        .arg("-movflags")
        .arg("+faststart")
        .arg(out_path);

    if run_ffmpeg(copy_cmd, out_path).await.is_ok() {
        return Ok(());
    }

    let mut reencode_cmd = Command::new("ffmpeg");
    reencode_cmd
        .arg("-y")
        .arg("-i")
        .arg(video)
        .arg("-i")
        .arg(instrumental)
        .arg("-map")
        .arg("0:v:0")
        .arg("-map")
        .arg("1:a:0");

    if let Some(af) = pitch_filter(pitch) {
        reencode_cmd.arg("-af").arg(af);
    }
    base_encode_args(&mut reencode_cmd);
    reencode_cmd.arg(out_path);

    run_ffmpeg(reencode_cmd, out_path).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_pitch_is_tempo_preserving() {
        let filter = pitch_filter(PitchMode::Global(12.0)).unwrap();
        assert!(filter.contains("tempo=1"));
        assert!(filter.contains("pitch=2.0000"));
    }

    #[test]
    fn global_pitch_of_two_semitones_matches_expected_factor() {
        let filter = pitch_filter(PitchMode::Global(2.0)).unwrap();
        assert!(filter.contains("tempo=1"));
        assert!(filter.contains("pitch=1.1225"));
    }

    #[test]
    fn global_pitch_clamps_to_twelve_semitones() {
        let filter = pitch_filter(PitchMode::Global(99.0)).unwrap();
        assert!(filter.contains("pitch=2.0000"));
    }

    #[test]
    fn no_pitch_mode_produces_no_filter() {
        assert!(pitch_filter(PitchMode::None).is_none());
    }

    #[test]
    fn last_stderr_line_skips_blank_trailing_lines() {
        let stderr = b"frame=1\nerror: codec not found\n\n".to_vec();
        assert_eq!(last_stderr_line(&stderr), "error: codec not found");
    }

    #[tokio::test]
    async fn output_validity_requires_minimum_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.mp4");
        assert!(!output_is_valid(&path).await);
        tokio::fs::write(&path, vec![0u8; 2048]).await.unwrap();
        assert!(output_is_valid(&path).await);
    }
}
