//! Audio analyzer (C7): BPM and musical key detection.
//!
//! Key detection follows the Krumhansl-Schmuckler algorithm exactly as
//! grounded on `original_source/backend/core/audio_analyzer.py`: a
//! 12-bin chroma profile correlated against 24 rotated major/minor
//! templates. Chroma bins here come from a bank of per-pitch-class
//! Goertzel detectors run across several octaves, standing in for
//! librosa's constant-Q chromagram without pulling in an FFT crate the
//! rest of the stack doesn't otherwise need. BPM comes from
//! autocorrelating a coarse onset-energy envelope, standing in for
//! librosa's beat tracker.

use crate::error::StageError;
use std::path::Path;

pub const KEY_NAMES: [&str; 12] =
    ["C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B"];

const MAJOR_PROFILE: [f64; 12] =
    [6.35, 2.23, 3.48, 2.33, 4.38, 4.09, 2.52, 5.19, 2.39, 3.66, 2.29, 2.88];
const MINOR_PROFILE: [f64; 12] =
    [6.33, 2.68, 3.52, 5.38, 2.60, 3.53, 2.54, 4.75, 3.98, 2.69, 3.34, 3.17];

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct AnalysisResult {
    pub bpm: Option<f32>,
    pub key: Option<String>,
    pub key_confidence: Option<f32>,
}

impl AnalysisResult {
    pub fn empty() -> Self {
        Self { bpm: None, key: None, key_confidence: None }
    }
}

fn rotate_left(profile: &[f64; 12], n: usize) -> [f64; 12] {
    let mut out = [0.0; 12];
    for i in 0..12 {
        out[i] = profile[(i + n) % 12];
    }
    out
}

fn normalize(v: &[f64; 12]) -> [f64; 12] {
    let sum: f64 = v.iter().sum();
    if sum <= 0.0 {
        return *v;
    }
    let mut out = [0.0; 12];
    for i in 0..12 {
        out[i] = v[i] / sum;
    }
    out
}

fn pearson_corr(a: &[f64; 12], b: &[f64; 12]) -> f64 {
    let mean_a: f64 = a.iter().sum::<f64>() / 12.0;
    let mean_b: f64 = b.iter().sum::<f64>() / 12.0;
    let mut num = 0.0;
    let mut den_a = 0.0;
    let mut den_b = 0.0;
    for i in 0..12 {
        let da = a[i] - mean_a;
        let db = b[i] - mean_b;
        num += da * db;
        den_a += da * da;
        den_b += db * db;
    }
    let denom = (den_a * den_b).sqrt();
    if denom == 0.0 {
        0.0
    } else {
        num / denom
    }
}

/// Krumhansl-Schmuckler key detection (§4.6): tests all 24 rotated
/// profiles, returns `(key_index, is_major, confidence)`.
pub fn detect_key_from_chroma(chroma_mean: &[f64; 12]) -> (usize, bool, f64) {
    let chroma = normalize(chroma_mean);

    let mut best_corr = -1.0;
    let mut best_key = 0;
    let mut best_is_major = true;

    for key_idx in 0..12 {
        let major_rotated = normalize(&rotate_left(&MAJOR_PROFILE, key_idx));
        let minor_rotated = normalize(&rotate_left(&MINOR_PROFILE, key_idx));

        let major_corr = pearson_corr(&chroma, &major_rotated);
        let minor_corr = pearson_corr(&chroma, &minor_rotated);

        if major_corr > best_corr {
            best_corr = major_corr;
            best_key = key_idx;
            best_is_major = true;
        }
        if minor_corr > best_corr {
            best_corr = minor_corr;
            best_key = key_idx;
            best_is_major = false;
        }
    }

    let confidence = ((best_corr + 1.0) / 2.0).clamp(0.0, 1.0);
    (best_key, best_is_major, confidence)
}

/// Goertzel algorithm: the power of `samples` at `target_freq` Hz.
fn goertzel_power(samples: &[f32], sample_rate: f64, target_freq: f64) -> f64 {
    let n = samples.len() as f64;
    let k = (0.5 + n * target_freq / sample_rate).floor();
    let omega = 2.0 * std::f64::consts::PI * k / n;
    let coeff = 2.0 * omega.cos();

    let (mut s_prev, mut s_prev2) = (0.0, 0.0);
    for &sample in samples {
        let s = sample as f64 + coeff * s_prev - s_prev2;
        s_prev2 = s_prev;
        s_prev = s;
    }
    s_prev2 * s_prev2 + s_prev * s_prev - coeff * s_prev * s_prev2
}

/// Mean chroma energy across the whole buffer, one Goertzel pass per
/// pitch class per octave (C2 through C6).
fn compute_chroma(samples: &[f32], sample_rate: f64) -> [f64; 12] {
    const C2_HZ: f64 = 65.406;
    let mut chroma = [0.0; 12];
    for pitch_class in 0..12 {
        let mut energy = 0.0;
        for octave in 0..5 {
            let freq = C2_HZ * 2f64.powi(octave) * 2f64.powf(pitch_class as f64 / 12.0);
            if freq < sample_rate / 2.0 {
                energy += goertzel_power(samples, sample_rate, freq);
            }
        }
        chroma[pitch_class] = energy;
    }
    chroma
}

/// Onset-envelope autocorrelation BPM estimate, searching the plausible
/// 60-200 BPM range.
fn estimate_bpm(samples: &[f32], sample_rate: f64) -> f64 {
    let hop = (sample_rate * 0.02) as usize; // 20ms frames
    if hop == 0 || samples.len() < hop * 4 {
        return 120.0;
    }

    let envelope: Vec<f64> = samples
        .chunks(hop)
        .map(|chunk| {
            let sum_sq: f64 = chunk.iter().map(|s| (*s as f64) * (*s as f64)).sum();
            (sum_sq / chunk.len() as f64).sqrt()
        })
        .collect();

    let onset: Vec<f64> = envelope
        .windows(2)
        .map(|w| (w[1] - w[0]).max(0.0))
        .collect();

    let frame_rate = sample_rate / hop as f64;
    let min_lag = (frame_rate * 60.0 / 200.0) as usize;
    let max_lag = (frame_rate * 60.0 / 60.0) as usize;
    if onset.len() <= max_lag.max(min_lag) + 1 {
        return 120.0;
    }

    let mut best_lag = min_lag.max(1);
    let mut best_score = f64::MIN;
    for lag in min_lag.max(1)..=max_lag.min(onset.len() - 1) {
        let mut score = 0.0;
        for i in 0..(onset.len() - lag) {
            score += onset[i] * onset[i + lag];
        }
        if score > best_score {
            best_score = score;
            best_lag = lag;
        }
    }

    (frame_rate * 60.0 / best_lag as f64).clamp(40.0, 220.0)
}

/// Decodes `path` to mono f32 PCM via symphonia, without resampling —
/// the Goertzel/autocorrelation approach above works at native sample
/// rate, unlike a true constant-Q chromagram which benefits from a
/// fixed low rate for efficiency.
fn decode_mono(path: &Path) -> Result<(Vec<f32>, u32), StageError> {
    use symphonia::core::audio::{AudioBufferRef, Signal};
    use symphonia::core::codecs::DecoderOptions;
    use symphonia::core::formats::FormatOptions;
    use symphonia::core::io::MediaSourceStream;
    use symphonia::core::meta::MetadataOptions;
    use symphonia::core::probe::Hint;

    let file = std::fs::File::open(path).map_err(|e| StageError::Generic(e.to_string()))?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());
    let probed = symphonia::default::get_probe()
        .format(&Hint::new(), mss, &FormatOptions::default(), &MetadataOptions::default())
        .map_err(|e| StageError::CodecFailure(e.to_string()))?;

    let mut format = probed.format;
    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != symphonia::core::codecs::CODEC_TYPE_NULL)
        .ok_or_else(|| StageError::CodecFailure("no decodable track".to_string()))?
        .clone();
    let sample_rate = track.codec_params.sample_rate.unwrap_or(44100);

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| StageError::CodecFailure(e.to_string()))?;

    let mut samples = Vec::new();
    loop {
        let packet = match format.next_packet() {
            Ok(p) => p,
            Err(symphonia::core::errors::Error::IoError(_)) => break,
            Err(_) => break,
        };
        let decoded = match decoder.decode(&packet) {
            Ok(d) => d,
            Err(_) => continue,
        };
        match decoded {
            AudioBufferRef::F32(buf) => {
                let channels = buf.spec().channels.count();
                for frame in 0..buf.frames() {
                    let mut sum = 0.0f32;
                    for ch in 0..channels {
                        sum += buf.chan(ch)[frame];
                    }
                    samples.push(sum / channels as f32);
                }
            }
            other => {
                let mut f32_buf = other.make_equivalent::<f32>();
                other.convert(&mut f32_buf);
                let channels = f32_buf.spec().channels.count();
                for frame in 0..f32_buf.frames() {
                    let mut sum = 0.0f32;
                    for ch in 0..channels {
                        sum += f32_buf.chan(ch)[frame];
                    }
                    samples.push(sum / channels as f32);
                }
            }
        }
    }

    Ok((samples, sample_rate))
}

/// Analyzes `audio_path` for BPM and key (§4.6). Returns an empty
/// result (all fields `None`) on decode failure or a too-small input,
/// rather than propagating a `StageError` — analysis is a best-effort
/// enrichment, not a pipeline-blocking stage.
pub async fn analyze(audio_path: &Path) -> AnalysisResult {
    let meta = tokio::fs::metadata(audio_path).await;
    match meta {
        Ok(m) if m.len() >= 1024 => {}
        _ => return AnalysisResult::empty(),
    }

    let path = audio_path.to_path_buf();
    let decoded = tokio::task::spawn_blocking(move || decode_mono(&path)).await;
    let Ok(Ok((samples, sample_rate))) = decoded else {
        return AnalysisResult::empty();
    };
    if samples.is_empty() {
        return AnalysisResult::empty();
    }

    let sample_rate_f = sample_rate as f64;
    let bpm = (estimate_bpm(&samples, sample_rate_f) * 10.0).round() / 10.0;
    let chroma = compute_chroma(&samples, sample_rate_f);
    let (key_idx, is_major, confidence) = detect_key_from_chroma(&chroma);
    let key_string = format!("{}{}", KEY_NAMES[key_idx], if is_major { "" } else { "m" });

    AnalysisResult {
        bpm: Some(bpm as f32),
        key: Some(key_string),
        key_confidence: Some(((confidence * 1000.0).round() / 1000.0) as f32),
    }
}

/// Transposes a key string (e.g. `"Am"`, `"C"`, `"G#m"`) by `semitones`
/// (§4.6). Returns `None` for an unrecognized root.
pub fn transpose_key(original: &str, semitones: i32) -> Option<String> {
    if original.is_empty() {
        return None;
    }
    if semitones == 0 {
        return Some(original.to_string());
    }

    let is_minor = original.ends_with('m');
    let root = if is_minor { &original[..original.len() - 1] } else { original };

    let root_idx = KEY_NAMES.iter().position(|k| *k == root)? as i32;
    let new_idx = (((root_idx + semitones) % 12) + 12) % 12;

    Some(format!("{}{}", KEY_NAMES[new_idx as usize], if is_minor { "m" } else { "" }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transpose_key_round_trips() {
        for key in ["C", "G#", "Am", "F#m", "B"] {
            for n in [-24, -12, -1, 0, 1, 7, 12, 24] {
                let up = transpose_key(key, n).unwrap();
                let back = transpose_key(&up, -n).unwrap();
                assert_eq!(back, key, "key={key} n={n}");
            }
        }
    }

    #[test]
    fn transpose_key_rejects_unknown_root() {
        assert_eq!(transpose_key("H#", 2), None);
    }

    #[test]
    fn transpose_key_preserves_minor_suffix() {
        assert_eq!(transpose_key("Am", 2), Some("Bm".to_string()));
        assert_eq!(transpose_key("C", 2), Some("D".to_string()));
    }

    #[test]
    fn c_major_profile_detects_as_c_major() {
        let chroma = normalize(&MAJOR_PROFILE);
        let (key_idx, is_major, confidence) = detect_key_from_chroma(&chroma);
        assert_eq!(key_idx, 0);
        assert!(is_major);
        assert!(confidence > 0.9);
    }

    #[test]
    fn a_minor_profile_detects_as_a_minor() {
        let rotated = rotate_left(&MINOR_PROFILE, 9);
        let chroma = normalize(&rotated);
        let (key_idx, is_major, confidence) = detect_key_from_chroma(&chroma);
        assert_eq!(key_idx, 9);
        assert!(!is_major);
        assert!(confidence > 0.9);
    }

    #[tokio::test]
    async fn tiny_file_returns_empty_result() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiny.wav");
        tokio::fs::write(&path, b"x").await.unwrap();
        let result = analyze(&path).await;
        assert_eq!(result, AnalysisResult::empty());
    }
}
