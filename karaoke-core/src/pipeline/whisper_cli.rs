//! Production `SpeechModel`/`ModelLoader` binding for C6: shells out to
//! a `whisper-cli`-compatible binary emitting JSON segments with word
//! timestamps, the same subprocess-supervision shape the fetcher,
//! separator, and muxer use for their own external tools. The neural
//! model itself stays an opaque callable service; this module only
//! owns the invocation and the JSON-to-`RawSegment` mapping.

use crate::error::StageError;
use crate::models::Word;
use crate::pipeline::recognizer::{DecodeOptions, ModelLoader, RawSegment, SpeechModel};
use serde::Deserialize;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;

/// A model "handle" here is just the tag/device pair the CLI is invoked
/// with each call; the binary manages its own weight cache/residency.
pub struct CliModel {
    model_tag: String,
    device: String,
}

#[derive(Debug, Deserialize)]
struct CliWord {
    word: String,
    start: f64,
    end: f64,
}

#[derive(Debug, Deserialize)]
struct CliSegment {
    start: f64,
    end: f64,
    text: String,
    #[serde(default)]
    words: Vec<CliWord>,
}

#[derive(Debug, Deserialize, Default)]
struct CliOutput {
    #[serde(default)]
    segments: Vec<CliSegment>,
    #[serde(default)]
    language: Option<String>,
}

#[async_trait::async_trait]
impl SpeechModel for CliModel {
    async fn transcribe(
        &self,
        audio_path: &Path,
        options: &DecodeOptions,
    ) -> Result<(Vec<RawSegment>, String), StageError> {
        let mut cmd = Command::new("whisper-cli");
        cmd.arg("--model")
            .arg(&self.model_tag)
            .arg("--device")
            .arg(&self.device)
            .arg("--output-format")
            .arg("json")
            .arg("--word-timestamps")
            .arg("true")
            .arg("--beam-size")
            .arg(options.beam_size.to_string())
            .arg("--temperature")
            .arg(options.temperature.to_string())
            .arg("--patience")
            .arg(options.patience.to_string());

        if options.condition_on_previous_text {
            cmd.arg("--condition-on-previous-text");
        }
        if let Some(lang) = &options.language {
            cmd.arg("--language").arg(lang);
        }
        if let Some(prompt) = &options.initial_prompt {
            cmd.arg("--initial-prompt").arg(prompt);
        }

        let output = cmd
            .arg(audio_path)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| StageError::TranscriptionFailed(format!("failed to spawn whisper-cli: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let reason = stderr.lines().last().unwrap_or("whisper-cli failed").to_string();
            return Err(StageError::TranscriptionFailed(reason));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let parsed: CliOutput = serde_json::from_str(&stdout)
            .map_err(|e| StageError::TranscriptionFailed(format!("could not parse whisper-cli output: {e}")))?;

        let segments = parsed
            .segments
            .into_iter()
            .map(|s| RawSegment {
                start: s.start,
                end: s.end,
                text: s.text,
                words: s
                    .words
                    .into_iter()
                    .map(|w| Word { text: w.word, start: w.start, end: w.end })
                    .collect(),
            })
            .collect();

        Ok((segments, parsed.language.unwrap_or_else(|| "en".to_string())))
    }
}

/// Every call produces a fresh `CliModel` handle; there is no in-process
/// weight residency to amortize once the model lives in a subprocess,
/// but `RecognizerHandle` still only calls this once per process thanks
/// to its own lazy-load cell.
pub struct CliModelLoader;

#[async_trait::async_trait]
impl ModelLoader for CliModelLoader {
    async fn load(&self, model_tag: &str, device: &str) -> Result<Arc<dyn SpeechModel>, StageError> {
        Ok(Arc::new(CliModel { model_tag: model_tag.to_string(), device: device.to_string() }))
    }
}
