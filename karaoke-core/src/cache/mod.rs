//! Content-addressed cache layer (C1): hashing, path derivation, and
//! versioned metadata read/write for the per-`video_id` document at
//! `<processed>/<video_id>/cache_metadata`.
//!
//! Grounded on the teacher's fingerprint-based identity matching in its
//! fusion/extraction pipeline, adapted to the simpler tuple identity
//! this spec uses (model name, library version, language, audio hash)
//! instead of MusicBrainz MBIDs.

use crate::models::{AudioAnalysisCache, CacheMetadata, StemsCache, TranscriptionCache, VideoId};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Path, PathBuf};
use tokio::io::AsyncReadExt;

pub const MIN_VALID_FILE_BYTES: u64 = 1024;

/// Computes the SHA-256 of a file's contents, reading in fixed-size
/// chunks so arbitrarily large audio files don't need to fit in memory.
pub async fn hash_file(path: &Path) -> std::io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Blocking counterpart used from `spawn_blocking` contexts where an
/// async file handle isn't already on hand.
pub fn hash_file_sync(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// A file exists and clears the minimum-size validity threshold (§4.4).
pub async fn file_is_valid(path: &Path) -> bool {
    match tokio::fs::metadata(path).await {
        Ok(meta) => meta.len() >= MIN_VALID_FILE_BYTES,
        Err(_) => false,
    }
}

/// Filesystem layout and metadata persistence for a single `video_id`'s
/// cache directory.
pub struct CacheStore {
    processed_root: PathBuf,
}

impl CacheStore {
    pub fn new(processed_root: impl Into<PathBuf>) -> Self {
        Self { processed_root: processed_root.into() }
    }

    pub fn video_dir(&self, video_id: &VideoId) -> PathBuf {
        self.processed_root.join(video_id.as_str())
    }

    pub fn metadata_path(&self, video_id: &VideoId) -> PathBuf {
        self.video_dir(video_id).join("cache_metadata")
    }

    pub fn instrumental_path(&self, video_id: &VideoId) -> PathBuf {
        self.video_dir(video_id).join("instrumental.wav")
    }

    pub fn vocals_path(&self, video_id: &VideoId) -> PathBuf {
        self.video_dir(video_id).join("vocals.wav")
    }

    /// Reads the metadata document, treating any parse failure as a
    /// cache miss (§7: "Cache metadata corruption: treated as cache
    /// miss") rather than surfacing an error.
    pub async fn read_metadata(&self, video_id: &VideoId) -> CacheMetadata {
        let path = self.metadata_path(video_id);
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => serde_json::from_str(&text).unwrap_or_default(),
            Err(_) => CacheMetadata::default(),
        }
    }

    pub async fn write_metadata(
        &self,
        video_id: &VideoId,
        metadata: &CacheMetadata,
    ) -> karaoke_common::Result<()> {
        let dir = self.video_dir(video_id);
        tokio::fs::create_dir_all(&dir).await?;
        let text = serde_json::to_string_pretty(metadata)
            .map_err(|e| karaoke_common::Error::Internal(e.to_string()))?;
        tokio::fs::write(self.metadata_path(video_id), text).await?;
        Ok(())
    }

    /// Stems are valid (§4.4) iff the recorded model and library version
    /// match the running ones, the recorded input hash matches (when
    /// supplied), and both derived audio files exist and clear the
    /// minimum size.
    pub async fn stems_valid(
        &self,
        video_id: &VideoId,
        current: &StemsCache,
        metadata: &CacheMetadata,
    ) -> bool {
        let Some(recorded) = &metadata.stems else {
            return false;
        };
        if recorded.model != current.model || recorded.library_version != current.library_version
        {
            return false;
        }
        if recorded.input_audio_sha256 != current.input_audio_sha256 {
            return false;
        }
        file_is_valid(&self.instrumental_path(video_id)).await
            && file_is_valid(&self.vocals_path(video_id)).await
    }

    pub fn transcription_valid(
        current: &TranscriptionCache,
        metadata: &CacheMetadata,
    ) -> bool {
        metadata.transcription.as_ref() == Some(current)
    }

    pub fn analysis(metadata: &CacheMetadata) -> Option<&AudioAnalysisCache> {
        metadata.audio_analysis.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn hash_file_is_deterministic() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.wav");
        tokio::fs::write(&path, b"hello world").await.unwrap();
        let h1 = hash_file(&path).await.unwrap();
        let h2 = hash_file(&path).await.unwrap();
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
    }

    #[tokio::test]
    async fn file_is_valid_rejects_tiny_or_missing_files() {
        let dir = tempdir().unwrap();
        let tiny = dir.path().join("tiny.wav");
        tokio::fs::write(&tiny, b"x").await.unwrap();
        assert!(!file_is_valid(&tiny).await);
        assert!(!file_is_valid(&dir.path().join("missing.wav")).await);

        let big = dir.path().join("big.wav");
        tokio::fs::write(&big, vec![0u8; 2048]).await.unwrap();
        assert!(file_is_valid(&big).await);
    }

    #[tokio::test]
    async fn write_then_read_metadata_round_trips() {
        let dir = tempdir().unwrap();
        let store = CacheStore::new(dir.path());
        let video_id = VideoId::new("abc123").unwrap();
        let mut metadata = CacheMetadata::default();
        metadata.transcription = Some(TranscriptionCache {
            model: "large-v3".to_string(),
            library_version: "1.0.0".to_string(),
            language: "en".to_string(),
        });
        store.write_metadata(&video_id, &metadata).await.unwrap();
        let read_back = store.read_metadata(&video_id).await;
        assert_eq!(read_back.transcription, metadata.transcription);
    }

    #[tokio::test]
    async fn corrupt_metadata_file_reads_as_miss() {
        let dir = tempdir().unwrap();
        let store = CacheStore::new(dir.path());
        let video_id = VideoId::new("abc123").unwrap();
        tokio::fs::create_dir_all(store.video_dir(&video_id)).await.unwrap();
        tokio::fs::write(store.metadata_path(&video_id), b"{not valid json")
            .await
            .unwrap();
        let metadata = store.read_metadata(&video_id).await;
        assert!(metadata.transcription.is_none());
        assert!(metadata.stems.is_none());
    }

    #[tokio::test]
    async fn transcription_identity_mismatch_is_a_miss() {
        let current = TranscriptionCache {
            model: "large-v3".to_string(),
            library_version: "1.0.0".to_string(),
            language: "en".to_string(),
        };
        let mut metadata = CacheMetadata::default();
        metadata.transcription = Some(TranscriptionCache {
            model: "large-v3".to_string(),
            library_version: "1.0.0".to_string(),
            language: "es".to_string(),
        });
        assert!(!CacheStore::transcription_valid(&current, &metadata));
    }

    #[tokio::test]
    async fn stems_invalid_when_files_missing_even_with_matching_identity() {
        let dir = tempdir().unwrap();
        let store = CacheStore::new(dir.path());
        let video_id = VideoId::new("abc123").unwrap();
        let current = StemsCache {
            model: "mdx_extra_q".to_string(),
            library_version: "4.0".to_string(),
            input_audio_sha256: "deadbeef".to_string(),
        };
        let mut metadata = CacheMetadata::default();
        metadata.stems = Some(current.clone());
        assert!(!store.stems_valid(&video_id, &current, &metadata).await);
    }
}
