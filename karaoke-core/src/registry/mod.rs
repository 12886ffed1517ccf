//! Progress registry (§4.1): the single source of truth for per-job
//! status, reachable from both pipeline stages and WebSocket observers.
//!
//! Grounded on the teacher's import session registry pattern
//! (`import_v2`'s session-state map guarded by a single mutex), adapted
//! here to the flatter `JobState` shape this pipeline needs and to the
//! step-range table below instead of per-extractor weighting.

use crate::models::{JobResult, JobState};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Translates a stage's own 0-100 progress into the job's global percent.
pub const STEP_RANGES: &[(&str, u8, u8)] = &[
    ("download", 0, 15),
    ("extract_audio", 15, 25),
    ("analyze_audio", 25, 30),
    ("separate_tracks", 30, 60),
    ("transcribe", 60, 80),
    ("process_lyrics", 80, 88),
    ("generate_subtitles", 88, 92),
    ("merge", 92, 99),
    ("finalize", 99, 100),
];

/// Maps a stage name and the stage's own 0-100 completion into the
/// job's overall 0-100 progress, per the §4.1 step-to-range table.
pub fn stage_progress_to_global(stage: &str, stage_pct: u8) -> u8 {
    let stage_pct = stage_pct.min(100);
    for (name, lo, hi) in STEP_RANGES {
        if *name == stage {
            let span = (*hi - *lo) as u32;
            let offset = span * stage_pct as u32 / 100;
            return (*lo as u32 + offset).min(100) as u8;
        }
    }
    stage_pct
}

/// A cancellable unit of background work registered against a job.
/// Implemented over `tokio_util`'s cancellation token, the same
/// primitive the teacher uses for its import sessions.
pub trait TaskHandle: Send + Sync {
    fn cancel(&self);
    fn is_cancelled(&self) -> bool;
}

impl TaskHandle for CancellationToken {
    fn cancel(&self) {
        CancellationToken::cancel(self)
    }

    fn is_cancelled(&self) -> bool {
        CancellationToken::is_cancelled(self)
    }
}

struct Entry {
    state: JobState,
    task: Option<Arc<dyn TaskHandle>>,
    updated_at: Instant,
}

fn is_error_or_cancel(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("error") || lower.contains("cancel")
}

/// In-memory, mutex-guarded job status store. Cheap to clone; clones
/// share the same underlying map.
#[derive(Clone)]
pub struct ProgressRegistry {
    inner: Arc<Mutex<HashMap<Uuid, Entry>>>,
    notify: Arc<Notify>,
}

impl Default for ProgressRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            notify: Arc::new(Notify::new()),
        }
    }

    pub async fn create(&self, job_id: Uuid, message: impl Into<String>) {
        let mut map = self.inner.lock().await;
        map.insert(
            job_id,
            Entry {
                state: JobState::new(message),
                task: None,
                updated_at: Instant::now(),
            },
        );
    }

    pub async fn register_task(&self, job_id: Uuid, handle: Arc<dyn TaskHandle>) {
        let mut map = self.inner.lock().await;
        if let Some(entry) = map.get_mut(&job_id) {
            entry.task = Some(handle);
        }
    }

    /// Monotone-aware update (§4.1): ignores updates once the job has
    /// reached a terminal success, accepts error/cancel updates
    /// unconditionally, suppresses duplicate no-op messages, and clamps
    /// progress into `[0, 100]`.
    pub async fn update(
        &self,
        job_id: Uuid,
        progress: u8,
        message: impl Into<String>,
        is_step_start: bool,
        result: Option<JobResult>,
        stage: Option<&str>,
    ) {
        let message = message.into();
        let mut map = self.inner.lock().await;
        let Some(entry) = map.get_mut(&job_id) else {
            return;
        };

        let was_terminal_success =
            entry.state.progress >= 100 && entry.state.result.is_some();
        let is_error_or_cancel_update = is_error_or_cancel(&message);

        if was_terminal_success && !is_error_or_cancel_update {
            return;
        }

        let clamped = progress.min(100);
        if clamped == entry.state.progress
            && message == entry.state.message
            && is_step_start == entry.state.is_step_start
        {
            return;
        }

        entry.state.progress = clamped;
        entry.state.message = message.clone();
        entry.state.is_step_start = is_step_start;
        if let Some(stage) = stage {
            entry.state.stage = stage.to_string();
        }
        if result.is_some() {
            entry.state.result = result;
        }
        if is_error_or_cancel_update {
            entry.state.cancelled = message.to_lowercase().contains("cancel");
        }
        entry.updated_at = Instant::now();
        drop(map);
        self.notify.notify_waiters();
    }

    pub async fn get(&self, job_id: Uuid) -> Option<JobState> {
        let map = self.inner.lock().await;
        map.get(&job_id).map(|e| e.state.clone())
    }

    pub async fn exists(&self, job_id: Uuid) -> bool {
        self.inner.lock().await.contains_key(&job_id)
    }

    pub async fn active_count(&self) -> usize {
        let map = self.inner.lock().await;
        map.values().filter(|e| !e.state.is_terminal()).count()
    }

    pub async fn stats(&self) -> RegistryStats {
        let map = self.inner.lock().await;
        let total = map.len();
        let active = map.values().filter(|e| !e.state.is_terminal()).count();
        RegistryStats { total, active, terminal: total - active }
    }

    /// Sets the cancel flag on the job's registered task (if any) and
    /// transitions the entry to a terminal cancelled state, unless it
    /// is already terminal.
    pub async fn cancel(&self, job_id: Uuid) -> bool {
        let mut map = self.inner.lock().await;
        let Some(entry) = map.get_mut(&job_id) else {
            return false;
        };
        if entry.state.is_terminal() {
            return false;
        }
        if let Some(task) = &entry.task {
            task.cancel();
        }
        entry.state.progress = 100;
        entry.state.cancelled = true;
        entry.state.message = "Job cancelled by user.".to_string();
        entry.state.is_step_start = false;
        entry.updated_at = Instant::now();
        drop(map);
        self.notify.notify_waiters();
        true
    }

    /// Used on shutdown: cancels every non-terminal job's task.
    pub async fn cancel_all(&self) {
        let map = self.inner.lock().await;
        for entry in map.values() {
            if !entry.state.is_terminal() {
                if let Some(task) = &entry.task {
                    task.cancel();
                }
            }
        }
    }

    /// One sweep pass: removes terminal entries older than `ttl`.
    pub async fn sweep(&self, ttl: Duration) {
        let mut map = self.inner.lock().await;
        let now = Instant::now();
        map.retain(|_, entry| {
            !(entry.state.is_terminal() && now.duration_since(entry.updated_at) > ttl)
        });
    }

    /// Runs `sweep` on `interval` until `shutdown` is cancelled.
    pub async fn run_cleanup_loop(
        &self,
        interval: Duration,
        ttl: Duration,
        shutdown: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.sweep(ttl).await,
                _ = shutdown.cancelled() => break,
            }
        }
    }
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct RegistryStats {
    pub total: usize,
    pub active: usize,
    pub terminal: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_progress_maps_into_its_range() {
        assert_eq!(stage_progress_to_global("separate_tracks", 0), 30);
        assert_eq!(stage_progress_to_global("separate_tracks", 100), 60);
        assert_eq!(stage_progress_to_global("separate_tracks", 50), 45);
        assert_eq!(stage_progress_to_global("finalize", 100), 100);
    }

    #[tokio::test]
    async fn create_then_get_returns_zero_progress() {
        let reg = ProgressRegistry::new();
        let id = Uuid::new_v4();
        reg.create(id, "queued").await;
        let state = reg.get(id).await.unwrap();
        assert_eq!(state.progress, 0);
        assert!(state.is_step_start);
    }

    #[tokio::test]
    async fn update_after_terminal_success_is_ignored() {
        let reg = ProgressRegistry::new();
        let id = Uuid::new_v4();
        reg.create(id, "queued").await;
        let result = JobResult {
            video_id: "abc".to_string(),
            processed_path: "processed/abc_karaoke.mp4".to_string(),
            title: "abc".to_string(),
            stems_base_path: None,
            bpm: None,
            key: None,
            key_confidence: None,
        };
        reg.update(id, 100, "done", false, Some(result), Some("finalize")).await;
        reg.update(id, 50, "oops, rewound", true, None, Some("merge")).await;
        let state = reg.get(id).await.unwrap();
        assert_eq!(state.progress, 100);
        assert_eq!(state.message, "done");
    }

    #[tokio::test]
    async fn error_update_after_terminal_success_is_accepted() {
        let reg = ProgressRegistry::new();
        let id = Uuid::new_v4();
        reg.create(id, "queued").await;
        let result = JobResult {
            video_id: "abc".to_string(),
            processed_path: "processed/abc_karaoke.mp4".to_string(),
            title: "abc".to_string(),
            stems_base_path: None,
            bpm: None,
            key: None,
            key_confidence: None,
        };
        reg.update(id, 100, "done", false, Some(result), Some("finalize")).await;
        reg.update(id, 100, "error: disk full during cleanup", false, None, None).await;
        let state = reg.get(id).await.unwrap();
        assert_eq!(state.message, "error: disk full during cleanup");
    }

    #[tokio::test]
    async fn progress_is_clamped_to_100() {
        let reg = ProgressRegistry::new();
        let id = Uuid::new_v4();
        reg.create(id, "queued").await;
        reg.update(id, 250, "overshoot", true, None, Some("download")).await;
        assert_eq!(reg.get(id).await.unwrap().progress, 100);
    }

    #[tokio::test]
    async fn cancel_sets_terminal_cancelled_state() {
        let reg = ProgressRegistry::new();
        let id = Uuid::new_v4();
        reg.create(id, "queued").await;
        let token = CancellationToken::new();
        reg.register_task(id, Arc::new(token.clone())).await;
        assert!(reg.cancel(id).await);
        assert!(token.is_cancelled());
        let state = reg.get(id).await.unwrap();
        assert!(state.is_terminal());
        assert!(state.cancelled);
    }

    #[tokio::test]
    async fn cancel_on_already_terminal_job_is_a_no_op() {
        let reg = ProgressRegistry::new();
        let id = Uuid::new_v4();
        reg.create(id, "queued").await;
        reg.cancel(id).await;
        assert!(!reg.cancel(id).await);
    }

    #[tokio::test]
    async fn sweep_removes_only_terminal_entries_past_ttl() {
        let reg = ProgressRegistry::new();
        let id = Uuid::new_v4();
        reg.create(id, "queued").await;
        reg.cancel(id).await;
        reg.sweep(Duration::from_secs(0)).await;
        assert!(!reg.exists(id).await);
    }

    #[tokio::test]
    async fn sweep_leaves_non_terminal_entries_alone() {
        let reg = ProgressRegistry::new();
        let id = Uuid::new_v4();
        reg.create(id, "queued").await;
        reg.sweep(Duration::from_secs(0)).await;
        assert!(reg.exists(id).await);
    }

    #[tokio::test]
    async fn stats_counts_active_and_terminal_separately() {
        let reg = ProgressRegistry::new();
        let running = Uuid::new_v4();
        let done = Uuid::new_v4();
        reg.create(running, "queued").await;
        reg.create(done, "queued").await;
        reg.cancel(done).await;
        let stats = reg.stats().await;
        assert_eq!(stats.total, 2);
        assert_eq!(stats.active, 1);
        assert_eq!(stats.terminal, 1);
    }
}
