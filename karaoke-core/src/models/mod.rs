//! Data types shared across the pipeline: jobs, cache records, karaoke segments.

mod cache;
mod job;
mod segment;

pub use cache::{AudioAnalysisCache, CacheMetadata, StemsCache, TranscriptionCache};
pub use job::{Job, JobResult, JobState, ProcessOptions, SourceSpec, SubtitlePosition, VideoId};
pub use segment::{KaraokeSegment, Word};
