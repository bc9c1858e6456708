//! Background preview generation: scheduling, CPU throttling and the two
//! generation jobs (thumbnails and waveforms), all driven from one control loop.

mod job;
mod runtime;
mod scheduler;
mod settings;
mod sinks;
mod throttle;
mod thumbnails;
mod timers;
mod waveform;

#[cfg(test)]
mod testing;

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

pub use job::{GenerationJob, JobContext};
pub use runtime::{ControlLoop, JobsHandle};
pub use scheduler::{Admission, CategoryStatus, JobScheduler};
pub use settings::PreviewSettings;
pub use sinks::{PreviewSink, ThumbnailSink, WaveformSink};
pub use throttle::{IntervalController, RateController, RateLimits};
pub use thumbnails::{thumb_duration, ThumbnailJob, ThumbnailSlot, ThumbnailState};
pub use timers::{JobTimer, TimerId};
pub use waveform::{downmix, level_to_percent, LevelAccumulator, WaveformJob, WaveformState, SAMPLE_DURATION};

#[derive(Debug, Error)]
pub enum JobError {
    #[error("unknown job {0}")]
    UnknownJob(JobId),
    #[error(transparent)]
    Cache(#[from] preview_cache::CacheError),
    #[error(transparent)]
    Media(#[from] media_io::MediaError),
    #[error("invalid settings: {0}")]
    Settings(#[from] serde_json::Error),
    #[error("invalid setting {field}: {reason}")]
    InvalidSetting { field: &'static str, reason: &'static str },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(Uuid);

impl JobId {
    pub(crate) fn new() -> Self { Self(Uuid::new_v4()) }

    pub fn as_uuid(&self) -> Uuid { self.0 }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.0.simple().to_string();
        f.write_str(&s[..8])
    }
}

/// Jobs of one category run one at a time; categories run side by side.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum MediaCategory {
    Image,
    Audio,
}

impl MediaCategory {
    pub const ALL: [MediaCategory; 2] = [MediaCategory::Image, MediaCategory::Audio];
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum JobStatus {
    Pending,
    Running,
    Progress(f32),
    Done,
    Failed(String),
    Canceled,
}

impl JobStatus {
    /// Whether the job gave up its scheduling slot.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed(_) | JobStatus::Canceled)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEvent {
    pub id: JobId,
    pub source: String,
    pub category: MediaCategory,
    pub status: JobStatus,
}
