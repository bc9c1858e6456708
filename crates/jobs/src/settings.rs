use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use media_io::Framerate;
use preview_cache::{app_data_dir, CacheDirs, DEFAULT_JPEG_QUALITY};
use serde::{Deserialize, Serialize};
use timeline::{ClockTime, MSECOND, SECOND};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::throttle::RateLimits;
use crate::JobError;

const SETTINGS_FILE: &str = "settings.json";

// Height of an expanded timeline layer, thumbnails keep a margin on both sides.
const EXPANDED_SIZE: u32 = 102;

/// Tunables for preview generation. Every field has a default, so a settings
/// file only needs to name what it overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreviewSettings {
    /// CPU percentage above which waveform analysis slows down.
    pub waveform_cpu_target: f32,
    /// CPU percentage above which thumbnailing slows down.
    pub thumbnail_cpu_target: f32,
    /// Width of one waveform bucket.
    pub sample_duration_ns: ClockTime,
    /// At most one thumbnail per period.
    pub thumbnail_period_ns: ClockTime,
    pub thumbnail_framerate: Framerate,
    pub thumbnail_margin_px: u32,
    pub thumbnail_height: u32,
    pub initial_interval_ms: u64,
    pub rate_period_ms: u64,
    pub rate_floor: f64,
    pub rate_resume_threshold: f64,
    pub jpeg_quality: u8,
    pub autosave_min_secs: u64,
    pub autosave_max_secs: u64,
    pub preroll_timeout_ms: u64,
    /// Extra waveform width served past the visible window.
    pub waveform_margin_px: u32,
    /// Overrides the per-user cache directory.
    pub cache_root: Option<PathBuf>,
}

impl Default for PreviewSettings {
    fn default() -> Self {
        let margin = 3;
        Self {
            waveform_cpu_target: 30.0,
            thumbnail_cpu_target: 20.0,
            sample_duration_ns: 10 * MSECOND,
            thumbnail_period_ns: SECOND / 2,
            thumbnail_framerate: Framerate::new(2, 1),
            thumbnail_margin_px: margin,
            thumbnail_height: EXPANDED_SIZE - 2 * margin,
            initial_interval_ms: 500,
            rate_period_ms: 200,
            rate_floor: 0.1,
            rate_resume_threshold: 0.5,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            autosave_min_secs: 30,
            autosave_max_secs: 80,
            preroll_timeout_ms: 5_000,
            waveform_margin_px: 500,
            cache_root: None,
        }
    }
}

impl PreviewSettings {
    pub fn default_path() -> PathBuf { app_data_dir().join(SETTINGS_FILE) }

    pub fn load(path: &Path) -> Result<Self, JobError> {
        let text = fs::read_to_string(path)?;
        let settings: Self = serde_json::from_str(&text)?;
        settings.validate()?;
        debug!(path = %path.display(), "loaded preview settings");
        Ok(settings)
    }

    /// Settings from [`PreviewSettings::default_path`], falling back to defaults
    /// when the file is missing or unreadable.
    pub fn load_or_default() -> Self {
        let path = Self::default_path();
        if !path.exists() { return Self::default(); }
        Self::load(&path).unwrap_or_else(|e| {
            warn!(path = %path.display(), error = %e, "ignoring preview settings");
            Self::default()
        })
    }

    /// Rejects values that would make a job spin or allocate without bound.
    pub fn validate(&self) -> Result<(), JobError> {
        let invalid = |field, reason| Err(JobError::InvalidSetting { field, reason });
        if self.sample_duration_ns == 0 {
            return invalid("sample_duration_ns", "must be positive");
        }
        if self.thumbnail_period_ns == 0 {
            return invalid("thumbnail_period_ns", "must be positive");
        }
        if self.thumbnail_framerate.num == 0 || self.thumbnail_framerate.den == 0 {
            return invalid("thumbnail_framerate", "must be positive");
        }
        if self.thumbnail_height == 0 {
            return invalid("thumbnail_height", "must be positive");
        }
        if self.initial_interval_ms == 0 {
            return invalid("initial_interval_ms", "must be positive");
        }
        if self.rate_period_ms == 0 {
            return invalid("rate_period_ms", "must be positive");
        }
        if !(self.waveform_cpu_target > 0.0) {
            return invalid("waveform_cpu_target", "must be positive");
        }
        if !(self.thumbnail_cpu_target > 0.0) {
            return invalid("thumbnail_cpu_target", "must be positive");
        }
        if !(self.rate_floor > 0.0) {
            return invalid("rate_floor", "must be positive");
        }
        if !(self.rate_floor < self.rate_resume_threshold) {
            return invalid("rate_resume_threshold", "must be above rate_floor");
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return invalid("jpeg_quality", "must be within 1..=100");
        }
        if self.autosave_min_secs > self.autosave_max_secs {
            return invalid("autosave_min_secs", "must not exceed autosave_max_secs");
        }
        Ok(())
    }

    pub fn cache_dirs(&self) -> Result<CacheDirs, JobError> {
        match &self.cache_root {
            Some(root) => Ok(CacheDirs::under(root)),
            None => Ok(CacheDirs::user_default()?),
        }
    }

    pub fn initial_interval(&self) -> Duration { Duration::from_millis(self.initial_interval_ms) }

    pub fn rate_period(&self) -> Duration { Duration::from_millis(self.rate_period_ms) }

    pub fn preroll_timeout(&self) -> Duration { Duration::from_millis(self.preroll_timeout_ms) }

    pub fn rate_limits(&self) -> RateLimits {
        RateLimits { target: self.waveform_cpu_target, floor: self.rate_floor, resume_above: self.rate_resume_threshold }
    }

    /// Thumbnail width when the pipeline could not tell: 16:9.
    pub fn fallback_thumb_width(&self) -> u32 { 16 * self.thumbnail_height / 9 }

    /// A random delay within the autosave window, so assets opened together
    /// do not all hit the disk in the same tick.
    pub fn autosave_delay(&self) -> Duration {
        let min = self.autosave_min_secs.min(self.autosave_max_secs);
        let span = self.autosave_max_secs.saturating_sub(min).max(1);
        let jitter = (Uuid::new_v4().as_u128() % span as u128) as u64;
        Duration::from_secs(min + jitter)
    }
}
