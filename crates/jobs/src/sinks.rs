//! Preview collection inside pipelines the control loop does not own.
//!
//! A proxy transcoder decodes the whole source anyway, so it can embed a
//! [`PreviewBranch`] and hand the branch's events to a sink. The sink fills
//! the same stores the generation jobs use, and `finalize` shares them with
//! the proxy once transcoding is over.

use media_io::{PipelineEvent, PreviewBranch, SamplePayload};
use preview_cache::{ContentDigest, PreviewCaches, SharedThumbnailCache};
use timeline::{quantize, ClockTime};
use tracing::{debug, info, trace, warn};

use crate::settings::PreviewSettings;
use crate::waveform::LevelAccumulator;
use crate::JobError;

/// Feeds preview data from an externally driven pipeline into the caches.
pub trait PreviewSink {
    /// The elements the owning pipeline has to embed for this sink.
    fn branch(&self) -> &PreviewBranch;

    fn on_event(&mut self, event: &PipelineEvent);

    /// Persists what was gathered and shares it with `proxy`.
    fn finalize(&mut self, caches: &mut PreviewCaches, proxy: Option<&ContentDigest>) -> Result<(), JobError>;
}

/// Stores every frame of a thumbnail branch, snapped to the thumbnail period.
pub struct ThumbnailSink {
    digest: ContentDigest,
    branch: PreviewBranch,
    period: ClockTime,
    cache: SharedThumbnailCache,
    stored: usize,
}

impl ThumbnailSink {
    pub fn new(
        digest: ContentDigest,
        settings: &PreviewSettings,
        teed: bool,
        caches: &mut PreviewCaches,
    ) -> Result<Self, JobError> {
        let cache = caches.thumbnails(&digest)?;
        let branch =
            PreviewBranch::Thumbnails { height: settings.thumbnail_height, framerate: settings.thumbnail_framerate, teed };
        Ok(Self { digest, branch, period: settings.thumbnail_period_ns, cache, stored: 0 })
    }

    pub fn stored(&self) -> usize { self.stored }
}

impl PreviewSink for ThumbnailSink {
    fn branch(&self) -> &PreviewBranch { &self.branch }

    fn on_event(&mut self, event: &PipelineEvent) {
        let PipelineEvent::SampleReady { time, payload: Some(SamplePayload::Image(frame)) } = event else { return };
        let time = quantize(*time, self.period);
        if let Err(e) = self.cache.borrow_mut().write(time, frame) {
            warn!(digest = self.digest.short(), time, error = %e, "JPEG compression failed, skipping thumbnail");
            return;
        }
        self.stored += 1;
        trace!(digest = self.digest.short(), time, "stored thumbnail from branch");
    }

    fn finalize(&mut self, caches: &mut PreviewCaches, proxy: Option<&ContentDigest>) -> Result<(), JobError> {
        self.cache.borrow_mut().commit()?;
        if let Some(proxy) = proxy {
            caches.alias_thumbnails(&self.digest, proxy)?;
        }
        debug!(digest = self.digest.short(), stored = self.stored, "thumbnail branch finalized");
        Ok(())
    }
}

/// Accumulates the levels of an audio branch into a waveform.
///
/// When the store already holds a waveform for the source, the sink passes
/// levels through untouched and only aliases on `finalize`.
pub struct WaveformSink {
    digest: ContentDigest,
    branch: PreviewBranch,
    passthrough: bool,
    levels: LevelAccumulator,
}

impl WaveformSink {
    /// `duration` is the full duration of the source.
    pub fn new(
        digest: ContentDigest,
        duration: ClockTime,
        settings: &PreviewSettings,
        caches: &PreviewCaches,
    ) -> Self {
        let passthrough = caches.waveforms().exists(&digest);
        let bucket = settings.sample_duration_ns;
        Self {
            digest,
            branch: PreviewBranch::Levels { interval: bucket },
            passthrough,
            levels: LevelAccumulator::new(duration, bucket),
        }
    }

    pub fn is_passthrough(&self) -> bool { self.passthrough }

    pub fn levels(&self) -> &LevelAccumulator { &self.levels }
}

impl PreviewSink for WaveformSink {
    fn branch(&self) -> &PreviewBranch { &self.branch }

    fn on_event(&mut self, event: &PipelineEvent) {
        if self.passthrough {
            return;
        }
        if let PipelineEvent::SampleReady { time, payload: Some(SamplePayload::Levels(levels)) } = event {
            self.levels.push(*time, levels);
        }
    }

    fn finalize(&mut self, caches: &mut PreviewCaches, proxy: Option<&ContentDigest>) -> Result<(), JobError> {
        let store = caches.waveforms();
        if !self.passthrough && !self.levels.is_empty() {
            let samples = std::mem::replace(&mut self.levels, LevelAccumulator::new(0, 1)).into_mono();
            store.write(&self.digest, &samples)?;
            info!(digest = self.digest.short(), samples = samples.len(), "waveform from branch saved");
            self.passthrough = true;
        }
        if let Some(proxy) = proxy {
            if store.exists(&self.digest) {
                store.alias(proxy, &self.digest)?;
            } else {
                warn!(digest = self.digest.short(), "no waveform to share with the proxy");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::frame;
    use preview_cache::{CacheDirs, DEFAULT_JPEG_QUALITY};
    use timeline::{MSECOND, SECOND};

    fn caches(root: &std::path::Path) -> PreviewCaches {
        PreviewCaches::new(CacheDirs::under(root), DEFAULT_JPEG_QUALITY).unwrap()
    }

    fn image(time: ClockTime) -> PipelineEvent {
        PipelineEvent::SampleReady { time, payload: Some(SamplePayload::Image(frame(170, 96))) }
    }

    fn levels(time: ClockTime, db: &[f64]) -> PipelineEvent {
        PipelineEvent::SampleReady { time, payload: Some(SamplePayload::Levels(db.to_vec())) }
    }

    #[test]
    fn test_thumbnail_sink_stores_on_the_period_grid() {
        let dir = tempfile::tempdir().unwrap();
        let mut caches = caches(dir.path());
        let settings = PreviewSettings::default();
        let digest = ContentDigest::new("c1ip");
        let mut sink = ThumbnailSink::new(digest.clone(), &settings, true, &mut caches).unwrap();
        assert!(sink.branch().launch_line().starts_with("tee"));

        sink.on_event(&image(3 * MSECOND));
        sink.on_event(&image(SECOND / 2 + 40 * MSECOND));
        sink.on_event(&levels(0, &[-20.0]));
        sink.on_event(&PipelineEvent::EndOfStream);
        assert_eq!(sink.stored(), 2);

        let proxy = ContentDigest::new("pr0xy");
        sink.finalize(&mut caches, Some(&proxy)).unwrap();
        let cache = caches.thumbnails(&digest).unwrap();
        assert!(!cache.borrow().has_pending_writes());
        assert_eq!(cache.borrow().times().unwrap(), vec![0, SECOND / 2]);
        assert!(dir.path().join("thumbs").join("pr0xy").exists());
        assert_eq!(caches.thumbnails(&proxy).unwrap().borrow().len().unwrap(), 2);
    }

    #[test]
    fn test_waveform_sink_writes_mono_and_links_proxy() {
        let dir = tempfile::tempdir().unwrap();
        let mut caches = caches(dir.path());
        let settings = PreviewSettings::default();
        let digest = ContentDigest::new("70ne");
        let mut sink = WaveformSink::new(digest.clone(), 30 * MSECOND, &settings, &caches);
        assert!(!sink.is_passthrough());
        assert_eq!(sink.branch(), &PreviewBranch::Levels { interval: 10 * MSECOND });

        sink.on_event(&levels(0, &[-20.0, -40.0]));
        sink.on_event(&levels(10 * MSECOND, &[-20.0, -40.0]));
        sink.on_event(&levels(20 * MSECOND, &[0.0, 1.0]));
        assert_eq!(sink.levels().channels().len(), 2);

        let proxy = ContentDigest::new("pr0xy");
        sink.finalize(&mut caches, Some(&proxy)).unwrap();
        let stored = caches.waveforms().load(&digest).unwrap();
        assert_eq!(stored.len(), 3);
        assert!((stored[0] - 5.5).abs() < 1e-9);
        assert_eq!(stored[2], stored[1]);
        assert_eq!(caches.waveforms().load(&proxy).unwrap(), stored);
    }

    #[test]
    fn test_waveform_sink_passes_through_known_sources() {
        let dir = tempfile::tempdir().unwrap();
        let mut caches = caches(dir.path());
        let digest = ContentDigest::new("70ne");
        caches.waveforms().write(&digest, &[42.0]).unwrap();
        let mut sink = WaveformSink::new(digest.clone(), SECOND, &PreviewSettings::default(), &caches);
        assert!(sink.is_passthrough());

        sink.on_event(&levels(0, &[-20.0]));
        assert!(sink.levels().is_empty());
        sink.finalize(&mut caches, Some(&ContentDigest::new("pr0xy"))).unwrap();
        assert_eq!(caches.waveforms().load(&digest).unwrap(), vec![42.0]);
        assert_eq!(caches.waveforms().load(&ContentDigest::new("pr0xy")).unwrap(), vec![42.0]);
    }

    #[test]
    fn test_finalize_without_proxy_only_persists() {
        let dir = tempfile::tempdir().unwrap();
        let mut caches = caches(dir.path());
        let digest = ContentDigest::new("70ne");
        let mut sink = WaveformSink::new(digest.clone(), 20 * MSECOND, &PreviewSettings::default(), &caches);
        sink.on_event(&levels(0, &[-20.0]));
        sink.finalize(&mut caches, None).unwrap();
        assert!(caches.waveforms().exists(&digest));
        assert_eq!(std::fs::read_dir(dir.path().join("waves")).unwrap().count(), 1);
    }
}
