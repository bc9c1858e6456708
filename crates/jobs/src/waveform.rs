use std::any::Any;

use media_io::{Pipeline, PipelineDescription, PipelineEvent, PipelineState, SamplePayload, SeekFlags};
use preview_cache::ContentDigest;
use timeline::{ClipTiming, ClockTime, Rect, Zoom, MSECOND};
use tracing::{debug, error, info, trace, warn};

use crate::job::{GenerationJob, JobContext};
use crate::settings::PreviewSettings;
use crate::throttle::RateController;
use crate::timers::{JobTimer, TimerId};
use crate::{JobStatus, MediaCategory};

/// Default width of one waveform bucket.
pub const SAMPLE_DURATION: ClockTime = 10 * MSECOND;

const DIAGNOSTICS_LABEL: &str = "error-generating-waveforms";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaveformState {
    Idle,
    /// Looking for a previously computed waveform.
    Discovering,
    LoadingCached,
    PipelineConfigured,
    Generating,
    Done,
    Error,
}

/// Linear amplitude percentage of an RMS level in dB, or `None` when the
/// level carries no reading.
pub fn level_to_percent(db: f64) -> Option<f64> {
    if db < 0.0 {
        Some(10f64.powf(db / 20.0) * 100.0)
    } else {
        None
    }
}

/// Mono mix of per-channel peaks: the mean of the first two channels.
pub fn downmix(channels: &[Vec<f64>]) -> Vec<f64> {
    match channels {
        [] => Vec::new(),
        [mono] => mono.clone(),
        [left, right, ..] => left.iter().zip(right).map(|(l, r)| (l + r) / 2.0).collect(),
    }
}

/// Per-channel peaks, one value per bucket of the source's duration.
///
/// Buckets are allocated on the first reading, once the channel count is known.
/// A reading without a usable level holds the previous bucket's value.
#[derive(Debug, Clone)]
pub struct LevelAccumulator {
    bucket: ClockTime,
    n_samples: usize,
    peaks: Vec<Vec<f64>>,
}

impl LevelAccumulator {
    pub fn new(duration: ClockTime, bucket: ClockTime) -> Self {
        let bucket = bucket.max(1);
        Self { bucket, n_samples: (duration / bucket) as usize, peaks: Vec::new() }
    }

    pub fn push(&mut self, time: ClockTime, levels: &[f64]) {
        if levels.is_empty() {
            return;
        }
        if self.peaks.is_empty() {
            self.peaks = vec![vec![0.0; self.n_samples]; levels.len()];
        }
        let pos = (time / self.bucket) as usize;
        if pos >= self.n_samples {
            trace!(time, "level past the end of the source");
            return;
        }
        for (channel, db) in self.peaks.iter_mut().zip(levels) {
            channel[pos] = match level_to_percent(*db) {
                Some(percent) => percent,
                None if pos > 0 => channel[pos - 1],
                None => channel[pos],
            };
        }
    }

    pub fn channels(&self) -> &[Vec<f64>] { &self.peaks }

    pub fn is_empty(&self) -> bool { self.peaks.is_empty() }

    pub fn into_mono(self) -> Vec<f64> { downmix(&self.peaks) }
}

/// Computes the amplitude envelope of an audio source, throttled by a
/// [`RateController`], and persists it to the waveform store.
pub struct WaveformJob {
    uri: String,
    digest: ContentDigest,
    proxy: Option<ContentDigest>,
    timing: ClipTiming,
    state: WaveformState,
    pipeline: Option<Box<dyn Pipeline>>,
    generation: u32,
    levels: Option<LevelAccumulator>,
    samples: Option<Vec<f64>>,
    failures: u32,
    adapter: Option<RateController>,
    rate_timer: Option<TimerId>,
    last_error: Option<String>,
    needs_redraw: bool,
}

impl WaveformJob {
    pub fn new(uri: impl Into<String>, digest: ContentDigest, timing: ClipTiming) -> Self {
        Self {
            uri: uri.into(),
            digest,
            proxy: None,
            timing,
            state: WaveformState::Idle,
            pipeline: None,
            generation: 0,
            levels: None,
            samples: None,
            failures: 0,
            adapter: None,
            rate_timer: None,
            last_error: None,
            needs_redraw: false,
        }
    }

    /// The finished waveform is shared with `proxy`.
    pub fn with_proxy(mut self, proxy: ContentDigest) -> Self {
        self.proxy = Some(proxy);
        self
    }

    pub fn state(&self) -> WaveformState { self.state }

    pub fn failures(&self) -> u32 { self.failures }

    pub fn last_error(&self) -> Option<&str> { self.last_error.as_deref() }

    pub fn samples(&self) -> Option<&[f64]> { self.samples.as_deref() }

    pub fn levels(&self) -> Option<&LevelAccumulator> { self.levels.as_ref() }

    pub fn rate(&self) -> Option<f64> { self.adapter.as_ref().map(RateController::rate) }

    pub fn take_redraw(&mut self) -> bool { std::mem::take(&mut self.needs_redraw) }

    /// Samples covering the visible part of the clip plus a trailing margin.
    pub fn visible_samples(&self, rect: Rect, zoom: Zoom, settings: &PreviewSettings) -> &[f64] {
        let Some(samples) = self.samples.as_deref() else { return &[] };
        let bucket = settings.sample_duration_ns.max(1);
        let skipped = match (self.timing.in_point, self.timing.duration) {
            (0, _) | (_, 0) => 0,
            (in_point, duration) => (samples.len() as f64 * in_point as f64 / duration as f64) as usize,
        };
        let start = (zoom.pixel_to_ns(rect.x) / bucket) as usize + skipped;
        let end = (zoom.pixel_to_ns(rect.x + rect.width) / bucket) as usize + skipped;
        let margin = (zoom.pixel_to_ns(settings.waveform_margin_px as f64) / bucket) as usize;
        let end = (end + margin).min(samples.len());
        &samples[start.min(end)..end]
    }

    fn discover(&mut self, ctx: &mut JobContext<'_>) {
        if self.state != WaveformState::Discovering {
            return;
        }
        let store = ctx.caches().waveforms();
        let cached = store.exists(&self.digest).then(|| store.load(&self.digest));
        match cached {
            Some(Ok(samples)) => {
                self.state = WaveformState::LoadingCached;
                debug!(source = %self.uri, samples = samples.len(), "using cached waveform");
                self.samples = Some(samples);
                self.share_with_proxy(ctx);
                self.complete(ctx);
            }
            Some(Err(e)) => {
                warn!(source = %self.uri, error = %e, "discarding unreadable waveform");
                self.launch(ctx);
            }
            None => self.launch(ctx),
        }
    }

    fn launch(&mut self, ctx: &mut JobContext<'_>) {
        self.generation += 1;
        self.levels = None;
        let description =
            PipelineDescription::Levels { uri: self.uri.clone(), interval: ctx.settings().sample_duration_ns };
        let mut pipeline = match ctx.configure(&description, self.generation) {
            Ok(pipeline) => pipeline,
            Err(e) => return self.on_failure(e.to_string(), ctx),
        };
        self.state = WaveformState::PipelineConfigured;
        let started = pipeline.set_state(PipelineState::Playing);
        self.pipeline = Some(pipeline);
        match started {
            Ok(()) => {
                self.state = WaveformState::Generating;
                debug!(source = %self.uri, attempt = self.failures + 1, "generating waveform");
            }
            Err(e) => self.on_failure(e.to_string(), ctx),
        }
    }

    fn on_state_changed(&mut self, prev: PipelineState, new: PipelineState, ctx: &mut JobContext<'_>) {
        let suspended = self.adapter.as_ref().is_some_and(RateController::is_suspended);
        if let (Some(adapter), Some(pipeline)) = (self.adapter.as_mut(), self.pipeline.as_mut()) {
            adapter.on_state_changed(prev, new, &mut **pipeline);
        }
        match (prev, new) {
            (PipelineState::Ready, PipelineState::Paused) if !suspended => {
                if let Some(pipeline) = self.pipeline.as_mut() {
                    if let Err(e) = pipeline.seek(1.0, SeekFlags::FLUSH_ACCURATE, 0) {
                        warn!(error = %e, "could not seek to the start");
                    }
                }
            }
            (PipelineState::Paused, PipelineState::Playing) if self.adapter.is_none() && self.failures == 0 => {
                let settings = ctx.settings();
                self.adapter = Some(RateController::new(ctx.cpu_sampler(), settings.rate_limits()));
                self.rate_timer = Some(ctx.schedule(settings.rate_period(), JobTimer::RateCycle));
                trace!(source = %self.uri, "rate control attached");
            }
            _ => {}
        }
    }

    fn on_levels(&mut self, time: ClockTime, levels: &[f64], ctx: &mut JobContext<'_>) {
        if self.levels.is_none() {
            let duration = match self.timing.duration {
                0 => self.pipeline.as_ref().and_then(|p| p.query_duration()).unwrap_or(0),
                known => known,
            };
            if duration == 0 {
                return self.abandon("source duration is unknown".to_string(), ctx);
            }
            self.levels = Some(LevelAccumulator::new(duration, ctx.settings().sample_duration_ns));
        }
        if let Some(acc) = self.levels.as_mut() {
            acc.push(time, levels);
        }
    }

    fn rate_cycle(&mut self, ctx: &mut JobContext<'_>) {
        self.rate_timer = None;
        let (Some(adapter), Some(pipeline)) = (self.adapter.as_mut(), self.pipeline.as_mut()) else { return };
        if adapter.cycle(&mut **pipeline) {
            self.rate_timer = Some(ctx.schedule(ctx.settings().rate_period(), JobTimer::RateCycle));
        }
    }

    fn detach_adapter(&mut self, ctx: &mut JobContext<'_>) {
        if let Some(mut adapter) = self.adapter.take() {
            adapter.stop();
        }
        if let Some(timer) = self.rate_timer.take() {
            ctx.cancel(timer);
        }
    }

    fn release_pipeline(&mut self) {
        if let Some(mut pipeline) = self.pipeline.take() {
            if let Err(e) = pipeline.set_state(PipelineState::Null) {
                warn!(error = %e, "could not shut the waveform pipeline down");
            }
        }
    }

    fn finalize(&mut self, ctx: &mut JobContext<'_>) {
        self.detach_adapter(ctx);
        self.release_pipeline();
        let samples = self.levels.take().map(LevelAccumulator::into_mono).unwrap_or_default();
        if samples.is_empty() {
            return self.abandon("no audio levels before the end of stream".to_string(), ctx);
        }
        if let Err(e) = ctx.caches().waveforms().write(&self.digest, &samples) {
            error!(source = %self.uri, error = %e, "could not save waveform");
        }
        self.samples = Some(samples);
        self.share_with_proxy(ctx);
        self.complete(ctx);
    }

    fn share_with_proxy(&self, ctx: &mut JobContext<'_>) {
        let Some(proxy) = &self.proxy else { return };
        let store = ctx.caches().waveforms();
        if !store.exists(&self.digest) {
            return;
        }
        if let Err(e) = store.alias(proxy, &self.digest) {
            warn!(proxy = proxy.short(), error = %e, "could not share waveform with proxy");
        }
    }

    fn complete(&mut self, ctx: &mut JobContext<'_>) {
        self.state = WaveformState::Done;
        self.needs_redraw = true;
        info!(source = %self.uri, samples = self.samples.as_ref().map_or(0, Vec::len), "waveform ready");
        ctx.emit(JobStatus::Done);
    }

    fn on_failure(&mut self, reason: String, ctx: &mut JobContext<'_>) {
        self.detach_adapter(ctx);
        self.failures += 1;
        if self.failures < 2 {
            warn!(source = %self.uri, %reason, attempt = self.failures, "waveform generation failed, retrying without rate control");
            self.release_pipeline();
            self.launch(ctx);
            return;
        }
        self.abandon(reason, ctx);
    }

    fn abandon(&mut self, reason: String, ctx: &mut JobContext<'_>) {
        self.detach_adapter(ctx);
        error!(source = %self.uri, %reason, "waveform generation failed, giving up");
        if let Some(pipeline) = self.pipeline.as_ref() {
            pipeline.dump_diagnostics(DIAGNOSTICS_LABEL);
        }
        self.release_pipeline();
        self.levels = None;
        self.last_error = Some(reason.clone());
        self.state = WaveformState::Error;
        ctx.emit(JobStatus::Failed(reason));
    }
}

impl GenerationJob for WaveformJob {
    fn category(&self) -> MediaCategory { MediaCategory::Audio }

    fn source(&self) -> &str { &self.uri }

    fn start(&mut self, ctx: &mut JobContext<'_>) {
        self.failures = 0;
        self.last_error = None;
        self.state = WaveformState::Discovering;
        ctx.emit(JobStatus::Running);
        ctx.when_idle(JobTimer::Discover);
    }

    fn stop(&mut self, ctx: &mut JobContext<'_>) {
        let active = matches!(
            self.state,
            WaveformState::Discovering
                | WaveformState::LoadingCached
                | WaveformState::PipelineConfigured
                | WaveformState::Generating
        );
        self.detach_adapter(ctx);
        self.release_pipeline();
        if active {
            self.state = WaveformState::Idle;
            ctx.emit(JobStatus::Canceled);
        }
    }

    fn is_finished(&self) -> bool { matches!(self.state, WaveformState::Done | WaveformState::Error) }

    fn on_pipeline_event(&mut self, generation: u32, event: PipelineEvent, ctx: &mut JobContext<'_>) {
        if generation != self.generation || self.pipeline.is_none() {
            trace!(generation, "dropping event of a previous pipeline");
            return;
        }
        match event {
            PipelineEvent::SampleReady { time, payload: Some(SamplePayload::Levels(levels)) } => {
                self.on_levels(time, &levels, ctx)
            }
            PipelineEvent::SampleReady { time, .. } => trace!(time, "sample without levels"),
            PipelineEvent::StateChanged { prev, new } => self.on_state_changed(prev, new, ctx),
            PipelineEvent::EndOfStream => self.finalize(ctx),
            PipelineEvent::Error(reason) => self.on_failure(reason, ctx),
            PipelineEvent::AsyncDone => {}
        }
    }

    fn on_timer(&mut self, timer: JobTimer, ctx: &mut JobContext<'_>) {
        match timer {
            JobTimer::Discover => self.discover(ctx),
            JobTimer::RateCycle => self.rate_cycle(ctx),
            JobTimer::StartCapture | JobTimer::NextCapture | JobTimer::Autosave => {}
        }
    }

    fn visible_range_changed(&mut self, _rect: Rect, _zoom: Zoom, _ctx: &mut JobContext<'_>) -> bool {
        self.needs_redraw = true;
        self.samples.is_some()
    }

    fn as_any(&self) -> &dyn Any { self }

    fn as_any_mut(&mut self) -> &mut dyn Any { self }
}
