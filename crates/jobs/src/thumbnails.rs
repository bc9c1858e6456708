use std::any::Any;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::Duration;

use image::RgbaImage;
use media_io::{Pipeline, PipelineDescription, PipelineEvent, PipelineState, Preroll, SamplePayload, SeekFlags};
use preview_cache::{ContentDigest, SharedThumbnailCache};
use timeline::{buckets, nearest_bucket, quantize, quantize_up, ClipTiming, ClockTime, Rect, Zoom};
use tracing::{debug, error, info, trace, warn};

use crate::job::{GenerationJob, JobContext};
use crate::throttle::IntervalController;
use crate::timers::{JobTimer, TimerId};
use crate::{JobStatus, MediaCategory};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThumbnailState {
    Idle,
    PipelineConfigured,
    /// Prerolled; capture starts once the loop is idle.
    AwaitingIdleSlot,
    Generating,
    Done,
    Error,
}

/// One thumbnail position in the visible window, relative to the clip's left edge.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThumbnailSlot {
    pub time: ClockTime,
    pub x: f64,
    pub y: f64,
    pub cached: bool,
}

/// Timeline duration covered by a thumbnail `px` pixels wide, never shorter
/// than one thumbnail period.
pub fn thumb_duration(zoom: Zoom, px: u32, period: ClockTime) -> ClockTime {
    quantize_up(zoom.pixel_to_ns(px as f64), period).max(period)
}

/// Captures still frames of a video source into its thumbnail store, visible
/// positions first.
pub struct ThumbnailJob {
    uri: String,
    digest: ContentDigest,
    proxy: Option<ContentDigest>,
    timing: ClipTiming,
    state: ThumbnailState,
    pipeline: Option<Box<dyn Pipeline>>,
    generation: u32,
    cache: Option<SharedThumbnailCache>,
    thumb_width: Option<u32>,
    /// Visible offsets not cached yet.
    wishlist: VecDeque<ClockTime>,
    /// Every offset still to capture, in temporal order.
    queue: VecDeque<ClockTime>,
    /// Offsets a seek was issued for; incoming frames snap to these.
    requested: BTreeSet<ClockTime>,
    slots: BTreeMap<ClockTime, ThumbnailSlot>,
    applied_view: Option<(Rect, Zoom)>,
    pending_view: Option<(Rect, Zoom)>,
    interval: Option<IntervalController>,
    capture_timer: Option<TimerId>,
    autosave_timer: Option<TimerId>,
    autosave_every: Duration,
    total: usize,
    captured: usize,
    opacity: f32,
    needs_redraw: bool,
}

impl ThumbnailJob {
    pub fn new(uri: impl Into<String>, digest: ContentDigest, timing: ClipTiming) -> Self {
        Self {
            uri: uri.into(),
            digest,
            proxy: None,
            timing,
            state: ThumbnailState::Idle,
            pipeline: None,
            generation: 0,
            cache: None,
            thumb_width: None,
            wishlist: VecDeque::new(),
            queue: VecDeque::new(),
            requested: BTreeSet::new(),
            slots: BTreeMap::new(),
            applied_view: None,
            pending_view: None,
            interval: None,
            capture_timer: None,
            autosave_timer: None,
            autosave_every: Duration::ZERO,
            total: 0,
            captured: 0,
            opacity: 1.0,
            needs_redraw: false,
        }
    }

    /// Thumbnails are shared with `proxy` once generation completes.
    pub fn with_proxy(mut self, proxy: ContentDigest) -> Self {
        self.proxy = Some(proxy);
        self
    }

    pub fn state(&self) -> ThumbnailState { self.state }

    pub fn digest(&self) -> &ContentDigest { &self.digest }

    pub fn thumb_width(&self) -> Option<u32> { self.thumb_width }

    pub fn wishlist(&self) -> Vec<ClockTime> { self.wishlist.iter().copied().collect() }

    pub fn queue(&self) -> Vec<ClockTime> { self.queue.iter().copied().collect() }

    pub fn visible_thumbnails(&self) -> Vec<ThumbnailSlot> { self.slots.values().copied().collect() }

    pub fn opacity(&self) -> f32 { self.opacity }

    pub fn interval(&self) -> Option<Duration> { self.interval.as_ref().map(IntervalController::interval) }

    /// Whether something changed since the last call.
    pub fn take_redraw(&mut self) -> bool { std::mem::take(&mut self.needs_redraw) }

    fn ensure_cache(&mut self, ctx: &mut JobContext<'_>) -> Option<SharedThumbnailCache> {
        if self.cache.is_none() {
            match ctx.caches().thumbnails(&self.digest) {
                Ok(cache) => {
                    if self.thumb_width.is_none() {
                        match cache.borrow().image_dimensions() {
                            Ok(dims) => self.thumb_width = dims.map(|(width, _)| width),
                            Err(e) => warn!(digest = self.digest.short(), error = %e, "unreadable cached thumbnail"),
                        }
                    }
                    self.cache = Some(cache);
                }
                Err(e) => warn!(digest = self.digest.short(), error = %e, "cannot open thumbnail cache"),
            }
        }
        self.cache.clone()
    }

    fn is_cached(&self, time: ClockTime) -> bool {
        let Some(cache) = &self.cache else { return false };
        let cached = cache.borrow().contains(time);
        cached.unwrap_or_else(|e| {
            warn!(time, error = %e, "thumbnail lookup failed");
            false
        })
    }

    fn layout(&mut self, rect: Rect, zoom: Zoom, ctx: &mut JobContext<'_>) -> bool {
        if self.applied_view == Some((rect, zoom)) {
            return true;
        }
        self.ensure_cache(ctx);
        let Some(width) = self.thumb_width else {
            self.pending_view = Some((rect, zoom));
            return false;
        };
        let settings = ctx.settings();
        let period = settings.thumbnail_period_ns;
        let height = settings.thumbnail_height;
        let step = thumb_duration(zoom, width + settings.thumbnail_margin_px, period);

        let in_point = self.timing.in_point;
        let left = zoom.pixel_to_ns(rect.x) + in_point;
        let right = left + zoom.pixel_to_ns(rect.width);
        let y = ((rect.height - height as f64) / 2.0).max(0.0);

        self.slots.clear();
        self.wishlist.clear();
        for time in buckets(quantize(left, step), right, step) {
            let cached = self.is_cached(time);
            let x = zoom.ns_to_pixel(time) - zoom.ns_to_pixel(in_point);
            self.slots.insert(time, ThumbnailSlot { time, x, y, cached });
            if !cached {
                self.wishlist.push_back(time);
            }
        }
        trace!(slots = self.slots.len(), missing = self.wishlist.len(), "thumbnails laid out");
        self.applied_view = Some((rect, zoom));
        self.pending_view = None;
        self.needs_redraw = true;
        true
    }

    fn begin_capture(&mut self, ctx: &mut JobContext<'_>) {
        if self.state != ThumbnailState::AwaitingIdleSlot {
            return;
        }
        let Some(pipeline) = self.pipeline.as_ref() else { return };
        let period = ctx.settings().thumbnail_period_ns;
        let duration = pipeline.query_duration().filter(|d| *d > 0).unwrap_or_else(|| {
            debug!("pipeline did not report a duration, using the clip's");
            self.timing.duration
        });
        let pending: VecDeque<ClockTime> = buckets(0, duration, period).filter(|t| !self.is_cached(*t)).collect();
        self.queue = pending;
        self.total = self.queue.len();
        self.captured = 0;
        self.state = ThumbnailState::Generating;
        debug!(source = %self.uri, offsets = self.total, "starting thumbnail capture");

        let settings = ctx.settings();
        let (target, initial) = (settings.thumbnail_cpu_target, settings.initial_interval());
        self.interval = Some(IntervalController::new(ctx.cpu_sampler(), target, initial));
        self.autosave_every = ctx.settings().autosave_delay();
        self.autosave_timer = Some(ctx.schedule(self.autosave_every, JobTimer::Autosave));
        self.check_cpu(ctx);
    }

    fn check_cpu(&mut self, ctx: &mut JobContext<'_>) {
        let Some(interval) = self.interval.as_mut() else { return };
        let next = interval.cycle();
        if let Some(timer) = self.capture_timer.take() {
            ctx.cancel(timer);
        }
        self.capture_timer = Some(ctx.schedule(next, JobTimer::NextCapture));
    }

    /// Next wished offset that is still pending; wishes already captured are dropped.
    fn take_wish(&mut self) -> Option<ClockTime> {
        while let Some(wish) = self.wishlist.pop_front() {
            if self.queue.contains(&wish) {
                return Some(wish);
            }
        }
        None
    }

    fn capture_next(&mut self, ctx: &mut JobContext<'_>) {
        self.capture_timer = None;
        if self.state != ThumbnailState::Generating {
            return;
        }
        if self.wishlist.is_empty() && self.queue.is_empty() {
            self.finish(ctx);
            return;
        }
        let time = match self.take_wish() {
            Some(wish) => {
                self.queue.retain(|t| *t != wish);
                wish
            }
            None => match self.queue.pop_front() {
                Some(time) => time,
                None => {
                    self.finish(ctx);
                    return;
                }
            },
        };
        // retried later if the frame never arrives
        self.queue.push_back(time);
        self.requested.insert(time);
        trace!(time, pending = self.queue.len(), wished = self.wishlist.len(), "requesting thumbnail");

        let Some(pipeline) = self.pipeline.as_mut() else { return };
        if let Err(e) = pipeline.seek(1.0, SeekFlags::FLUSH_ACCURATE, time) {
            warn!(time, error = %e, "thumbnail seek failed");
            self.check_cpu(ctx);
        }
    }

    fn on_frame(&mut self, time: ClockTime, frame: RgbaImage, ctx: &mut JobContext<'_>) {
        if self.state != ThumbnailState::Generating {
            trace!(time, "dropping frame outside of capture");
            return;
        }
        let Some(bucket) = nearest_bucket(&self.requested, time) else {
            trace!(time, "dropping unrequested frame");
            return;
        };
        let Some(cache) = self.cache.clone() else { return };
        if let Err(e) = cache.borrow_mut().write(bucket, &frame) {
            warn!(time = bucket, error = %e, "JPEG compression failed, skipping thumbnail");
            return;
        }
        self.requested.remove(&bucket);
        self.queue.retain(|t| *t != bucket);
        self.wishlist.retain(|t| *t != bucket);
        if let Some(slot) = self.slots.get_mut(&bucket) {
            slot.cached = true;
        }
        self.captured += 1;
        self.needs_redraw = true;
        let progress = (self.captured as f32 / self.total.max(1) as f32).min(1.0);
        ctx.emit(JobStatus::Progress(progress));
    }

    fn autosave(&mut self, ctx: &mut JobContext<'_>) {
        self.autosave_timer = None;
        if self.state != ThumbnailState::Generating || self.wishlist.is_empty() {
            return;
        }
        trace!("periodic thumbnail autosave");
        self.commit();
        self.autosave_timer = Some(ctx.schedule(self.autosave_every, JobTimer::Autosave));
    }

    fn commit(&self) {
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.borrow_mut().commit() {
                warn!(digest = self.digest.short(), error = %e, "failed to save thumbnails");
            }
        }
    }

    fn teardown(&mut self, ctx: &mut JobContext<'_>) {
        for timer in [self.capture_timer.take(), self.autosave_timer.take()].into_iter().flatten() {
            ctx.cancel(timer);
        }
        self.interval = None;
        self.requested.clear();
        if let Some(mut pipeline) = self.pipeline.take() {
            if let Err(e) = pipeline.set_state(PipelineState::Null) {
                warn!(error = %e, "could not shut the thumbnail pipeline down");
            }
        }
    }

    fn finish(&mut self, ctx: &mut JobContext<'_>) {
        self.teardown(ctx);
        self.commit();
        if let Some(proxy) = &self.proxy {
            if let Err(e) = ctx.caches().alias_thumbnails(&self.digest, proxy) {
                warn!(proxy = proxy.short(), error = %e, "could not share thumbnails with proxy");
            }
        }
        self.state = ThumbnailState::Done;
        info!(source = %self.uri, captured = self.captured, "thumbnails complete");
        ctx.emit(JobStatus::Done);
    }

    fn fail(&mut self, reason: String, ctx: &mut JobContext<'_>) {
        error!(source = %self.uri, %reason, "thumbnail generation failed");
        self.teardown(ctx);
        self.commit();
        self.state = ThumbnailState::Error;
        ctx.emit(JobStatus::Failed(reason));
    }
}

impl GenerationJob for ThumbnailJob {
    fn category(&self) -> MediaCategory { MediaCategory::Image }

    fn source(&self) -> &str { &self.uri }

    fn start(&mut self, ctx: &mut JobContext<'_>) {
        self.ensure_cache(ctx);
        self.generation += 1;
        self.queue.clear();
        self.requested.clear();
        let settings = ctx.settings();
        let description = PipelineDescription::Thumbnails {
            uri: self.uri.clone(),
            height: settings.thumbnail_height,
            framerate: settings.thumbnail_framerate,
        };
        let (timeout, fallback) = (settings.preroll_timeout(), settings.fallback_thumb_width());

        let mut pipeline = match ctx.configure(&description, self.generation) {
            Ok(pipeline) => pipeline,
            Err(e) => return self.fail(e.to_string(), ctx),
        };
        self.state = ThumbnailState::PipelineConfigured;
        ctx.emit(JobStatus::Running);

        let prerolled = pipeline.set_state(PipelineState::Paused).and_then(|_| pipeline.preroll(timeout));
        self.thumb_width = match prerolled {
            Ok(Preroll { width: Some(width) }) => Some(width),
            Ok(Preroll { width: None }) => Some(self.thumb_width.unwrap_or(fallback)),
            Err(e) => {
                warn!(source = %self.uri, error = %e, "couldn't preroll the pipeline, assuming 16:9");
                Some(fallback)
            }
        };
        self.pipeline = Some(pipeline);
        self.state = ThumbnailState::AwaitingIdleSlot;
        debug!(source = %self.uri, width = ?self.thumb_width, "waiting for the loop to become idle");
        ctx.when_idle(JobTimer::StartCapture);

        if let Some((rect, zoom)) = self.pending_view.take() {
            self.layout(rect, zoom, ctx);
        }
    }

    fn stop(&mut self, ctx: &mut JobContext<'_>) {
        let active = matches!(
            self.state,
            ThumbnailState::PipelineConfigured | ThumbnailState::AwaitingIdleSlot | ThumbnailState::Generating
        );
        self.teardown(ctx);
        if active {
            self.commit();
            self.state = ThumbnailState::Idle;
            ctx.emit(JobStatus::Canceled);
        }
    }

    fn is_finished(&self) -> bool { matches!(self.state, ThumbnailState::Done | ThumbnailState::Error) }

    fn on_pipeline_event(&mut self, generation: u32, event: PipelineEvent, ctx: &mut JobContext<'_>) {
        if generation != self.generation || self.pipeline.is_none() {
            trace!(generation, "dropping event of a previous pipeline");
            return;
        }
        match event {
            PipelineEvent::SampleReady { time, payload: Some(SamplePayload::Image(frame)) } => {
                self.on_frame(time, frame, ctx)
            }
            PipelineEvent::SampleReady { time, .. } => trace!(time, "sample without a frame"),
            PipelineEvent::AsyncDone => {
                if self.state == ThumbnailState::Generating {
                    self.check_cpu(ctx);
                }
            }
            PipelineEvent::Error(reason) => self.fail(reason, ctx),
            PipelineEvent::StateChanged { .. } | PipelineEvent::EndOfStream => {}
        }
    }

    fn on_timer(&mut self, timer: JobTimer, ctx: &mut JobContext<'_>) {
        match timer {
            JobTimer::StartCapture => self.begin_capture(ctx),
            JobTimer::NextCapture => self.capture_next(ctx),
            JobTimer::Autosave => self.autosave(ctx),
            JobTimer::Discover | JobTimer::RateCycle => {}
        }
    }

    fn visible_range_changed(&mut self, rect: Rect, zoom: Zoom, ctx: &mut JobContext<'_>) -> bool {
        self.layout(rect, zoom, ctx)
    }

    fn set_selected(&mut self, selected: bool) {
        self.opacity = if selected { 0.5 } else { 1.0 };
        self.needs_redraw = true;
    }

    fn as_any(&self) -> &dyn Any { self }

    fn as_any_mut(&mut self) -> &mut dyn Any { self }
}
