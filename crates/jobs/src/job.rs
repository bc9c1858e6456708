use std::any::Any;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use media_io::{
    CpuSampler, CpuSamplerFactory, EventSink, MediaError, Pipeline, PipelineDescription, PipelineEvent, PipelineFactory,
    PipelineTag, TaggedEvent,
};
use preview_cache::PreviewCaches;
use timeline::{Rect, Zoom};
use tracing::trace;

use crate::settings::PreviewSettings;
use crate::timers::{JobTimer, TimerId, TimerQueue};
use crate::{JobEvent, JobId, JobStatus, MediaCategory};

/// A preview generation job driven by the control loop.
///
/// All callbacks run on the loop; none may block. A job reports that it gave
/// up its scheduling slot by emitting a terminal [`JobStatus`] through the context.
pub trait GenerationJob: Any {
    fn category(&self) -> MediaCategory;

    /// URI of the media the job previews.
    fn source(&self) -> &str;

    /// Called when the scheduler makes the job current.
    fn start(&mut self, ctx: &mut JobContext<'_>);

    /// Releases the pipeline. A running job emits [`JobStatus::Canceled`].
    fn stop(&mut self, ctx: &mut JobContext<'_>);

    fn is_finished(&self) -> bool;

    /// An event posted by the pipeline created for `generation`.
    fn on_pipeline_event(&mut self, generation: u32, event: PipelineEvent, ctx: &mut JobContext<'_>);

    fn on_timer(&mut self, timer: JobTimer, ctx: &mut JobContext<'_>);

    /// The visible part of the clip changed. Returns whether the job could
    /// lay out previews for it.
    fn visible_range_changed(&mut self, _rect: Rect, _zoom: Zoom, _ctx: &mut JobContext<'_>) -> bool { false }

    fn set_selected(&mut self, _selected: bool) {}

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// What a job may touch while handling a callback.
pub struct JobContext<'a> {
    pub(crate) id: JobId,
    pub(crate) category: MediaCategory,
    pub(crate) source: String,
    pub(crate) now: Instant,
    pub(crate) settings: &'a PreviewSettings,
    pub(crate) caches: &'a mut PreviewCaches,
    pub(crate) pipelines: &'a dyn PipelineFactory,
    pub(crate) cpu: &'a dyn CpuSamplerFactory,
    pub(crate) timers: &'a mut TimerQueue,
    pub(crate) idle: &'a mut VecDeque<(JobId, JobTimer)>,
    pub(crate) pipeline_tx: &'a Sender<TaggedEvent>,
    pub(crate) events: &'a Sender<JobEvent>,
}

impl<'a> JobContext<'a> {
    pub fn id(&self) -> JobId { self.id }

    pub fn now(&self) -> Instant { self.now }

    pub fn settings(&self) -> &'a PreviewSettings { self.settings }

    pub fn caches(&mut self) -> &mut PreviewCaches { &mut *self.caches }

    pub fn schedule(&mut self, after: Duration, timer: JobTimer) -> TimerId {
        self.timers.schedule(self.now + after, self.id, timer)
    }

    pub fn cancel(&mut self, timer: TimerId) { self.timers.cancel(timer); }

    /// Runs `timer` once the loop has nothing else to do.
    pub fn when_idle(&mut self, timer: JobTimer) { self.idle.push_back((self.id, timer)); }

    pub fn event_sink(&self, generation: u32) -> EventSink {
        EventSink::new(PipelineTag { owner: self.id.as_uuid(), generation }, self.pipeline_tx.clone())
    }

    pub fn configure(&self, description: &PipelineDescription, generation: u32) -> Result<Box<dyn Pipeline>, MediaError> {
        self.pipelines.configure(description, self.event_sink(generation))
    }

    pub fn cpu_sampler(&self) -> Box<dyn CpuSampler> { self.cpu.sampler() }

    pub fn emit(&self, status: JobStatus) {
        trace!(job = %self.id, ?status, "job status");
        let event = JobEvent { id: self.id, source: self.source.clone(), category: self.category, status };
        let _ = self.events.send(event);
    }
}
