use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use crossbeam_channel::{unbounded, Receiver, Sender};
use media_io::{CpuSamplerFactory, PipelineFactory, TaggedEvent};
use preview_cache::PreviewCaches;
use timeline::{Rect, Zoom};
use tracing::{debug, info, trace};

use crate::job::{GenerationJob, JobContext};
use crate::scheduler::{Admission, JobScheduler};
use crate::settings::PreviewSettings;
use crate::timers::{JobTimer, TimerQueue};
use crate::{JobError, JobEvent, JobId, JobStatus};

/// UI side of the control loop: job status updates in the order they happened.
#[derive(Clone)]
pub struct JobsHandle {
    pub rx_events: Receiver<JobEvent>,
}

impl JobsHandle {
    /// Drains pending updates, calling `on_done` for finished or canceled jobs
    /// and `on_error` for failed ones. Returns how many updates were seen.
    pub fn poll(&self, mut on_done: impl FnMut(&JobEvent), mut on_error: impl FnMut(&JobEvent)) -> usize {
        let mut seen = 0;
        while let Ok(event) = self.rx_events.try_recv() {
            seen += 1;
            match event.status {
                JobStatus::Done | JobStatus::Canceled => on_done(&event),
                JobStatus::Failed(_) => on_error(&event),
                _ => {}
            }
        }
        seen
    }

    pub fn drain(&self) -> Vec<JobEvent> { self.rx_events.try_iter().collect() }
}

/// Single-threaded event loop owning every job, its scheduler slot and its timers.
///
/// Pipelines post into a channel, so they may do so from any thread; everything
/// else happens on the thread calling [`ControlLoop::turn`] or [`ControlLoop::run_until`].
pub struct ControlLoop {
    settings: PreviewSettings,
    caches: PreviewCaches,
    pipelines: Box<dyn PipelineFactory>,
    cpu: Box<dyn CpuSamplerFactory>,
    scheduler: JobScheduler,
    jobs: HashMap<JobId, Box<dyn GenerationJob>>,
    timers: TimerQueue,
    idle: VecDeque<(JobId, JobTimer)>,
    last_turn: Instant,
    tx_pipeline: Sender<TaggedEvent>,
    rx_pipeline: Receiver<TaggedEvent>,
    tx_events: Sender<JobEvent>,
    rx_events: Receiver<JobEvent>,
    tx_ui: Sender<JobEvent>,
}

impl ControlLoop {
    pub fn new(
        settings: PreviewSettings,
        caches: PreviewCaches,
        pipelines: Box<dyn PipelineFactory>,
        cpu: Box<dyn CpuSamplerFactory>,
    ) -> (Self, JobsHandle) {
        let (tx_pipeline, rx_pipeline) = unbounded::<TaggedEvent>();
        let (tx_events, rx_events) = unbounded::<JobEvent>();
        let (tx_ui, rx_ui) = unbounded::<JobEvent>();
        let runtime = ControlLoop {
            settings,
            caches,
            pipelines,
            cpu,
            scheduler: JobScheduler::new(),
            jobs: HashMap::new(),
            timers: TimerQueue::default(),
            idle: VecDeque::new(),
            last_turn: Instant::now(),
            tx_pipeline,
            rx_pipeline,
            tx_events,
            rx_events,
            tx_ui,
        };
        (runtime, JobsHandle { rx_events: rx_ui })
    }

    /// A loop whose caches live where `settings` says.
    pub fn with_settings(
        settings: PreviewSettings,
        pipelines: Box<dyn PipelineFactory>,
        cpu: Box<dyn CpuSamplerFactory>,
    ) -> Result<(Self, JobsHandle), JobError> {
        settings.validate()?;
        let caches = PreviewCaches::new(settings.cache_dirs()?, settings.jpeg_quality)?;
        Ok(Self::new(settings, caches, pipelines, cpu))
    }

    pub fn settings(&self) -> &PreviewSettings { &self.settings }

    pub fn caches(&self) -> &PreviewCaches { &self.caches }

    pub fn caches_mut(&mut self) -> &mut PreviewCaches { &mut self.caches }

    pub fn scheduler(&self) -> &JobScheduler { &self.scheduler }

    /// Timers armed by jobs that have not fired or been canceled yet.
    pub fn pending_timers(&self) -> usize { self.timers.len() }

    /// Takes ownership of `job` without scheduling it.
    pub fn add_job<J: GenerationJob>(&mut self, job: J) -> JobId {
        let id = JobId::new();
        debug!(job = %id, source = job.source(), category = ?job.category(), "job added");
        self.jobs.insert(id, Box::new(job));
        id
    }

    /// Asks the scheduler for a slot; starts the job right away when it got one.
    pub fn register(&mut self, id: JobId) -> Result<Admission, JobError> {
        let category = self.jobs.get(&id).ok_or(JobError::UnknownJob(id))?.category();
        let admission = self.scheduler.register(id, category);
        match admission {
            Admission::Started => self.start(id),
            Admission::Queued { .. } => self.notify_pending(id),
            Admission::AlreadyRegistered => {}
        }
        Ok(admission)
    }

    pub fn register_job<J: GenerationJob>(&mut self, job: J) -> (JobId, Admission) {
        let id = self.add_job(job);
        let admission = self.register(id).unwrap_or(Admission::AlreadyRegistered);
        (id, admission)
    }

    /// Stops and forgets `id`, promoting the next job of its category if it
    /// held the slot.
    pub fn stop_job(&mut self, id: JobId) -> Result<(), JobError> {
        let category = self.jobs.get(&id).ok_or(JobError::UnknownJob(id))?.category();
        let now = self.now();
        self.dispatch(id, now, |job, ctx| job.stop(ctx));
        self.forget_timers(id);
        self.jobs.remove(&id);
        if let Some(next) = self.scheduler.withdraw(id, category) {
            self.start(next);
        }
        info!(job = %id, "job removed");
        Ok(())
    }

    pub fn visible_range_changed(&mut self, id: JobId, rect: Rect, zoom: Zoom) -> Result<bool, JobError> {
        let now = self.now();
        self.dispatch(id, now, |job, ctx| job.visible_range_changed(rect, zoom, ctx)).ok_or(JobError::UnknownJob(id))
    }

    pub fn set_selected(&mut self, id: JobId, selected: bool) -> Result<(), JobError> {
        self.jobs.get_mut(&id).ok_or(JobError::UnknownJob(id))?.set_selected(selected);
        Ok(())
    }

    pub fn job<J: GenerationJob>(&self, id: JobId) -> Option<&J> { self.jobs.get(&id)?.as_any().downcast_ref::<J>() }

    pub fn job_mut<J: GenerationJob>(&mut self, id: JobId) -> Option<&mut J> {
        self.jobs.get_mut(&id)?.as_any_mut().downcast_mut::<J>()
    }

    pub fn len(&self) -> usize { self.jobs.len() }

    pub fn is_empty(&self) -> bool { self.jobs.is_empty() }

    /// One pass over pending work: pipeline events, job status updates, then
    /// due timers. Idle work only runs when none of those produced anything.
    /// Returns whether anything was handled.
    pub fn turn(&mut self, now: Instant) -> bool {
        self.last_turn = self.last_turn.max(now);
        let mut busy = false;
        while let Ok(tagged) = self.rx_pipeline.try_recv() {
            busy = true;
            self.on_pipeline_event(tagged, now);
        }
        while let Ok(event) = self.rx_events.try_recv() {
            busy = true;
            self.on_job_event(event);
        }
        while let Some((id, timer)) = self.timers.pop_due(now) {
            busy = true;
            self.dispatch(id, now, |job, ctx| job.on_timer(timer, ctx));
        }
        if !busy {
            if let Some((id, timer)) = self.idle.pop_front() {
                busy = true;
                trace!(job = %id, ?timer, "idle callback");
                self.dispatch(id, now, |job, ctx| job.on_timer(timer, ctx));
            }
        }
        busy
    }

    /// Turns until nothing is left to do at `now`.
    pub fn run_until_idle(&mut self, now: Instant) -> usize {
        let mut turns = 0;
        while self.turn(now) {
            turns += 1;
        }
        turns
    }

    /// Runs on the wall clock until `deadline`, sleeping between timers.
    pub fn run_until(&mut self, deadline: Instant) {
        let rx_pipeline = self.rx_pipeline.clone();
        let rx_events = self.rx_events.clone();
        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            if self.turn(now) {
                continue;
            }
            let wake = self.timers.next_deadline().map_or(deadline, |at| at.min(deadline));
            crossbeam_channel::select! {
                recv(rx_pipeline) -> msg => {
                    if let Ok(tagged) = msg { self.on_pipeline_event(tagged, Instant::now()); }
                }
                recv(rx_events) -> msg => {
                    if let Ok(event) = msg { self.on_job_event(event); }
                }
                default(wake.saturating_duration_since(now)) => {}
            }
        }
    }

    /// Stops every job and flushes the thumbnail stores.
    pub fn shutdown(&mut self) {
        let ids: Vec<JobId> = self.jobs.keys().copied().collect();
        for id in ids {
            let _ = self.stop_job(id);
        }
        self.caches.commit_all();
    }

    fn now(&self) -> Instant { self.last_turn.max(Instant::now()) }

    fn notify_pending(&self, id: JobId) {
        if let Some(job) = self.jobs.get(&id) {
            let event = JobEvent { id, source: job.source().to_string(), category: job.category(), status: JobStatus::Pending };
            let _ = self.tx_ui.send(event);
        }
    }

    fn start(&mut self, id: JobId) {
        let now = self.now();
        self.dispatch(id, now, |job, ctx| job.start(ctx));
    }

    fn forget_timers(&mut self, id: JobId) {
        self.timers.cancel_job(id);
        self.idle.retain(|(owner, _)| *owner != id);
    }

    fn on_pipeline_event(&mut self, tagged: TaggedEvent, now: Instant) {
        let id = JobId(tagged.tag.owner);
        let generation = tagged.tag.generation;
        let event = tagged.event;
        if self.dispatch(id, now, |job, ctx| job.on_pipeline_event(generation, event, ctx)).is_none() {
            trace!(job = %id, "dropping event of a removed job");
        }
    }

    fn on_job_event(&mut self, event: JobEvent) {
        if event.status.is_terminal() {
            debug!(job = %event.id, status = ?event.status, "job finished");
            self.forget_timers(event.id);
            if let Some(next) = self.scheduler.complete(event.id, event.category) {
                self.start(next);
            }
        }
        let _ = self.tx_ui.send(event);
    }

    fn dispatch<R>(
        &mut self,
        id: JobId,
        now: Instant,
        f: impl FnOnce(&mut dyn GenerationJob, &mut JobContext<'_>) -> R,
    ) -> Option<R> {
        let mut job = self.jobs.remove(&id)?;
        let mut ctx = JobContext {
            id,
            category: job.category(),
            source: job.source().to_string(),
            now,
            settings: &self.settings,
            caches: &mut self.caches,
            pipelines: self.pipelines.as_ref(),
            cpu: self.cpu.as_ref(),
            timers: &mut self.timers,
            idle: &mut self.idle,
            pipeline_tx: &self.tx_pipeline,
            events: &self.tx_events,
        };
        let result = f(job.as_mut(), &mut ctx);
        self.jobs.insert(id, job);
        Some(result)
    }
}
