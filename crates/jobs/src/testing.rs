//! In-memory pipeline and CPU doubles shared by the unit tests.

use std::any::Any;
use std::cell::{Cell, RefCell, RefMut};
use std::collections::VecDeque;
use std::path::Path;
use std::rc::Rc;
use std::time::Duration;

use image::{Rgba, RgbaImage};
use media_io::{
    CpuSampler, CpuSamplerFactory, EventSink, MediaError, Pipeline, PipelineDescription, PipelineEvent, PipelineFactory,
    PipelineState, Preroll, SeekFlags,
};
use preview_cache::{CacheDirs, PreviewCaches, DEFAULT_JPEG_QUALITY};
use timeline::ClockTime;

use crate::{ControlLoop, GenerationJob, JobContext, JobStatus, JobTimer, JobsHandle, MediaCategory, PreviewSettings};

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    SetState(PipelineState),
    Preroll,
    Seek { rate: f64, position: ClockTime },
    Diagnostics(String),
}

#[derive(Default)]
pub struct FakeState {
    pub configured: Vec<(PipelineDescription, Option<EventSink>)>,
    pub calls: Vec<Call>,
    pub position: Option<ClockTime>,
    pub duration: Option<ClockTime>,
    pub preroll_width: Option<u32>,
    pub fail_preroll: bool,
    pub fail_seeks: bool,
    pub configure_failures: usize,
}

/// Records everything the code under test asks of its pipelines.
#[derive(Clone, Default)]
pub struct FakeFactory(Rc<RefCell<FakeState>>);

impl FakeFactory {
    pub fn state(&self) -> RefMut<'_, FakeState> { self.0.borrow_mut() }

    /// A pipeline that is not connected to any loop.
    pub fn pipeline(&self) -> Box<dyn Pipeline> { Box::new(FakePipeline(self.0.clone())) }

    pub fn calls(&self) -> Vec<Call> { self.0.borrow().calls.clone() }

    pub fn clear_calls(&self) { self.0.borrow_mut().calls.clear(); }

    pub fn seeks(&self) -> Vec<(f64, ClockTime)> {
        self.0
            .borrow()
            .calls
            .iter()
            .filter_map(|call| match call {
                Call::Seek { rate, position } => Some((*rate, *position)),
                _ => None,
            })
            .collect()
    }

    pub fn configured(&self) -> Vec<PipelineDescription> {
        self.0.borrow().configured.iter().map(|(description, _)| description.clone()).collect()
    }

    /// Posts `event` as the most recently configured pipeline.
    pub fn post(&self, event: PipelineEvent) {
        let sink = self.0.borrow().configured.last().and_then(|(_, sink)| sink.clone());
        let sink = sink.expect("no pipeline configured");
        assert!(sink.post(event));
    }

    pub fn post_to(&self, index: usize, event: PipelineEvent) {
        let sink = self.0.borrow().configured[index].1.clone().expect("pipeline without sink");
        assert!(sink.post(event));
    }
}

impl PipelineFactory for FakeFactory {
    fn configure(&self, description: &PipelineDescription, sink: EventSink) -> Result<Box<dyn Pipeline>, MediaError> {
        let mut state = self.0.borrow_mut();
        if state.configure_failures > 0 {
            state.configure_failures -= 1;
            return Err(MediaError::Configure { description: description.launch_line(), reason: "no such element".into() });
        }
        state.configured.push((description.clone(), Some(sink)));
        Ok(Box::new(FakePipeline(self.0.clone())))
    }
}

struct FakePipeline(Rc<RefCell<FakeState>>);

impl Pipeline for FakePipeline {
    fn set_state(&mut self, state: PipelineState) -> Result<(), MediaError> {
        self.0.borrow_mut().calls.push(Call::SetState(state));
        Ok(())
    }

    fn preroll(&mut self, timeout: Duration) -> Result<Preroll, MediaError> {
        let mut state = self.0.borrow_mut();
        state.calls.push(Call::Preroll);
        if state.fail_preroll {
            return Err(MediaError::PrerollTimeout(timeout));
        }
        Ok(Preroll { width: state.preroll_width })
    }

    fn seek(&mut self, rate: f64, _flags: SeekFlags, position: ClockTime) -> Result<(), MediaError> {
        let mut state = self.0.borrow_mut();
        state.calls.push(Call::Seek { rate, position });
        if state.fail_seeks {
            return Err(MediaError::Seek("not seekable".into()));
        }
        Ok(())
    }

    fn query_position(&self) -> Option<ClockTime> { self.0.borrow().position }

    fn query_duration(&self) -> Option<ClockTime> { self.0.borrow().duration }

    fn dump_diagnostics(&self, label: &str) { self.0.borrow_mut().calls.push(Call::Diagnostics(label.to_string())); }
}

/// Replays scripted CPU readings, then repeats a fallback value.
#[derive(Clone, Default)]
pub struct CpuScript {
    values: Rc<RefCell<VecDeque<f32>>>,
    fallback: Rc<Cell<f32>>,
}

impl CpuScript {
    pub fn new(values: &[f32]) -> Self {
        let script = Self::default();
        script.values.borrow_mut().extend(values);
        script
    }

    pub fn constant(value: f32) -> Self {
        let script = Self::default();
        script.set(value);
        script
    }

    pub fn set(&self, value: f32) { self.fallback.set(value); }

    pub fn sampler(&self) -> Box<dyn CpuSampler> { Box::new(self.clone()) }

    pub fn factory(&self) -> Box<dyn CpuSamplerFactory> {
        let script = self.clone();
        Box::new(move || script.sampler())
    }
}

impl CpuSampler for CpuScript {
    fn usage(&mut self) -> f32 { self.values.borrow_mut().pop_front().unwrap_or(self.fallback.get()) }

    fn reset(&mut self) {}
}

pub fn frame(width: u32, height: u32) -> RgbaImage { RgbaImage::from_pixel(width, height, Rgba([40, 90, 160, 255])) }

pub fn test_loop(root: &Path, factory: &FakeFactory, cpu: &CpuScript) -> (ControlLoop, JobsHandle) {
    let settings = PreviewSettings { cache_root: Some(root.to_path_buf()), ..PreviewSettings::default() };
    let caches = PreviewCaches::new(CacheDirs::under(root), DEFAULT_JPEG_QUALITY).unwrap();
    ControlLoop::new(settings, caches, Box::new(factory.clone()), cpu.factory())
}

/// A job that runs for a fixed time and logs its lifecycle.
pub struct StubJob {
    pub name: &'static str,
    pub category: MediaCategory,
    pub work: Duration,
    pub log: Rc<RefCell<Vec<String>>>,
    pub finished: bool,
}

impl StubJob {
    pub fn new(name: &'static str, category: MediaCategory, log: &Rc<RefCell<Vec<String>>>) -> Self {
        Self { name, category, work: Duration::from_secs(1), log: log.clone(), finished: false }
    }
}

impl GenerationJob for StubJob {
    fn category(&self) -> MediaCategory { self.category }

    fn source(&self) -> &str { self.name }

    fn start(&mut self, ctx: &mut JobContext<'_>) {
        self.log.borrow_mut().push(format!("start {}", self.name));
        ctx.emit(JobStatus::Running);
        ctx.schedule(self.work, JobTimer::NextCapture);
    }

    fn stop(&mut self, ctx: &mut JobContext<'_>) {
        self.log.borrow_mut().push(format!("stop {}", self.name));
        if !self.finished {
            ctx.emit(JobStatus::Canceled);
        }
    }

    fn is_finished(&self) -> bool { self.finished }

    fn on_pipeline_event(&mut self, _generation: u32, _event: PipelineEvent, _ctx: &mut JobContext<'_>) {}

    fn on_timer(&mut self, _timer: JobTimer, ctx: &mut JobContext<'_>) {
        self.finished = true;
        self.log.borrow_mut().push(format!("done {}", self.name));
        ctx.emit(JobStatus::Done);
    }

    fn as_any(&self) -> &dyn Any { self }

    fn as_any_mut(&mut self) -> &mut dyn Any { self }
}
