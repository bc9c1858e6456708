use std::time::Duration;

use crossbeam_channel::Sender;
use image::RgbaImage;
use serde::{Deserialize, Serialize};
use timeline::ClockTime;
use uuid::Uuid;

use crate::{MediaError, PipelineDescription};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PipelineState {
    Null,
    Ready,
    Paused,
    Playing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SeekFlags {
    pub flush: bool,
    pub accurate: bool,
}

impl SeekFlags {
    pub const FLUSH_ACCURATE: SeekFlags = SeekFlags { flush: true, accurate: true };
}

/// Structured data attached to a sample event.
#[derive(Debug, Clone)]
pub enum SamplePayload {
    /// A decoded, scaled frame.
    Image(RgbaImage),
    /// Per-channel RMS level in dB. Values >= 0 or NaN mean "no reading".
    Levels(Vec<f64>),
}

#[derive(Debug, Clone)]
pub enum PipelineEvent {
    /// `payload` is `None` when the pipeline posted a sample without a usable structure.
    SampleReady { time: ClockTime, payload: Option<SamplePayload> },
    StateChanged { prev: PipelineState, new: PipelineState },
    /// A flushing seek finished and the pipeline prerolled at the new position.
    AsyncDone,
    EndOfStream,
    Error(String),
}

/// Identifies which pipeline instance of which owner posted an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipelineTag {
    pub owner: Uuid,
    pub generation: u32,
}

#[derive(Debug, Clone)]
pub struct TaggedEvent {
    pub tag: PipelineTag,
    pub event: PipelineEvent,
}

/// Where a pipeline posts its bus messages. Cloneable and `Send`, so the
/// pipeline may post from its own streaming threads.
#[derive(Debug, Clone)]
pub struct EventSink {
    tag: PipelineTag,
    tx: Sender<TaggedEvent>,
}

impl EventSink {
    pub fn new(tag: PipelineTag, tx: Sender<TaggedEvent>) -> Self { Self { tag, tx } }

    pub fn tag(&self) -> PipelineTag { self.tag }

    /// Returns false once the receiving loop is gone.
    pub fn post(&self, event: PipelineEvent) -> bool {
        self.tx.send(TaggedEvent { tag: self.tag, event }).is_ok()
    }
}

/// Outcome of the bounded preroll handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Preroll {
    /// Width negotiated at the sink, when the pipeline produces frames.
    pub width: Option<u32>,
}

/// A configured media pipeline.
pub trait Pipeline {
    fn set_state(&mut self, state: PipelineState) -> Result<(), MediaError>;

    /// Blocks until the pipeline reached `Paused`, at most `timeout`.
    fn preroll(&mut self, timeout: Duration) -> Result<Preroll, MediaError>;

    fn seek(&mut self, rate: f64, flags: SeekFlags, position: ClockTime) -> Result<(), MediaError>;

    fn query_position(&self) -> Option<ClockTime>;

    fn query_duration(&self) -> Option<ClockTime>;

    /// Writes whatever the framework can dump about its current graph, for post-mortem inspection.
    fn dump_diagnostics(&self, _label: &str) {}
}

pub trait PipelineFactory {
    fn configure(&self, description: &PipelineDescription, sink: EventSink) -> Result<Box<dyn Pipeline>, MediaError>;
}
