//! Interfaces to the media pipeline framework used to compute previews.
//!
//! Decoding, scaling and leveling happen behind [`Pipeline`]; this crate only
//! describes what a preview pipeline must do and the events it reports back.

mod cpu;
mod description;
mod pipeline;
mod uri;

use thiserror::Error;

pub use cpu::{CpuSampler, CpuSamplerFactory, SystemCpuSampler};
pub use description::{Framerate, PipelineDescription, PreviewBranch};
pub use pipeline::{
    EventSink, Pipeline, PipelineEvent, PipelineFactory, PipelineState, PipelineTag, Preroll, SamplePayload,
    SeekFlags, TaggedEvent,
};
pub use uri::{filename_from_uri, location_from_uri, quote_uri};

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("could not configure pipeline `{description}`: {reason}")]
    Configure { description: String, reason: String },
    #[error("state change to {state:?} failed: {reason}")]
    StateChange { state: PipelineState, reason: String },
    #[error("seek failed: {0}")]
    Seek(String),
    #[error("pipeline did not preroll within {0:?}")]
    PrerollTimeout(std::time::Duration),
    #[error("not a local file uri: {0}")]
    NotLocal(String),
    #[error("cpu sampler unavailable: {0}")]
    CpuSampler(String),
}
