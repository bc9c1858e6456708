use serde::{Deserialize, Serialize};
use timeline::ClockTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Framerate {
    pub num: u32,
    pub den: u32,
}

impl Framerate {
    pub const fn new(num: u32, den: u32) -> Self { Self { num, den } }
}

/// What a preview pipeline has to produce. Backends translate this into
/// their own graph; [`PipelineDescription::launch_line`] gives the canonical
/// textual form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PipelineDescription {
    /// Decode video only, rate-convert to `framerate`, scale to `height` with
    /// square pixels and post one RGBA frame per seek.
    Thumbnails { uri: String, height: u32, framerate: Framerate },
    /// Decode audio only and post per-channel RMS levels every `interval`,
    /// synchronised to the clock so the playback rate throttles analysis.
    Levels { uri: String, interval: ClockTime },
}

impl PipelineDescription {
    pub fn uri(&self) -> &str {
        match self {
            PipelineDescription::Thumbnails { uri, .. } | PipelineDescription::Levels { uri, .. } => uri,
        }
    }

    pub fn launch_line(&self) -> String {
        match self {
            PipelineDescription::Thumbnails { uri, height, framerate } => {
                format!("uridecodebin uri={uri} name=decode ! {}", thumbnail_chain(*height, *framerate))
            }
            PipelineDescription::Levels { uri, interval } => format!(
                "uridecodebin uri={uri} name=decode ! {} ! fakesink name=faked qos=false sync=true",
                levels_chain(*interval)
            ),
        }
    }
}

/// A preview branch embedded in a pipeline owned by someone else, such as a
/// proxy transcoder. Media flows through it to the downstream elements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PreviewBranch {
    /// Frames for the thumbnail store. A `teed` branch splits the stream so
    /// the unscaled video keeps going downstream.
    Thumbnails { height: u32, framerate: Framerate, teed: bool },
    /// Per-channel RMS levels every `interval`.
    Levels { interval: ClockTime },
}

impl PreviewBranch {
    pub fn launch_line(&self) -> String {
        match self {
            PreviewBranch::Thumbnails { height, framerate, teed: false } => thumbnail_chain(*height, *framerate),
            PreviewBranch::Thumbnails { height, framerate, teed: true } => format!(
                "tee name=t ! queue max-size-buffers=0 max-size-bytes=0 max-size-time=0 ! {} t. ! queue",
                thumbnail_chain(*height, *framerate)
            ),
            PreviewBranch::Levels { interval } => levels_chain(*interval),
        }
    }
}

fn thumbnail_chain(height: u32, framerate: Framerate) -> String {
    format!(
        "videoconvert ! videorate ! videoscale method=lanczos ! \
         video/x-raw,format=RGBA,height={height},pixel-aspect-ratio=1/1,framerate={}/{} ! \
         appsink name=thumbsink",
        framerate.num, framerate.den
    )
}

fn levels_chain(interval: ClockTime) -> String {
    format!("audioconvert ! audioresample ! level name=level interval={interval} ! audioconvert ! audioresample")
}
