//! Persistent, content-addressed storage for timeline previews.
//!
//! Thumbnails are kept incrementally in one SQLite file per source, keyed by
//! time offset. Waveforms are written once per source as a flat array. Both
//! are named by the content digest of the source file, so they survive
//! renames and can be shared with proxy assets through filesystem links.

mod digest;
mod link;
mod paths;
mod registry;
mod thumbnails;
mod waveforms;

use thiserror::Error;
use timeline::ClockTime;

pub use digest::{hash_file, ContentDigest};
pub use link::link_file;
pub use paths::{app_data_dir, CacheDirs};
pub use registry::{PreviewCaches, SharedThumbnailCache};
pub use thumbnails::{ThumbnailCache, DEFAULT_JPEG_QUALITY};
pub use waveforms::WaveformStore;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("no cached entry at {0}ns")]
    NotFound(ClockTime),
    #[error("no per-user cache directory on this platform")]
    NoCacheDir,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Image(#[from] image::ImageError),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CacheError>;
