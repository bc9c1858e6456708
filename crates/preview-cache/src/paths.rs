use std::fs;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::{CacheError, Result};

const APP_DIR: &str = "previewers";

pub fn app_data_dir() -> PathBuf {
    let base = dirs::data_local_dir().unwrap_or_else(|| std::env::temp_dir());
    base.join(APP_DIR)
}

/// Directories holding the two kinds of preview files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheDirs {
    pub thumbs: PathBuf,
    pub waves: PathBuf,
}

impl CacheDirs {
    /// `<cache_dir>/previewers/{thumbs,waves}`.
    pub fn user_default() -> Result<Self> {
        let base = dirs::cache_dir().ok_or(CacheError::NoCacheDir)?;
        Ok(Self::under(base.join(APP_DIR)))
    }

    pub fn under(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self { thumbs: root.join("thumbs"), waves: root.join("waves") }
    }

    pub fn ensure(&self) -> Result<()> {
        for dir in [&self.thumbs, &self.waves] {
            if !dir.exists() {
                fs::create_dir_all(dir)?;
                info!(dir = %dir.display(), "created preview cache directory");
            }
        }
        Ok(())
    }
}
