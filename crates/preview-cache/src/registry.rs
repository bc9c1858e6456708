use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use tracing::{debug, warn};

use crate::{CacheDirs, ContentDigest, Result, ThumbnailCache, WaveformStore};

/// Thumbnail store shared by every job that references the same source.
pub type SharedThumbnailCache = Rc<RefCell<ThumbnailCache>>;

/// Process-lifetime registry of preview stores, keyed by content digest.
///
/// Stores are opened lazily and kept until the registry is dropped; there is
/// no eviction.
pub struct PreviewCaches {
    dirs: CacheDirs,
    quality: u8,
    thumbnails: HashMap<ContentDigest, SharedThumbnailCache>,
    waveforms: WaveformStore,
}

impl PreviewCaches {
    pub fn new(dirs: CacheDirs, jpeg_quality: u8) -> Result<Self> {
        dirs.ensure()?;
        let waveforms = WaveformStore::new(dirs.waves.clone());
        Ok(Self { dirs, quality: jpeg_quality, thumbnails: HashMap::new(), waveforms })
    }

    pub fn dirs(&self) -> &CacheDirs { &self.dirs }

    /// Returns the thumbnail store for `digest`, opening it on first use.
    pub fn thumbnails(&mut self, digest: &ContentDigest) -> Result<SharedThumbnailCache> {
        if let Some(cache) = self.thumbnails.get(digest) {
            return Ok(cache.clone());
        }
        let cache = Rc::new(RefCell::new(ThumbnailCache::open(&self.dirs.thumbs, digest, self.quality)?));
        self.thumbnails.insert(digest.clone(), cache.clone());
        Ok(cache)
    }

    /// Registers the thumbnails of `original` under `alias` too, on disk and in this registry.
    pub fn alias_thumbnails(&mut self, original: &ContentDigest, alias: &ContentDigest) -> Result<()> {
        let cache = self.thumbnails(original)?;
        cache.borrow_mut().copy_alias(alias)?;
        self.thumbnails.insert(alias.clone(), cache);
        debug!(original = original.short(), alias = alias.short(), "aliased thumbnail cache");
        Ok(())
    }

    pub fn waveforms(&self) -> &WaveformStore { &self.waveforms }

    /// Shares whatever previews exist for `original` with its proxy.
    pub fn alias_proxy(&mut self, original: &ContentDigest, proxy: &ContentDigest) -> Result<()> {
        if self.thumbnails.contains_key(original) || self.dirs.thumbs.join(original.as_str()).exists() {
            self.alias_thumbnails(original, proxy)?;
        }
        if self.waveforms.exists(original) {
            self.waveforms.alias(proxy, original)?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize { self.thumbnails.len() }

    pub fn is_empty(&self) -> bool { self.thumbnails.is_empty() }

    /// Flushes every open thumbnail store. Failures are logged and skipped.
    pub fn commit_all(&self) {
        for (digest, cache) in &self.thumbnails {
            if let Err(e) = cache.borrow_mut().commit() {
                warn!(digest = digest.short(), error = %e, "failed to commit thumbnail cache");
            }
        }
    }
}
