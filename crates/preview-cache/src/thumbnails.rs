use std::fs;
use std::path::{Path, PathBuf};

use image::buffer::ConvertBuffer;
use image::codecs::jpeg::JpegEncoder;
use image::{ImageFormat, RgbImage, RgbaImage};
use rusqlite::{params, Connection, OptionalExtension};
use timeline::ClockTime;
use tracing::{debug, trace};

use crate::{link_file, CacheError, ContentDigest, Result};

pub const DEFAULT_JPEG_QUALITY: u8 = 90;

/// Thumbnails of one source file, keyed by time offset.
///
/// Writes are buffered in an open transaction until [`ThumbnailCache::commit`];
/// reads on the same store see them immediately.
pub struct ThumbnailCache {
    conn: Connection,
    path: PathBuf,
    digest: ContentDigest,
    quality: u8,
}

impl ThumbnailCache {
    pub fn open(dir: &Path, digest: &ContentDigest, quality: u8) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(digest.as_str());
        let conn = Connection::open(&path)?;
        conn.pragma_update(None, "synchronous", &"NORMAL")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS Thumbs (Time INTEGER NOT NULL PRIMARY KEY, Jpeg BLOB NOT NULL);",
        )?;
        debug!(digest = digest.short(), path = %path.display(), "opened thumbnail cache");
        Ok(Self { conn, path, digest: digest.clone(), quality })
    }

    pub fn path(&self) -> &Path { &self.path }

    pub fn digest(&self) -> &ContentDigest { &self.digest }

    pub fn contains(&self, time: ClockTime) -> Result<bool> {
        let found = self
            .conn
            .query_row("SELECT 1 FROM Thumbs WHERE Time = ?1", params![time as i64], |_| Ok(()))
            .optional()?;
        Ok(found.is_some())
    }

    pub fn read(&self, time: ClockTime) -> Result<RgbaImage> {
        let jpeg = self.read_jpeg(time)?;
        Ok(image::load_from_memory_with_format(&jpeg, ImageFormat::Jpeg)?.to_rgba8())
    }

    /// The stored blob, undecoded.
    pub fn read_jpeg(&self, time: ClockTime) -> Result<Vec<u8>> {
        self.conn
            .query_row("SELECT Jpeg FROM Thumbs WHERE Time = ?1", params![time as i64], |row| row.get(0))
            .optional()?
            .ok_or(CacheError::NotFound(time))
    }

    /// Encodes `image` as JPEG and stores it at `time`, replacing any previous entry.
    pub fn write(&mut self, time: ClockTime, image: &RgbaImage) -> Result<()> {
        let jpeg = self.encode(image)?;
        self.write_jpeg(time, &jpeg)
    }

    pub fn write_jpeg(&mut self, time: ClockTime, jpeg: &[u8]) -> Result<()> {
        if self.conn.is_autocommit() {
            self.conn.execute_batch("BEGIN")?;
        }
        self.conn.execute(
            "INSERT OR REPLACE INTO Thumbs (Time, Jpeg) VALUES (?1, ?2)",
            params![time as i64, jpeg],
        )?;
        trace!(digest = self.digest.short(), time, bytes = jpeg.len(), "stored thumbnail");
        Ok(())
    }

    pub fn commit(&mut self) -> Result<()> {
        if !self.conn.is_autocommit() {
            self.conn.execute_batch("COMMIT")?;
            debug!(digest = self.digest.short(), "saved thumbnail cache to disk");
        }
        Ok(())
    }

    /// Whether writes are waiting for [`ThumbnailCache::commit`].
    pub fn has_pending_writes(&self) -> bool { !self.conn.is_autocommit() }

    pub fn len(&self) -> Result<usize> {
        let n: i64 = self.conn.query_row("SELECT COUNT(*) FROM Thumbs", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    pub fn is_empty(&self) -> Result<bool> { Ok(self.len()? == 0) }

    /// Stored offsets in temporal order.
    pub fn times(&self) -> Result<Vec<ClockTime>> {
        let mut stmt = self.conn.prepare("SELECT Time FROM Thumbs ORDER BY Time")?;
        let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;
        let mut out = Vec::new();
        for r in rows { out.push(r? as ClockTime); }
        Ok(out)
    }

    /// Size shared by every thumbnail of this source, `None` while empty.
    pub fn image_dimensions(&self) -> Result<Option<(u32, u32)>> {
        let jpeg: Option<Vec<u8>> = self
            .conn
            .query_row("SELECT Jpeg FROM Thumbs LIMIT 1", [], |row| row.get(0))
            .optional()?;
        match jpeg {
            Some(jpeg) => {
                let img = image::load_from_memory_with_format(&jpeg, ImageFormat::Jpeg)?;
                Ok(Some((img.width(), img.height())))
            }
            None => Ok(None),
        }
    }

    /// The entry in the middle of the stored range, used as a representative thumbnail.
    pub fn preview_entry(&self) -> Result<Option<(ClockTime, RgbaImage)>> {
        let times = self.times()?;
        if times.is_empty() { return Ok(None); }
        let time = times[times.len() / 2];
        Ok(Some((time, self.read(time)?)))
    }

    /// Makes the store reachable under `alias` as well, through a link next to
    /// this store's file. Pending writes are committed first.
    pub fn copy_alias(&mut self, alias: &ContentDigest) -> Result<PathBuf> {
        self.commit()?;
        let alias_path = self.path.with_file_name(alias.as_str());
        link_file(&self.path, &alias_path)?;
        Ok(alias_path)
    }

    fn encode(&self, image: &RgbaImage) -> Result<Vec<u8>> {
        let rgb: RgbImage = image.convert();
        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, self.quality).encode_image(&rgb)?;
        Ok(out)
    }
}
