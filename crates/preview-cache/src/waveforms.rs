use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::{link_file, ContentDigest, Result};

const EXTENSION: &str = "wave";

/// Whole-file waveform storage: one mono amplitude array per source, written
/// once when analysis completes. A file's presence means "already computed".
#[derive(Debug, Clone)]
pub struct WaveformStore {
    dir: PathBuf,
}

impl WaveformStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self { Self { dir: dir.into() } }

    pub fn dir(&self) -> &Path { &self.dir }

    pub fn path_for(&self, digest: &ContentDigest) -> PathBuf {
        self.dir.join(format!("{}.{EXTENSION}", digest.as_str()))
    }

    pub fn exists(&self, digest: &ContentDigest) -> bool { self.path_for(digest).exists() }

    pub fn load(&self, digest: &ContentDigest) -> Result<Vec<f64>> {
        let file = File::open(self.path_for(digest))?;
        let samples: Vec<f64> = serde_json::from_reader(BufReader::new(file))?;
        debug!(digest = digest.short(), samples = samples.len(), "loaded waveform");
        Ok(samples)
    }

    pub fn write(&self, digest: &ContentDigest, samples: &[f64]) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(digest);
        let tmp = path.with_extension(format!("{EXTENSION}.tmp"));
        let written = write_samples(&tmp, samples).and_then(|()| Ok(fs::rename(&tmp, &path)?));
        if written.is_err() {
            let _ = fs::remove_file(&tmp);
        }
        written?;
        info!(digest = digest.short(), samples = samples.len(), path = %path.display(), "saved waveform");
        Ok(())
    }

    /// Links the waveform of `alias` (a proxy) to the one of `source`.
    pub fn alias(&self, alias: &ContentDigest, source: &ContentDigest) -> Result<()> {
        link_file(&self.path_for(source), &self.path_for(alias))
    }
}

fn write_samples(path: &Path, samples: &[f64]) -> Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    serde_json::to_writer(&mut out, samples)?;
    out.flush()?;
    out.get_ref().sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CacheError;

    #[test]
    fn test_existence_marks_computed() {
        let dir = tempfile::tempdir().unwrap();
        let store = WaveformStore::new(dir.path());
        let digest = ContentDigest::new("feed");
        assert!(!store.exists(&digest));
        store.write(&digest, &[1.0, 2.5, 0.0]).unwrap();
        assert!(store.exists(&digest));
        assert_eq!(store.load(&digest).unwrap(), vec![1.0, 2.5, 0.0]);
        assert!(store.path_for(&digest).ends_with("feed.wave"));
    }

    #[test]
    fn test_write_replaces_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = WaveformStore::new(dir.path());
        let digest = ContentDigest::new("feed");
        store.write(&digest, &[1.0; 64]).unwrap();
        store.write(&digest, &[9.0, 8.0]).unwrap();
        assert_eq!(store.load(&digest).unwrap(), vec![9.0, 8.0]);
        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["feed.wave".to_string()]);
    }

    #[test]
    fn test_alias_reads_original() {
        let dir = tempfile::tempdir().unwrap();
        let store = WaveformStore::new(dir.path());
        let original = ContentDigest::new("original");
        let proxy = ContentDigest::new("proxy");
        store.write(&original, &[3.0, 4.0]).unwrap();
        store.alias(&proxy, &original).unwrap();
        assert!(store.exists(&proxy));
        assert_eq!(store.load(&proxy).unwrap(), vec![3.0, 4.0]);
    }

    #[test]
    fn test_corrupt_file_is_a_decode_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = WaveformStore::new(dir.path());
        let digest = ContentDigest::new("bad");
        fs::write(store.path_for(&digest), b"[1.0, oops").unwrap();
        assert!(matches!(store.load(&digest), Err(CacheError::Serde(_))));
    }
}
