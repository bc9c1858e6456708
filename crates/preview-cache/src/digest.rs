use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::Result;

const CHUNK_SIZE: usize = 100_000;
const MAX_CHUNKS: usize = 100;

/// Stable identity of a media file's content, independent of its path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentDigest(String);

impl ContentDigest {
    /// Wraps an already computed hex digest.
    pub fn new(hex: impl Into<String>) -> Self { Self(hex.into()) }

    pub fn as_str(&self) -> &str { &self.0 }

    /// Short form for log lines.
    pub fn short(&self) -> &str { self.0.get(..12).unwrap_or(&self.0) }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

/// SHA-256 over the first 10 MB of `path`, read in 100 KB chunks.
pub fn hash_file(path: &Path) -> Result<ContentDigest> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    for _ in 0..MAX_CHUNKS {
        let n = read_chunk(&mut file, &mut buf)?;
        if n == 0 { break; }
        hasher.update(&buf[..n]);
    }
    Ok(ContentDigest(format!("{:x}", hasher.finalize())))
}

// Fills `buf` unless EOF comes first.
fn read_chunk(file: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}
