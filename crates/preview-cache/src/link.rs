use std::fs;
use std::path::Path;

use tracing::debug;

use crate::Result;

/// Makes `alias` refer to the same data as `original`. An existing file at
/// `alias` is replaced.
pub fn link_file(original: &Path, alias: &Path) -> Result<()> {
    if original == alias { return Ok(()); }
    if fs::symlink_metadata(alias).is_ok() {
        fs::remove_file(alias)?;
    }
    cfg_if::cfg_if! {
        if #[cfg(unix)] {
            std::os::unix::fs::symlink(original, alias)?;
        } else {
            fs::hard_link(original, alias)?;
        }
    }
    debug!(original = %original.display(), alias = %alias.display(), "linked preview file");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_replaces_existing_alias() {
        let dir = tempfile::tempdir().unwrap();
        let original = dir.path().join("original");
        let alias = dir.path().join("alias");
        fs::write(&original, b"shared").unwrap();
        fs::write(&alias, b"stale").unwrap();
        link_file(&original, &alias).unwrap();
        assert_eq!(fs::read(&alias).unwrap(), b"shared");
        link_file(&original, &original).unwrap();
        assert_eq!(fs::read(&original).unwrap(), b"shared");
    }
}
