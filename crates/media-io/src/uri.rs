use std::path::PathBuf;

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};

use crate::MediaError;

const FILE_SCHEME: &str = "file://";

// Characters that must be escaped in the path part of a file uri.
const PATH: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// Local path of a `file://` uri.
pub fn location_from_uri(uri: &str) -> Result<PathBuf, MediaError> {
    let rest = uri.strip_prefix(FILE_SCHEME).ok_or_else(|| MediaError::NotLocal(uri.to_string()))?;
    let decoded = percent_decode_str(rest).decode_utf8_lossy();
    Ok(PathBuf::from(decoded.into_owned()))
}

/// Last path component, for log lines.
pub fn filename_from_uri(uri: &str) -> String {
    location_from_uri(uri)
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| uri.to_string())
}

/// Re-escapes a possibly malformed file uri. Other schemes are returned unchanged.
pub fn quote_uri(uri: &str) -> String {
    match uri.strip_prefix(FILE_SCHEME) {
        Some(rest) => {
            let decoded = percent_decode_str(rest).decode_utf8_lossy();
            format!("{FILE_SCHEME}{}", utf8_percent_encode(&decoded, PATH))
        }
        None => uri.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_decodes_escapes() {
        let path = location_from_uri("file:///media/My%20Clip.mov").unwrap();
        assert_eq!(path, PathBuf::from("/media/My Clip.mov"));
        assert!(location_from_uri("http://host/clip.mov").is_err());
    }

    #[test]
    fn test_quote_uri_is_idempotent() {
        let once = quote_uri("file:///media/My Clip#1.mov");
        assert_eq!(once, "file:///media/My%20Clip%231.mov");
        assert_eq!(quote_uri(&once), once);
    }

    #[test]
    fn test_filename_from_uri() {
        assert_eq!(filename_from_uri("file:///a/b/c%20d.wav"), "c d.wav");
        assert_eq!(filename_from_uri("bogus"), "bogus");
    }
}
