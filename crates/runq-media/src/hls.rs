//! HLS output naming and manifest helpers.
//!
//! The live engine writes a master manifest, one manifest per output
//! (`<index>.m3u8`) and segments named `<index>-<sequence>.ts`.

use std::collections::BTreeSet;
use std::path::Path;

pub const MASTER_PLAYLIST: &str = "master.m3u8";
pub const PLAYLIST_EXTENSION: &str = "m3u8";
pub const SEGMENT_EXTENSION: &str = "ts";
pub const END_LIST_TAG: &str = "#EXT-X-ENDLIST";

/// Manifest file name for output `index`.
pub fn playlist_name(index: usize) -> String {
    format!("{}.{}", index, PLAYLIST_EXTENSION)
}

/// FFmpeg `-hls_segment_filename` pattern relative to the output dir.
pub fn segment_pattern() -> String {
    format!("%v-%06d.{}", SEGMENT_EXTENSION)
}

/// FFmpeg variant manifest pattern relative to the output dir.
pub fn variant_playlist_pattern() -> String {
    format!("%v.{}", PLAYLIST_EXTENSION)
}

/// Every manifest the engine writes for `outputs` resolutions.
pub fn expected_playlists(outputs: usize) -> BTreeSet<String> {
    std::iter::once(MASTER_PLAYLIST.to_string())
        .chain((0..outputs).map(playlist_name))
        .collect()
}

fn has_extension(path: &Path, extension: &str) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some(extension)
}

pub fn is_playlist(path: &Path) -> bool {
    has_extension(path, PLAYLIST_EXTENSION)
}

pub fn is_segment(path: &Path) -> bool {
    has_extension(path, SEGMENT_EXTENSION)
}

/// Output index of a segment file name: the leading digits before `-`.
pub fn segment_resolution(filename: &str) -> Option<usize> {
    let (index, rest) = filename.split_once('-')?;
    if index.is_empty() || !index.bytes().all(|b| b.is_ascii_digit()) || rest.is_empty() {
        return None;
    }
    index.parse().ok()
}

pub fn has_end_marker(content: &str) -> bool {
    content.lines().any(|line| line.trim() == END_LIST_TAG)
}

/// Manifest content safe to publish alongside `chunk`.
///
/// Ended manifests are returned verbatim. Otherwise the content is cut right
/// after the line referencing `chunk`, so entries the engine may still be
/// writing never leak out. `None` when `chunk` is not listed yet.
pub fn trim_playlist(content: &str, chunk: &str) -> Option<String> {
    if has_end_marker(content) {
        return Some(content.to_string());
    }

    let mut trimmed = String::with_capacity(content.len());
    for line in content.lines() {
        trimmed.push_str(line);
        trimmed.push('\n');

        let entry = line.trim();
        if !entry.starts_with('#') && references(entry, chunk) {
            return Some(trimmed);
        }
    }

    None
}

/// Manifest entries may be bare names or paths/URIs ending in the name.
fn references(entry: &str, chunk: &str) -> bool {
    entry == chunk
        || entry
            .strip_suffix(chunk)
            .is_some_and(|prefix| prefix.ends_with('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIVE: &str = "#EXTM3U\n\
        #EXT-X-VERSION:3\n\
        #EXT-X-TARGETDURATION:2\n\
        #EXT-X-MEDIA-SEQUENCE:0\n\
        #EXTINF:2.000000,\n\
        0-000000.ts\n\
        #EXTINF:2.000000,\n\
        0-000001.ts\n\
        #EXTINF:2.000000,\n\
        0-000002.ts\n";

    #[test]
    fn test_naming() {
        assert_eq!(playlist_name(2), "2.m3u8");
        assert_eq!(segment_resolution("0-000001.ts"), Some(0));
        assert_eq!(segment_resolution("12-000001.ts"), Some(12));
        assert_eq!(segment_resolution("master.m3u8"), None);
        assert_eq!(segment_resolution("a-1.ts"), None);
        assert_eq!(segment_resolution("-1.ts"), None);
        assert!(is_segment(Path::new("/tmp/x/0-000001.ts")));
        assert!(is_playlist(Path::new("/tmp/x/master.m3u8")));
        assert!(!is_playlist(Path::new("/tmp/x/0-000001.ts")));
    }

    #[test]
    fn test_expected_playlists() {
        let expected = expected_playlists(2);
        let names: Vec<&str> = expected.iter().map(String::as_str).collect();
        assert_eq!(names, vec!["0.m3u8", "1.m3u8", "master.m3u8"]);
    }

    #[test]
    fn test_trim_cuts_after_chunk() {
        let trimmed = trim_playlist(LIVE, "0-000001.ts").unwrap();
        assert!(trimmed.ends_with("0-000001.ts\n"));
        assert!(trimmed.contains("0-000000.ts"));
        assert!(!trimmed.contains("0-000002.ts"));
    }

    #[test]
    fn test_trim_unknown_chunk() {
        assert_eq!(trim_playlist(LIVE, "0-000009.ts"), None);
        // prefix of a listed name is not a reference
        assert_eq!(trim_playlist(LIVE, "000001.ts"), None);
    }

    #[test]
    fn test_trim_keeps_ended_playlist() {
        let ended = format!("{}{}\n", LIVE, END_LIST_TAG);
        assert!(has_end_marker(&ended));
        assert_eq!(trim_playlist(&ended, "0-000000.ts").unwrap(), ended);
    }

    #[test]
    fn test_trim_matches_uri_entries() {
        let content = "#EXTM3U\n#EXTINF:2.0,\nhttps://cdn/live/0-000000.ts\n#EXTINF:2.0,\nhttps://cdn/live/0-000001.ts\n";
        let trimmed = trim_playlist(content, "0-000000.ts").unwrap();
        assert!(!trimmed.contains("0-000001.ts"));
    }
}
