// Streamshelf - Offline Video Downloads for Mobile
// Copyright (C) 2025 Henning Berge
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! File naming for downloaded assets
//!
//! # Layout
//! - Videos: `<safeTitle>-<uuid>.movpkg` (segmented) or `<safeTitle>-<uuid>.mp4` (direct)
//! - Subtitles: `subtitle-<assetID>.<ext>`, next to the videos
//! - In-flight transport output lives under the temp directory until completion

use crate::download::request::StreamType;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Max bytes kept from a title; leaves room for the uuid suffix
const MAX_TITLE_BYTES: usize = 120;

pub const SEGMENTED_EXTENSION: &str = "movpkg";
pub const DIRECT_EXTENSION: &str = "mp4";
pub const DEFAULT_SUBTITLE_EXTENSION: &str = "vtt";
pub const SUBTITLE_PREFIX: &str = "subtitle-";

/// Sanitize a title for use as a file name stem
///
/// Path separators, reserved punctuation and control characters become `_`,
/// whitespace runs collapse to a single `_`.
pub fn safe_title(title: &str) -> String {
    let mut result = String::with_capacity(title.len());
    let mut last_was_separator = false;

    for c in title.trim().chars() {
        let mapped = match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' | '\0' => '_',
            c if c.is_control() || c.is_whitespace() => '_',
            c => c,
        };

        if mapped == '_' {
            if !last_was_separator {
                result.push('_');
            }
            last_was_separator = true;
        } else {
            result.push(mapped);
            last_was_separator = false;
        }
    }

    let result = truncate_component(result.trim_matches(|c| c == '_' || c == '.'), MAX_TITLE_BYTES);
    if result.is_empty() {
        "video".to_string()
    } else {
        result
    }
}

/// Truncate to a byte limit on a UTF-8 boundary
pub fn truncate_component(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }

    let mut index = max_bytes;
    while index > 0 && !text.is_char_boundary(index) {
        index -= 1;
    }
    text[..index].to_string()
}

/// Extension for a finished video, chosen from the original source URL
///
/// The transport's own output naming differs per stream type, so the request url
/// decides. Falls back to the declared stream type when the url is ambiguous.
pub fn video_extension(original_url: &str, stream_type: StreamType) -> &'static str {
    let lowered = original_url.to_ascii_lowercase();
    if lowered.contains(".m3u8") {
        SEGMENTED_EXTENSION
    } else if lowered.contains(".mp4") {
        DIRECT_EXTENSION
    } else {
        match stream_type {
            StreamType::Hls => SEGMENTED_EXTENSION,
            StreamType::Direct => DIRECT_EXTENSION,
        }
    }
}

/// `<safeTitle>-<uuid>.<ext>`
pub fn video_file_name(title: &str, extension: &str) -> String {
    format!("{}-{}.{}", safe_title(title), Uuid::new_v4(), extension)
}

/// Subtitle file extension from its source url, `vtt` when none is recognizable
pub fn subtitle_extension(subtitle_url: &str) -> String {
    let path = url::Url::parse(subtitle_url)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| subtitle_url.to_string());

    Path::new(&path)
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty() && e.len() <= 5 && e.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_else(|| DEFAULT_SUBTITLE_EXTENSION.to_string())
}

/// `subtitle-<assetID>.<ext>`
pub fn subtitle_file_name(asset_id: &str, extension: &str) -> String {
    format!("{}{}.{}", SUBTITLE_PREFIX, asset_id, extension)
}

/// True if `file_name` is the subtitle file of `asset_id` (any extension)
pub fn is_subtitle_for(file_name: &str, asset_id: &str) -> bool {
    file_name
        .strip_prefix(SUBTITLE_PREFIX)
        .and_then(|rest| rest.strip_prefix(asset_id))
        .is_some_and(|rest| rest.starts_with('.'))
}

/// Where a transport writes before completion
pub fn temp_output_path(temp_dir: &Path, download_id: &str, stream_type: StreamType) -> PathBuf {
    match stream_type {
        StreamType::Hls => temp_dir.join(format!("{}.{}", download_id, SEGMENTED_EXTENSION)),
        StreamType::Direct => temp_dir.join(format!("{}.download", download_id)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_title() {
        assert_eq!(safe_title("Breaking Bad: S01E01"), "Breaking_Bad_S01E01");
        assert_eq!(safe_title("  a / b \\ c  "), "a_b_c");
        assert_eq!(safe_title("Amélie"), "Amélie");
        assert_eq!(safe_title("???"), "video");
        assert_eq!(safe_title(""), "video");
    }

    #[test]
    fn test_truncate_component() {
        let long = "é".repeat(100);
        let truncated = truncate_component(&long, 15);
        assert!(truncated.len() <= 15);
        assert!(truncated.chars().all(|c| c == 'é'));
    }

    #[test]
    fn test_video_extension_uses_original_url() {
        assert_eq!(
            video_extension("https://cdn.example.com/master.m3u8?token=1", StreamType::Direct),
            "movpkg"
        );
        assert_eq!(video_extension("https://cdn.example.com/movie.mp4", StreamType::Hls), "mp4");
        assert_eq!(video_extension("https://cdn.example.com/play?id=9", StreamType::Hls), "movpkg");
        assert_eq!(video_extension("https://cdn.example.com/play?id=9", StreamType::Direct), "mp4");
    }

    #[test]
    fn test_video_file_name_is_unique() {
        let a = video_file_name("Movie", "mp4");
        let b = video_file_name("Movie", "mp4");
        assert!(a.starts_with("Movie-"));
        assert!(a.ends_with(".mp4"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_subtitle_naming() {
        assert_eq!(subtitle_extension("https://subs.example.com/en.srt?x=1"), "srt");
        assert_eq!(subtitle_extension("https://subs.example.com/track"), "vtt");
        assert_eq!(subtitle_file_name("abc", "vtt"), "subtitle-abc.vtt");
        assert!(is_subtitle_for("subtitle-abc.srt", "abc"));
        assert!(!is_subtitle_for("subtitle-abcd.srt", "abc"));
        assert!(!is_subtitle_for("movie-abc.srt", "abc"));
    }
}
