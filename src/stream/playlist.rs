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

//! HLS media playlist parsing for offline segment downloads
//!
//! Only the tags needed to fetch a VOD rendition are understood:
//! `#EXTINF`, `#EXT-X-MEDIA-SEQUENCE`, `#EXT-X-KEY`, `#EXT-X-MAP`, `#EXT-X-ENDLIST`.

use crate::error::{Result, ShelfError};
use crate::stream::manifest::resolve_uri;
use regex::Regex;
use std::sync::OnceLock;

/// Segment encryption declared by `#EXT-X-KEY`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentKey {
    None,
    Aes128 { uri: String, iv: Option<[u8; 16]> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct MediaSegment {
    pub uri: String,
    pub duration: f64,
    pub sequence: u64,
    pub key: SegmentKey,
}

impl MediaSegment {
    /// IV for AES-128: explicit tag value, else the big-endian media sequence number
    pub fn iv(&self) -> Option<[u8; 16]> {
        match &self.key {
            SegmentKey::None => None,
            SegmentKey::Aes128 { iv: Some(iv), .. } => Some(*iv),
            SegmentKey::Aes128 { iv: None, .. } => {
                let mut iv = [0u8; 16];
                iv[8..].copy_from_slice(&self.sequence.to_be_bytes());
                Some(iv)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MediaPlaylist {
    pub segments: Vec<MediaSegment>,
    /// fMP4 initialization section from `#EXT-X-MAP`
    pub init_segment: Option<String>,
    pub target_duration: Option<f64>,
    pub ended: bool,
}

impl MediaPlaylist {
    /// Sum of segment durations in seconds
    pub fn total_duration(&self) -> f64 {
        self.segments.iter().map(|s| s.duration).sum()
    }
}

fn attribute_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"([A-Z0-9-]+)=("[^"]*"|[^,]*)"#).expect("valid attribute regex")
    })
}

/// Attribute value from a tag line, quotes stripped
fn attribute(line: &str, name: &str) -> Option<String> {
    attribute_regex()
        .captures_iter(line)
        .find(|c| &c[1] == name)
        .map(|c| c[2].trim_matches('"').to_string())
}

fn parse_iv(value: &str) -> Result<[u8; 16]> {
    let hex_str = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    let bytes = hex::decode(hex_str)
        .map_err(|e| ShelfError::InvalidPlaylist(format!("Invalid IV '{}': {}", value, e)))?;
    // Short IVs are left-padded with zeros
    if bytes.len() > 16 {
        return Err(ShelfError::InvalidPlaylist(format!("IV too long: {}", value)));
    }
    let mut iv = [0u8; 16];
    iv[16 - bytes.len()..].copy_from_slice(&bytes);
    Ok(iv)
}

fn parse_key(line: &str, base_url: &str) -> Result<SegmentKey> {
    let method = attribute(line, "METHOD").unwrap_or_default();
    match method.as_str() {
        "NONE" => Ok(SegmentKey::None),
        "AES-128" => {
            let uri = attribute(line, "URI")
                .ok_or_else(|| ShelfError::InvalidPlaylist("AES-128 key without URI".to_string()))?;
            let uri = resolve_uri(base_url, &uri)
                .ok_or_else(|| ShelfError::InvalidPlaylist(format!("Unresolvable key URI: {}", uri)))?;
            let iv = attribute(line, "IV").map(|v| parse_iv(&v)).transpose()?;
            Ok(SegmentKey::Aes128 { uri, iv })
        }
        other => Err(ShelfError::InvalidPlaylist(format!(
            "Unsupported encryption method: {}",
            other
        ))),
    }
}

/// Parse a media playlist; segment URIs are resolved against `base_url`.
pub fn parse_media_playlist(text: &str, base_url: &str) -> Result<MediaPlaylist> {
    if !text.trim_start().starts_with("#EXTM3U") {
        return Err(ShelfError::InvalidPlaylist("Missing #EXTM3U header".to_string()));
    }

    let mut playlist = MediaPlaylist {
        segments: Vec::new(),
        init_segment: None,
        target_duration: None,
        ended: false,
    };
    let mut sequence: u64 = 0;
    let mut key = SegmentKey::None;
    let mut pending_duration: Option<f64> = None;

    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if let Some(value) = line.strip_prefix("#EXT-X-MEDIA-SEQUENCE:") {
            sequence = value.trim().parse().unwrap_or(0);
        } else if let Some(value) = line.strip_prefix("#EXT-X-TARGETDURATION:") {
            playlist.target_duration = value.trim().parse().ok();
        } else if let Some(value) = line.strip_prefix("#EXTINF:") {
            let duration = value.split(',').next().unwrap_or("0").trim();
            pending_duration = Some(duration.parse().map_err(|_| {
                ShelfError::InvalidPlaylist(format!("Invalid segment duration: {}", duration))
            })?);
        } else if line.starts_with("#EXT-X-KEY:") {
            key = parse_key(line, base_url)?;
        } else if line.starts_with("#EXT-X-MAP:") {
            playlist.init_segment = attribute(line, "URI").and_then(|u| resolve_uri(base_url, &u));
        } else if line.starts_with("#EXT-X-ENDLIST") {
            playlist.ended = true;
        } else if line.starts_with('#') {
            continue;
        } else if let Some(duration) = pending_duration.take() {
            let uri = resolve_uri(base_url, line)
                .ok_or_else(|| ShelfError::InvalidPlaylist(format!("Unresolvable segment URI: {}", line)))?;
            playlist.segments.push(MediaSegment {
                uri,
                duration,
                sequence,
                key: key.clone(),
            });
            sequence += 1;
        }
    }

    if playlist.segments.is_empty() {
        return Err(ShelfError::InvalidPlaylist("Playlist has no segments".to_string()));
    }

    Ok(playlist)
}

/// Local playlist for a downloaded rendition. Segments are stored decrypted.
pub fn render_local_playlist(playlist: &MediaPlaylist, file_names: &[String], init_file: Option<&str>) -> String {
    let target = playlist
        .target_duration
        .unwrap_or_else(|| playlist.segments.iter().map(|s| s.duration).fold(0.0, f64::max))
        .ceil() as u64;

    let mut out = String::from("#EXTM3U\n#EXT-X-VERSION:7\n#EXT-X-PLAYLIST-TYPE:VOD\n");
    out.push_str(&format!("#EXT-X-TARGETDURATION:{}\n", target));
    out.push_str("#EXT-X-MEDIA-SEQUENCE:0\n");
    if let Some(init) = init_file {
        out.push_str(&format!("#EXT-X-MAP:URI=\"{}\"\n", init));
    }
    for (segment, name) in playlist.segments.iter().zip(file_names) {
        out.push_str(&format!("#EXTINF:{:.3},\n{}\n", segment.duration, name));
    }
    out.push_str("#EXT-X-ENDLIST\n");
    out
}
