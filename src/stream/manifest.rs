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

//! Quality variants from an HLS master playlist
//!
//! # Result shape
//! - `[]` - the manifest could not be fetched or decoded. No quality info at all.
//! - `[Auto]` - a manifest without variant declarations. Quality switching is unavailable.
//! - `[Auto, 1080p (FHD), 720p (HD), ...]` - Auto pinned first, then height descending

use crate::stream::headers::{ensure_streaming_headers, to_reqwest_headers, HeaderMap};
use regex::Regex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::OnceLock;
use std::time::Duration;
use url::Url;

/// Label of the adaptive entry that points at the master manifest itself
pub const AUTO_LABEL: &str = "Auto";

const STREAM_INF_TAG: &str = "#EXT-X-STREAM-INF";

/// One selectable quality of a stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, uniffi::Record)]
pub struct QualityVariant {
    pub label: String,
    pub url: String,
    /// Vertical resolution; `None` for Auto
    pub height: Option<u32>,
}

impl QualityVariant {
    pub fn auto(url: &str) -> Self {
        Self {
            label: AUTO_LABEL.to_string(),
            url: url.to_string(),
            height: None,
        }
    }

    pub fn is_auto(&self) -> bool {
        self.height.is_none() && self.label == AUTO_LABEL
    }
}

fn resolution_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"RESOLUTION=(\d+)x(\d+)").expect("valid resolution regex"))
}

/// Human label for a vertical resolution
pub fn quality_label(height: u32) -> String {
    match height {
        h if h >= 1080 => format!("{}p (FHD)", h),
        h if h >= 720 => format!("{}p (HD)", h),
        h if h >= 480 => format!("{}p (SD)", h),
        h => format!("{}p", h),
    }
}

/// Resolve a playlist URI against the manifest URL
pub fn resolve_uri(base_url: &str, uri: &str) -> Option<String> {
    if uri.starts_with("http://") || uri.starts_with("https://") {
        return Some(uri.to_string());
    }
    let base = Url::parse(base_url).ok()?;
    base.join(uri).ok().map(|u| u.to_string())
}

/// Whether the text declares variant streams
pub fn is_master_playlist(manifest: &str) -> bool {
    manifest.lines().any(|l| l.trim_start().starts_with(STREAM_INF_TAG))
}

/// Parse the ranked list of quality variants of a master playlist.
///
/// `base_url` is the manifest's own URL. It is the target of the Auto entry and the
/// base for relative variant URIs.
pub fn parse_quality_variants(manifest: &str, base_url: &str) -> Vec<QualityVariant> {
    let lines: Vec<&str> = manifest.lines().map(str::trim).collect();
    let mut variants = vec![QualityVariant::auto(base_url)];
    let mut seen_labels = HashSet::new();

    for (index, line) in lines.iter().enumerate() {
        if !line.starts_with(STREAM_INF_TAG) {
            continue;
        }

        let Some(height) = resolution_regex()
            .captures(line)
            .and_then(|c| c.get(2))
            .and_then(|m| m.as_str().parse::<u32>().ok())
        else {
            continue;
        };

        let Some(uri) = lines[index + 1..]
            .iter()
            .find(|l| !l.is_empty() && !l.starts_with('#'))
        else {
            continue;
        };

        let label = quality_label(height);
        if !seen_labels.insert(label.clone()) {
            continue;
        }

        match resolve_uri(base_url, uri) {
            Some(url) => variants.push(QualityVariant {
                label,
                url,
                height: Some(height),
            }),
            None => tracing::debug!(uri = %uri, "Skipping variant with unresolvable URI"),
        }
    }

    // Stable sort keeps Auto (height None) ahead of every resolution
    variants[1..].sort_by(|a, b| b.height.cmp(&a.height));
    variants
}

/// Fetch a manifest and parse its variants. Any fetch or decode failure yields `[]`.
///
/// `timeout` bounds the whole request, body included.
pub async fn fetch_quality_variants(
    client: &Client,
    url: &str,
    headers: &HeaderMap,
    timeout: Duration,
) -> Vec<QualityVariant> {
    let request_headers = to_reqwest_headers(&ensure_streaming_headers(headers, url));

    let response = match client.get(url).headers(request_headers).timeout(timeout).send().await {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!(url = %url, error = %e, "Manifest request failed");
            return Vec::new();
        }
    };

    if !response.status().is_success() {
        tracing::warn!(url = %url, status = %response.status(), "Manifest request rejected");
        return Vec::new();
    }

    // Manifest may have been redirected; relative URIs resolve against the final URL
    let final_url = response.url().to_string();
    match response.text().await {
        Ok(text) => parse_quality_variants(&text, &final_url),
        Err(e) => {
            tracing::warn!(url = %url, error = %e, "Manifest body could not be decoded");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MASTER: &str = "#EXTM3U
#EXT-X-VERSION:3
#EXT-X-STREAM-INF:BANDWIDTH=800000,RESOLUTION=854x480
480/index.m3u8
#EXT-X-STREAM-INF:BANDWIDTH=5000000,RESOLUTION=1920x1080,CODECS=\"avc1.640028,mp4a.40.2\"
https://other-cdn.example.com/1080/index.m3u8
#EXT-X-STREAM-INF:BANDWIDTH=2800000,RESOLUTION=1280x720

720/index.m3u8
";

    #[test]
    fn test_labels_by_threshold() {
        assert_eq!(quality_label(2160), "2160p (FHD)");
        assert_eq!(quality_label(1080), "1080p (FHD)");
        assert_eq!(quality_label(720), "720p (HD)");
        assert_eq!(quality_label(1079), "1079p (HD)");
        assert_eq!(quality_label(480), "480p (SD)");
        assert_eq!(quality_label(360), "360p");
    }

    #[test]
    fn test_parse_sorted_with_auto_first() {
        let base = "https://cdn.example.com/show/ep1/master.m3u8";
        let variants = parse_quality_variants(MASTER, base);

        let labels: Vec<&str> = variants.iter().map(|v| v.label.as_str()).collect();
        assert_eq!(labels, vec!["Auto", "1080p (FHD)", "720p (HD)", "480p (SD)"]);

        assert_eq!(variants[0].url, base);
        assert_eq!(variants[1].url, "https://other-cdn.example.com/1080/index.m3u8");
        assert_eq!(variants[2].url, "https://cdn.example.com/show/ep1/720/index.m3u8");
        assert_eq!(variants[3].height, Some(480));
    }

    #[test]
    fn test_duplicate_labels_first_wins() {
        let manifest = "#EXTM3U
#EXT-X-STREAM-INF:BANDWIDTH=2800000,RESOLUTION=1280x720
high/720.m3u8
#EXT-X-STREAM-INF:BANDWIDTH=1400000,RESOLUTION=1280x720
low/720.m3u8
";
        let variants = parse_quality_variants(manifest, "https://cdn.example.com/master.m3u8");
        assert_eq!(variants.len(), 2);
        assert_eq!(variants[1].url, "https://cdn.example.com/high/720.m3u8");
    }

    #[test]
    fn test_no_declarations_gives_auto_only() {
        let media = "#EXTM3U\n#EXTINF:10.0,\nseg0.ts\n#EXT-X-ENDLIST\n";
        let variants = parse_quality_variants(media, "https://cdn.example.com/index.m3u8");
        assert_eq!(variants, vec![QualityVariant::auto("https://cdn.example.com/index.m3u8")]);
        assert!(!is_master_playlist(media));
    }

    #[test]
    fn test_declaration_without_resolution_is_skipped() {
        let manifest = "#EXTM3U
#EXT-X-STREAM-INF:BANDWIDTH=64000,CODECS=\"mp4a.40.2\"
audio.m3u8
#EXT-X-STREAM-INF:BANDWIDTH=800000,RESOLUTION=640x360
360.m3u8
";
        let variants = parse_quality_variants(manifest, "https://cdn.example.com/master.m3u8");
        let labels: Vec<&str> = variants.iter().map(|v| v.label.as_str()).collect();
        assert_eq!(labels, vec!["Auto", "360p"]);
    }
}
