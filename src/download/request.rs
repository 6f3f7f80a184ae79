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

//! Download request model

use crate::stream::headers::{combine_streaming_headers, source_default_headers, HeaderMap};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// How the source serves the media
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamType {
    /// Adaptive HLS manifest, downloaded segment by segment
    Hls,
    /// Single file (mp4 or similar)
    Direct,
}

impl StreamType {
    /// `.m3u8` anywhere in the url means HLS
    pub fn infer_from_url(url: &str) -> Self {
        if url.to_ascii_lowercase().contains(".m3u8") {
            StreamType::Hls
        } else {
            StreamType::Direct
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StreamType::Hls => "hls",
            StreamType::Direct => "direct",
        }
    }
}

/// Movie or episode metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ContentKind {
    Movie,
    #[serde(rename_all = "camelCase")]
    Episode {
        show_title: String,
        season: u32,
        episode: u32,
    },
}

impl ContentKind {
    pub fn episode_number(&self) -> Option<u32> {
        match self {
            ContentKind::Movie => None,
            ContentKind::Episode { episode, .. } => Some(*episode),
        }
    }

    pub fn is_episode(&self) -> bool {
        matches!(self, ContentKind::Episode { .. })
    }
}

/// The module a stream was scraped from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamSource {
    pub id: String,
    pub name: String,
    pub stream_type: StreamType,
    /// Site the stream was found on; used for Referer/Origin defaults
    pub base_url: String,
}

/// A request to download one video
///
/// The id is generated at construction and cannot be supplied from JSON. A clone
/// shares its id, so the queue mints a fresh one when it sees a duplicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadRequest {
    #[serde(skip_deserializing, default = "new_request_id")]
    id: String,
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    pub title: String,
    #[serde(default)]
    pub artwork_url: Option<String>,
    pub content: ContentKind,
    #[serde(default)]
    pub subtitle_url: Option<String>,
    #[serde(default)]
    pub source: Option<StreamSource>,
    #[serde(default)]
    pub show_poster_url: Option<String>,
    /// Variant label to download for adaptive streams; highest when unset
    #[serde(default)]
    pub preferred_quality: Option<String>,
}

fn new_request_id() -> String {
    Uuid::new_v4().to_string()
}

impl DownloadRequest {
    pub fn new(url: impl Into<String>, title: impl Into<String>, content: ContentKind) -> Self {
        Self {
            id: new_request_id(),
            url: url.into(),
            headers: HashMap::new(),
            title: title.into(),
            artwork_url: None,
            content,
            subtitle_url: None,
            source: None,
            show_poster_url: None,
            preferred_quality: None,
        }
    }

    pub fn movie(url: impl Into<String>, title: impl Into<String>) -> Self {
        Self::new(url, title, ContentKind::Movie)
    }

    pub fn episode(
        url: impl Into<String>,
        title: impl Into<String>,
        show_title: impl Into<String>,
        season: u32,
        episode: u32,
    ) -> Self {
        Self::new(
            url,
            title,
            ContentKind::Episode {
                show_title: show_title.into(),
                season,
                episode,
            },
        )
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_subtitle(mut self, subtitle_url: impl Into<String>) -> Self {
        self.subtitle_url = Some(subtitle_url.into());
        self
    }

    pub fn with_source(mut self, source: StreamSource) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_artwork(mut self, artwork_url: impl Into<String>) -> Self {
        self.artwork_url = Some(artwork_url.into());
        self
    }

    pub fn with_show_poster(mut self, poster_url: impl Into<String>) -> Self {
        self.show_poster_url = Some(poster_url.into());
        self
    }

    pub fn with_preferred_quality(mut self, label: impl Into<String>) -> Self {
        self.preferred_quality = Some(label.into());
        self
    }

    /// Replace the id with a fresh one, returning it
    pub(crate) fn renew_id(&mut self) -> &str {
        self.id = new_request_id();
        &self.id
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn episode_number(&self) -> Option<u32> {
        self.content.episode_number()
    }

    /// Declared by the source module, inferred from the url otherwise
    pub fn stream_type(&self) -> StreamType {
        self.source
            .as_ref()
            .map(|s| s.stream_type)
            .unwrap_or_else(|| StreamType::infer_from_url(&self.url))
    }

    /// Headers handed to the transport: request headers over source defaults,
    /// then the streaming defaults for whatever is still missing
    pub fn transport_headers(&self) -> HeaderMap {
        self.headers_for(&self.url)
    }

    /// Same precedence as [`Self::transport_headers`], for a related url (subtitles)
    pub fn headers_for(&self, url: &str) -> HeaderMap {
        let original = self
            .source
            .as_ref()
            .map(|s| source_default_headers(&s.base_url))
            .unwrap_or_default();
        combine_streaming_headers(&original, &self.headers, url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::headers::header_value;

    #[test]
    fn test_ids_are_unique() {
        let a = DownloadRequest::movie("https://cdn.example.com/a.mp4", "A");
        let b = DownloadRequest::movie("https://cdn.example.com/a.mp4", "A");
        assert_ne!(a.id(), b.id());
        assert_eq!(Uuid::parse_str(a.id()).unwrap().get_version_num(), 4);
    }

    #[test]
    fn test_stream_type_from_source_then_url() {
        let hls = DownloadRequest::movie("https://cdn.example.com/master.m3u8", "A");
        assert_eq!(hls.stream_type(), StreamType::Hls);

        let direct = DownloadRequest::movie("https://cdn.example.com/a.mp4", "A");
        assert_eq!(direct.stream_type(), StreamType::Direct);

        let declared = DownloadRequest::movie("https://cdn.example.com/play?id=1", "A").with_source(StreamSource {
            id: "mod".into(),
            name: "Module".into(),
            stream_type: StreamType::Hls,
            base_url: "https://site.example.org".into(),
        });
        assert_eq!(declared.stream_type(), StreamType::Hls);
    }

    #[test]
    fn test_transport_headers_precedence() {
        let mut headers = HashMap::new();
        headers.insert("referer".to_string(), "https://custom.example.net/".to_string());
        let request = DownloadRequest::episode("https://cdn.example.com/ep.m3u8", "Pilot", "Show", 1, 1)
            .with_headers(headers)
            .with_source(StreamSource {
                id: "mod".into(),
                name: "Module".into(),
                stream_type: StreamType::Hls,
                base_url: "https://site.example.org/watch".into(),
            });

        let combined = request.transport_headers();
        assert_eq!(header_value(&combined, "Referer"), Some("https://custom.example.net/"));
        assert_eq!(header_value(&combined, "Origin"), Some("https://site.example.org"));
        assert!(header_value(&combined, "User-Agent").is_some());
    }

    #[test]
    fn test_serde_never_trusts_incoming_id() {
        let request = DownloadRequest::episode("https://cdn.example.com/ep.mp4", "Pilot", "Show", 2, 7);
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains(request.id()));

        let back: DownloadRequest = serde_json::from_str(&json).unwrap();
        assert_ne!(back.id(), request.id());
        assert!(Uuid::parse_str(back.id()).is_ok());
        assert_eq!(back.episode_number(), Some(7));
    }

    #[test]
    fn test_renew_id() {
        let mut request = DownloadRequest::movie("https://cdn.example.com/m.mp4", "Movie");
        let copy = request.clone();
        assert_eq!(copy.id(), request.id());

        let fresh = request.renew_id().to_string();
        assert_ne!(fresh, copy.id());
        assert_eq!(request.id(), fresh);
    }

    #[test]
    fn test_json_without_id_gets_one() {
        let json = r#"{"url":"https://cdn.example.com/m.mp4","title":"Movie","content":{"kind":"movie"}}"#;
        let request: DownloadRequest = serde_json::from_str(json).unwrap();
        assert!(Uuid::parse_str(request.id()).is_ok());
        assert_eq!(request.stream_type(), StreamType::Direct);
    }
}
