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

//! Persisted records
//!
//! Both records are stored as JSON arrays under fixed keys of the key-value table.
//! Field names are camelCase on disk.

use crate::download::request::{ContentKind, DownloadRequest, StreamType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Key holding the asset list
pub const DOWNLOADED_ASSETS_KEY: &str = "downloadedAssets";

/// Key holding in-flight download bookkeeping
pub const ACTIVE_DOWNLOADS_KEY: &str = "activeDownloads";

/// A finished download kept for offline playback
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadedAsset {
    pub id: String,
    pub name: String,
    pub download_date: DateTime<Utc>,
    pub original_url: String,
    pub local_url: PathBuf,
    pub content: ContentKind,
    #[serde(default)]
    pub subtitle_url: Option<String>,
    #[serde(default)]
    pub local_subtitle_url: Option<PathBuf>,
    #[serde(default)]
    pub artwork_url: Option<String>,
    #[serde(default)]
    pub show_poster_url: Option<String>,
    #[serde(default)]
    pub module_id: Option<String>,
}

impl DownloadedAsset {
    /// Asset for a completed request whose output now lives at `local_url`
    ///
    /// Shares the request id so late events can be matched to it.
    pub fn from_request(request: &DownloadRequest, local_url: PathBuf) -> Self {
        Self {
            id: request.id().to_string(),
            name: request.title.clone(),
            download_date: Utc::now(),
            original_url: request.url.clone(),
            local_url,
            content: request.content.clone(),
            subtitle_url: request.subtitle_url.clone(),
            local_subtitle_url: None,
            artwork_url: request.artwork_url.clone(),
            show_poster_url: request.show_poster_url.clone(),
            module_id: request.source.as_ref().map(|s| s.id.clone()),
        }
    }

    /// Video file (or package) is present on disk
    pub fn is_playable(&self) -> bool {
        self.local_url.exists()
    }

    pub fn has_local_subtitle(&self) -> bool {
        self.local_subtitle_url
            .as_deref()
            .is_some_and(Path::exists)
    }

    /// Subtitle url known but not yet materialized
    pub fn subtitle_pending(&self) -> bool {
        self.subtitle_url.is_some() && self.local_subtitle_url.is_none()
    }

    pub fn episode_number(&self) -> Option<u32> {
        self.content.episode_number()
    }

    pub fn file_name(&self) -> Option<&str> {
        self.local_url.file_name().and_then(|n| n.to_str())
    }
}

/// Bookkeeping entry for one in-flight download
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveDownloadRecord {
    pub id: String,
    pub url: String,
    #[serde(rename = "type")]
    pub stream_type: StreamType,
    pub title: String,
}

impl From<&DownloadRequest> for ActiveDownloadRecord {
    fn from(request: &DownloadRequest) -> Self {
        Self {
            id: request.id().to_string(),
            url: request.url.clone(),
            stream_type: request.stream_type(),
            title: request.title.clone(),
        }
    }
}
