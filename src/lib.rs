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

//! Streamshelf core
//!
//! Offline-video engine for the Streamshelf app: a download queue with bounded
//! concurrency, HLS quality parsing, streaming header policy, quality preferences and
//! persistence of the downloaded library.
//!
//! Swift reaches this crate two ways: uniffi bindings for the stateless helpers
//! exported below, and the JSON C functions in [`ios_bridge`] for everything that
//! needs the shared runtime.

uniffi::setup_scaffolding!();

pub mod config;
pub mod download;
pub mod error;
pub mod file;
pub mod ios_bridge;
pub mod logging;
pub mod storage;
pub mod stream;

pub use config::{CoreConfig, DownloadConfig};
pub use download::{DownloadEvent, DownloadManager, DownloadRequest, EventBus, HttpTransport};
pub use error::{Result, ShelfError, TransportError};
pub use storage::{AssetStore, Database, DownloadedAsset};
pub use stream::QualityVariant;

use std::collections::HashMap;

/// Fill in Origin, Referer and User-Agent for `url` without overriding caller values
#[uniffi::export]
pub fn ensure_streaming_headers(headers: HashMap<String, String>, url: String) -> HashMap<String, String> {
    stream::ensure_streaming_headers(&headers, &url)
}

/// Per-stream headers over the original ones, then the streaming defaults
#[uniffi::export]
pub fn combine_streaming_headers(
    original: HashMap<String, String>,
    per_stream: HashMap<String, String>,
    url: String,
) -> HashMap<String, String> {
    stream::combine_streaming_headers(&original, &per_stream, &url)
}

/// Quality variants of a master manifest, Auto first
#[uniffi::export]
pub fn parse_quality_manifest(manifest: String, base_url: String) -> Vec<QualityVariant> {
    stream::parse_quality_variants(&manifest, &base_url)
}

#[uniffi::export]
pub fn closest_quality(
    preferred: String,
    available: Vec<QualityVariant>,
    last_used: Option<String>,
) -> Option<QualityVariant> {
    stream::find_closest_quality(&preferred, &available, last_used.as_deref()).cloned()
}
