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

//! Streaming helpers shared by the player and the download subsystem
//!
//! - `headers` - Origin/Referer/User-Agent policy for hotlink-protected CDNs
//! - `manifest` - quality variants from an HLS master playlist
//! - `playlist` - segments and keys from an HLS media playlist
//! - `quality` - picking a variant from the user's preference

pub mod headers;
pub mod manifest;
pub mod playlist;
pub mod quality;

// Re-export commonly used types
pub use headers::{combine_streaming_headers, ensure_streaming_headers, HeaderMap};
pub use manifest::{parse_quality_variants, QualityVariant, AUTO_LABEL};
pub use quality::{find_closest_quality, NetworkClass, QualityPreferences};
