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

//! Persistence for the downloaded library
//!
//! Everything is stored as JSON values in a single SQLite key/value table, keyed
//! by the names in [`models`]. The asset list lives under `downloadedAssets`; the
//! ids of downloads in flight live under `activeDownloads`.
//!
//! # Usage Example
//! ```no_run
//! use streamshelf_core::download::EventBus;
//! use streamshelf_core::storage::{AssetStore, Database};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let db = Database::new("./library.db").await?;
//! let store = AssetStore::open(db, "./Downloads".into(), EventBus::new()).await?;
//!
//! for asset in store.assets().await {
//!     println!("{} -> {}", asset.name, asset.local_url.display());
//! }
//! # Ok(())
//! # }
//! ```

pub mod assets;
pub mod database;
pub mod migrations;
pub mod models;
pub mod queries;

// Re-export commonly used types
pub use assets::{AssetStore, ValidationReport};
pub use database::Database;
pub use models::{ActiveDownloadRecord, DownloadedAsset, ACTIVE_DOWNLOADS_KEY, DOWNLOADED_ASSETS_KEY};
