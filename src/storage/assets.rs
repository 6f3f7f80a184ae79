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

//! Asset persistence store
//!
//! Holds the list of downloaded assets in memory and re-encodes the whole list into
//! the key-value table after every mutation. On open the list is validated against
//! the filesystem: assets whose files moved are repointed, assets whose files are
//! gone are dropped.
//!
//! # Events
//! - `Deleted` after an explicit removal
//! - `Cleanup` when validation dropped assets
//! - `LibraryChange` when validation only repointed paths

use crate::download::events::{DownloadEvent, EventBus};
use crate::error::{Result, ShelfError};
use crate::file::{FileManager, DownloadsScanner};
use crate::storage::models::{ActiveDownloadRecord, DownloadedAsset, ACTIVE_DOWNLOADS_KEY, DOWNLOADED_ASSETS_KEY};
use crate::storage::{queries, Database};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

/// Outcome of [`AssetStore::validate_and_update_asset_locations`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    /// Assets whose video was found elsewhere
    pub relocated: usize,
    /// Assets dropped because their video is gone
    pub removed: usize,
    /// Subtitles found elsewhere
    pub subtitles_relocated: usize,
    /// Subtitles cleared because the file is gone
    pub subtitles_cleared: usize,
}

impl ValidationReport {
    pub fn changed(&self) -> bool {
        self.relocated + self.removed + self.subtitles_relocated + self.subtitles_cleared > 0
    }
}

/// Store of downloaded assets
#[derive(Debug)]
pub struct AssetStore {
    db: Database,
    files: FileManager,
    scanner: DownloadsScanner,
    events: EventBus,
    assets: RwLock<Vec<DownloadedAsset>>,
}

impl AssetStore {
    /// Load persisted assets, then validate them once against the filesystem
    pub async fn open(db: Database, downloads_dir: PathBuf, events: EventBus) -> Result<Self> {
        FileManager::ensure_directory_exists(&downloads_dir).await?;

        let assets = match queries::get_json::<Vec<DownloadedAsset>>(db.pool(), DOWNLOADED_ASSETS_KEY).await {
            Ok(Some(assets)) => assets,
            Ok(None) => Vec::new(),
            Err(ShelfError::SerdeJsonError(e)) => {
                tracing::warn!(error = %e, "Persisted asset list is corrupt, starting empty");
                Vec::new()
            }
            Err(e) => return Err(e),
        };

        let store = Self {
            db,
            files: FileManager::new(downloads_dir.clone()),
            scanner: DownloadsScanner::new(downloads_dir),
            events,
            assets: RwLock::new(assets),
        };

        let report = store.validate_and_update_asset_locations().await?;
        tracing::info!(
            assets = store.assets.read().await.len(),
            relocated = report.relocated,
            removed = report.removed,
            "Asset store opened"
        );

        Ok(store)
    }

    pub fn downloads_dir(&self) -> &Path {
        self.files.downloads_dir()
    }

    pub fn file_manager(&self) -> &FileManager {
        &self.files
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Bus shared with the download manager
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Re-encode the whole list
    pub async fn save(&self) -> Result<()> {
        let assets = self.assets.read().await;
        Self::persist(&self.db, &assets).await
    }

    async fn persist(db: &Database, assets: &[DownloadedAsset]) -> Result<()> {
        queries::set_json(db.pool(), DOWNLOADED_ASSETS_KEY, assets).await
    }

    pub async fn assets(&self) -> Vec<DownloadedAsset> {
        self.assets.read().await.clone()
    }

    pub async fn get(&self, id: &str) -> Option<DownloadedAsset> {
        self.assets.read().await.iter().find(|a| a.id == id).cloned()
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.assets.read().await.iter().any(|a| a.id == id)
    }

    /// Add or replace by id
    pub async fn add(&self, asset: DownloadedAsset) -> Result<()> {
        let mut assets = self.assets.write().await;
        match assets.iter_mut().find(|a| a.id == asset.id) {
            Some(existing) => *existing = asset,
            None => assets.push(asset),
        }
        Self::persist(&self.db, &assets).await
    }

    /// Record the local subtitle file of an existing asset
    pub async fn attach_subtitle(&self, id: &str, path: PathBuf) -> Result<()> {
        let mut assets = self.assets.write().await;
        let asset = assets
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or_else(|| ShelfError::not_found(format!("asset {}", id)))?;
        asset.local_subtitle_url = Some(path);
        Self::persist(&self.db, &assets).await
    }

    /// Remove an asset and its files; emits `Deleted` when it existed
    pub async fn remove(&self, id: &str) -> Result<Option<DownloadedAsset>> {
        let removed = {
            let mut assets = self.assets.write().await;
            let Some(index) = assets.iter().position(|a| a.id == id) else {
                return Ok(None);
            };
            let removed = assets.remove(index);
            Self::persist(&self.db, &assets).await?;
            removed
        };

        Self::delete_files(&removed).await;
        tracing::info!(id, name = %removed.name, "Asset deleted");
        self.events.emit(DownloadEvent::Deleted);
        Ok(Some(removed))
    }

    /// Remove every asset; emits a single `Deleted`
    pub async fn remove_all(&self) -> Result<usize> {
        let removed: Vec<DownloadedAsset> = {
            let mut assets = self.assets.write().await;
            let removed = std::mem::take(&mut *assets);
            Self::persist(&self.db, &assets).await?;
            removed
        };

        for asset in &removed {
            Self::delete_files(asset).await;
        }
        if !removed.is_empty() {
            self.events.emit(DownloadEvent::Deleted);
        }
        Ok(removed.len())
    }

    async fn delete_files(asset: &DownloadedAsset) {
        if let Err(e) = FileManager::safe_delete(&asset.local_url).await {
            tracing::warn!(id = %asset.id, error = %e, "Failed to delete video file");
        }
        if let Some(subtitle) = &asset.local_subtitle_url {
            if let Err(e) = FileManager::safe_delete(subtitle).await {
                tracing::warn!(id = %asset.id, error = %e, "Failed to delete subtitle file");
            }
        }
    }

    /// Total bytes on disk across all assets
    pub async fn storage_size(&self) -> Result<u64> {
        let assets = self.assets().await;
        let mut total = 0;
        for asset in &assets {
            total += FileManager::size_on_disk(&asset.local_url).await?;
            if let Some(subtitle) = &asset.local_subtitle_url {
                total += FileManager::size_on_disk(subtitle).await?;
            }
        }
        Ok(total)
    }

    /// Reconcile records with the filesystem
    ///
    /// 1. Missing video: search the downloads directory for the same file name,
    ///    repoint when found, drop the asset otherwise
    /// 2. Missing subtitle: search for `subtitle-<id>.*`, repoint when found,
    ///    clear just the subtitle otherwise
    pub async fn validate_and_update_asset_locations(&self) -> Result<ValidationReport> {
        let mut report = ValidationReport::default();
        let mut assets = self.assets.write().await;
        let mut kept = Vec::with_capacity(assets.len());

        for mut asset in assets.clone() {
            if !FileManager::file_exists(&asset.local_url).await {
                let found = match asset.file_name() {
                    Some(name) => self.scanner.find_by_name(name).await?,
                    None => None,
                };
                match found {
                    Some(path) => {
                        tracing::info!(id = %asset.id, path = %path.display(), "Relocated asset");
                        asset.local_url = path;
                        report.relocated += 1;
                    }
                    None => {
                        tracing::warn!(id = %asset.id, name = %asset.name, "Asset file missing, removing record");
                        if let Some(subtitle) = &asset.local_subtitle_url {
                            let _ = FileManager::safe_delete(subtitle).await;
                        }
                        report.removed += 1;
                        continue;
                    }
                }
            }

            if let Some(subtitle) = asset.local_subtitle_url.clone() {
                if !FileManager::file_exists(&subtitle).await {
                    match self.scanner.find_subtitle(&asset.id).await? {
                        Some(path) => {
                            asset.local_subtitle_url = Some(path);
                            report.subtitles_relocated += 1;
                        }
                        None => {
                            tracing::warn!(id = %asset.id, "Subtitle file missing, clearing");
                            asset.local_subtitle_url = None;
                            report.subtitles_cleared += 1;
                        }
                    }
                }
            }

            kept.push(asset);
        }

        *assets = kept;
        if report.changed() {
            Self::persist(&self.db, &assets).await?;
        }
        drop(assets);

        if report.removed > 0 {
            self.events.emit(DownloadEvent::Cleanup);
        } else if report.changed() {
            self.events.emit(DownloadEvent::LibraryChange);
        }

        Ok(report)
    }

    // ========================================================================
    // ACTIVE DOWNLOAD BOOKKEEPING
    // ========================================================================

    /// Rewrite the `activeDownloads` key
    pub async fn save_active_records(&self, records: &[ActiveDownloadRecord]) -> Result<()> {
        queries::set_json(self.db.pool(), ACTIVE_DOWNLOADS_KEY, records).await
    }

    /// Read and clear bookkeeping left by a previous process
    pub async fn take_active_records(&self) -> Result<Vec<ActiveDownloadRecord>> {
        let records = match queries::get_json::<Vec<ActiveDownloadRecord>>(self.db.pool(), ACTIVE_DOWNLOADS_KEY).await {
            Ok(records) => records.unwrap_or_default(),
            Err(ShelfError::SerdeJsonError(e)) => {
                tracing::warn!(error = %e, "Active download bookkeeping is corrupt, ignoring");
                Vec::new()
            }
            Err(e) => return Err(e),
        };
        queries::delete_value(self.db.pool(), ACTIVE_DOWNLOADS_KEY).await?;
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::request::DownloadRequest;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    fn recorder(events: &EventBus) -> Arc<Mutex<Vec<DownloadEvent>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        events.subscribe(move |e| sink.lock().unwrap().push(e.clone()));
        seen
    }

    async fn asset_on_disk(dir: &Path, title: &str) -> DownloadedAsset {
        let request = DownloadRequest::movie(format!("https://cdn.example.com/{}.mp4", title), title);
        let path = dir.join(format!("{}-{}.mp4", title, request.id()));
        tokio::fs::write(&path, b"video").await.unwrap();
        DownloadedAsset::from_request(&request, path)
    }

    #[tokio::test]
    async fn test_add_persists_and_reloads() {
        let temp = TempDir::new().unwrap();
        let db = Database::new_in_memory().await.unwrap();
        let store = AssetStore::open(db.clone(), temp.path().to_path_buf(), EventBus::new())
            .await
            .unwrap();

        let asset = asset_on_disk(temp.path(), "Movie").await;
        store.add(asset.clone()).await.unwrap();

        let reopened = AssetStore::open(db, temp.path().to_path_buf(), EventBus::new())
            .await
            .unwrap();
        assert_eq!(reopened.get(&asset.id).await, Some(asset));
    }

    #[tokio::test]
    async fn test_corrupt_list_opens_empty() {
        let temp = TempDir::new().unwrap();
        let db = Database::new_in_memory().await.unwrap();
        queries::set_value(db.pool(), DOWNLOADED_ASSETS_KEY, "[{broken").await.unwrap();

        let store = AssetStore::open(db, temp.path().to_path_buf(), EventBus::new())
            .await
            .unwrap();
        assert!(store.assets().await.is_empty());
    }

    #[tokio::test]
    async fn test_remove_deletes_files_and_emits() {
        let temp = TempDir::new().unwrap();
        let events = EventBus::new();
        let store = AssetStore::open(Database::new_in_memory().await.unwrap(), temp.path().to_path_buf(), events.clone())
            .await
            .unwrap();
        let seen = recorder(&events);

        let asset = asset_on_disk(temp.path(), "Movie").await;
        let subtitle = temp.path().join(format!("subtitle-{}.vtt", asset.id));
        tokio::fs::write(&subtitle, b"WEBVTT").await.unwrap();
        store.add(asset.clone()).await.unwrap();
        store.attach_subtitle(&asset.id, subtitle.clone()).await.unwrap();
        assert_eq!(store.storage_size().await.unwrap(), 11);

        assert!(store.remove(&asset.id).await.unwrap().is_some());
        assert!(!asset.local_url.exists());
        assert!(!subtitle.exists());
        assert_eq!(*seen.lock().unwrap(), vec![DownloadEvent::Deleted]);

        assert!(store.remove(&asset.id).await.unwrap().is_none());
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_validation_repoints_moved_files() {
        let temp = TempDir::new().unwrap();
        let db = Database::new_in_memory().await.unwrap();

        let mut asset = asset_on_disk(temp.path(), "Movie").await;
        let file_name = asset.file_name().unwrap().to_string();
        // Recorded under an old container path
        asset.local_url = PathBuf::from("/old/container/Documents").join(&file_name);
        queries::set_json(db.pool(), DOWNLOADED_ASSETS_KEY, &vec![asset.clone()]).await.unwrap();

        let store = AssetStore::open(db, temp.path().to_path_buf(), EventBus::new())
            .await
            .unwrap();
        let loaded = store.get(&asset.id).await.unwrap();
        assert_eq!(loaded.local_url, temp.path().join(&file_name));

        let events = EventBus::new();
        let seen = recorder(&events);
        let store = AssetStore { events, ..store };
        let report = store.validate_and_update_asset_locations().await.unwrap();
        assert!(!report.changed());
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_validation_removes_missing_and_clears_subtitle() {
        let temp = TempDir::new().unwrap();
        let events = EventBus::new();
        let store = AssetStore::open(Database::new_in_memory().await.unwrap(), temp.path().to_path_buf(), events.clone())
            .await
            .unwrap();

        let gone = asset_on_disk(temp.path(), "Gone").await;
        let kept = asset_on_disk(temp.path(), "Kept").await;
        store.add(gone.clone()).await.unwrap();
        store.add(kept.clone()).await.unwrap();
        store
            .attach_subtitle(&kept.id, temp.path().join("missing-subtitle.vtt"))
            .await
            .unwrap();
        tokio::fs::remove_file(&gone.local_url).await.unwrap();

        let seen = recorder(&events);
        let report = store.validate_and_update_asset_locations().await.unwrap();

        assert_eq!(report.removed, 1);
        assert_eq!(report.subtitles_cleared, 1);
        assert!(store.get(&gone.id).await.is_none());
        assert_eq!(store.get(&kept.id).await.unwrap().local_subtitle_url, None);
        assert_eq!(*seen.lock().unwrap(), vec![DownloadEvent::Cleanup]);
    }

    #[tokio::test]
    async fn test_active_records_are_taken_once() {
        let temp = TempDir::new().unwrap();
        let store = AssetStore::open(Database::new_in_memory().await.unwrap(), temp.path().to_path_buf(), EventBus::new())
            .await
            .unwrap();

        let request = DownloadRequest::movie("https://cdn.example.com/m.mp4", "Movie");
        store
            .save_active_records(&[ActiveDownloadRecord::from(&request)])
            .await
            .unwrap();

        let records = store.take_active_records().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, request.id());
        assert!(store.take_active_records().await.unwrap().is_empty());
    }
}
