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

//! File operations on downloaded assets
//!
//! # Key Operations
//! - Safe moves of transport output (plain files and `.movpkg` directories) with retry
//! - Deletes that tolerate already-missing paths
//! - Size on disk for storage accounting

use crate::error::{Result, ShelfError};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::Duration;
use tokio::fs;
use tokio::time::sleep;

/// Maximum retry attempts for file operations
const MAX_RETRY_ATTEMPTS: u32 = 3;

/// Delay between retry attempts
const RETRY_DELAY: Duration = Duration::from_millis(100);

type BoxedIo<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// File manager rooted at the persistent downloads directory
#[derive(Debug, Clone)]
pub struct FileManager {
    downloads_dir: PathBuf,
}

impl FileManager {
    pub fn new(downloads_dir: PathBuf) -> Self {
        Self { downloads_dir }
    }

    pub fn downloads_dir(&self) -> &Path {
        &self.downloads_dir
    }

    /// Safe move operation with retry
    ///
    /// 1. Missing source is an error (the transport output vanished)
    /// 2. Existing destination is deleted
    /// 3. Parent directory is created
    /// 4. Rename, falling back to copy + delete across filesystems
    /// 5. Retry up to 3 times on failure
    pub async fn safe_move(&self, source: &Path, destination: &Path) -> Result<()> {
        if !Self::file_exists(source).await {
            return Err(ShelfError::FileNotFound(source.display().to_string()));
        }

        let mut attempts = 0;
        loop {
            attempts += 1;

            match Self::try_move(source, destination).await {
                Ok(()) => return Ok(()),
                Err(e) if attempts >= MAX_RETRY_ATTEMPTS => {
                    return Err(ShelfError::FileIoError(format!(
                        "Failed to move after {} attempts: {} -> {}: {}",
                        MAX_RETRY_ATTEMPTS,
                        source.display(),
                        destination.display(),
                        e
                    )));
                }
                Err(e) => {
                    tracing::debug!(attempt = attempts, error = %e, "Move failed, retrying");
                    sleep(RETRY_DELAY).await;
                }
            }
        }
    }

    /// Move `source` into the downloads directory under `file_name`
    pub async fn move_into_downloads(&self, source: &Path, file_name: &str) -> Result<PathBuf> {
        let destination = self.downloads_dir.join(file_name);
        self.safe_move(source, &destination).await?;
        Ok(destination)
    }

    async fn try_move(source: &Path, destination: &Path) -> Result<()> {
        if Self::file_exists(destination).await {
            Self::delete_once(destination).await?;
        }

        if let Some(parent) = destination.parent() {
            Self::ensure_directory_exists(parent).await?;
        }

        if fs::rename(source, destination).await.is_ok() {
            return Ok(());
        }

        // Cross-device: copy then remove the original
        Self::copy_recursive(source, destination).await?;
        Self::delete_once(source).await
    }

    fn copy_recursive<'a>(source: &'a Path, destination: &'a Path) -> BoxedIo<'a, ()> {
        Box::pin(async move {
            let metadata = fs::metadata(source).await?;
            if !metadata.is_dir() {
                fs::copy(source, destination).await?;
                return Ok(());
            }

            fs::create_dir_all(destination).await?;
            let mut entries = fs::read_dir(source).await?;
            while let Some(entry) = entries.next_entry().await? {
                let target = destination.join(entry.file_name());
                Self::copy_recursive(&entry.path(), &target).await?;
            }
            Ok(())
        })
    }

    /// Safe delete operation with retry; missing paths are not an error
    pub async fn safe_delete(path: &Path) -> Result<()> {
        let mut attempts = 0;

        loop {
            attempts += 1;

            match Self::delete_once(path).await {
                Ok(()) => return Ok(()),
                Err(e) if attempts >= MAX_RETRY_ATTEMPTS => {
                    return Err(ShelfError::FileIoError(format!(
                        "Failed to delete after {} attempts: {}: {}",
                        MAX_RETRY_ATTEMPTS,
                        path.display(),
                        e
                    )));
                }
                Err(_) => sleep(RETRY_DELAY).await,
            }
        }
    }

    async fn delete_once(path: &Path) -> Result<()> {
        let metadata = match fs::symlink_metadata(path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let result = if metadata.is_dir() {
            fs::remove_dir_all(path).await
        } else {
            fs::remove_file(path).await
        };

        match result {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ShelfError::FileIoError(format!(
                "Delete failed: {}: {}",
                path.display(),
                e
            ))),
        }
    }

    /// Ensure directory exists, creating parent directories as needed
    pub async fn ensure_directory_exists(path: &Path) -> Result<()> {
        if Self::file_exists(path).await {
            return Ok(());
        }

        fs::create_dir_all(path).await.map_err(|e| {
            ShelfError::FileIoError(format!(
                "Failed to create directory {}: {}",
                path.display(),
                e
            ))
        })
    }

    pub async fn file_exists(path: &Path) -> bool {
        fs::try_exists(path).await.unwrap_or(false)
    }

    /// Bytes on disk; directories are summed recursively, missing paths count as 0
    pub fn size_on_disk(path: &Path) -> BoxedIo<'_, u64> {
        Box::pin(async move {
            let metadata = match fs::metadata(path).await {
                Ok(metadata) => metadata,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
                Err(e) => return Err(e.into()),
            };

            if !metadata.is_dir() {
                return Ok(metadata.len());
            }

            let mut total = 0;
            let mut entries = fs::read_dir(path).await?;
            while let Some(entry) = entries.next_entry().await? {
                total += Self::size_on_disk(&entry.path()).await?;
            }
            Ok(total)
        })
    }
}
