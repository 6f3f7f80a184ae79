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

//! Downloads directory scanner
//!
//! Used to relocate assets whose recorded path went stale (the app container path
//! changes between installs and restores). Packages (`.movpkg` directories) are
//! matched by name and never descended into.

use crate::error::{Result, ShelfError};
use crate::file::paths::{is_subtitle_for, SEGMENTED_EXTENSION};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use tokio::fs;

type ScanFuture<'a> = Pin<Box<dyn Future<Output = Result<Option<PathBuf>>> + Send + 'a>>;

/// Scanner over the persistent downloads directory
#[derive(Debug, Clone)]
pub struct DownloadsScanner {
    root: PathBuf,
}

impl DownloadsScanner {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Find an entry whose file name equals `file_name`
    pub async fn find_by_name(&self, file_name: &str) -> Result<Option<PathBuf>> {
        if !self.root_exists().await {
            return Ok(None);
        }
        let wanted = file_name.to_string();
        Self::scan_recursive(&self.root, &move |name: &str| name == wanted).await
    }

    /// Find `subtitle-<asset_id>.*`
    pub async fn find_subtitle(&self, asset_id: &str) -> Result<Option<PathBuf>> {
        if !self.root_exists().await {
            return Ok(None);
        }
        let id = asset_id.to_string();
        Self::scan_recursive(&self.root, &move |name: &str| is_subtitle_for(name, &id)).await
    }

    async fn root_exists(&self) -> bool {
        fs::metadata(&self.root)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }

    /// Depth-first search, first match wins
    fn scan_recursive<'a>(
        dir: &'a Path,
        matches: &'a (dyn Fn(&str) -> bool + Send + Sync),
    ) -> ScanFuture<'a> {
        Box::pin(async move {
            let mut entries = fs::read_dir(dir).await.map_err(|e| {
                ShelfError::FileIoError(format!(
                    "Failed to read directory {}: {}",
                    dir.display(),
                    e
                ))
            })?;

            let mut subdirs = Vec::new();
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let name = entry.file_name().to_string_lossy().to_string();

                if matches(&name) {
                    return Ok(Some(path));
                }

                let is_package = path
                    .extension()
                    .is_some_and(|ext| ext == SEGMENTED_EXTENSION);
                if !is_package && entry.file_type().await?.is_dir() {
                    subdirs.push(path);
                }
            }

            for subdir in subdirs {
                if let Some(found) = Self::scan_recursive(&subdir, matches).await? {
                    return Ok(Some(found));
                }
            }

            Ok(None)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_find_by_name_in_nested_directory() {
        let temp = TempDir::new().unwrap();
        let nested = temp.path().join("restored");
        fs::create_dir_all(&nested).await.unwrap();
        fs::write(nested.join("Movie-1.mp4"), b"x").await.unwrap();

        let scanner = DownloadsScanner::new(temp.path().to_path_buf());
        let found = scanner.find_by_name("Movie-1.mp4").await.unwrap();
        assert_eq!(found, Some(nested.join("Movie-1.mp4")));
        assert_eq!(scanner.find_by_name("Other.mp4").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_packages_match_but_are_not_descended() {
        let temp = TempDir::new().unwrap();
        let package = temp.path().join("Show-1.movpkg");
        fs::create_dir_all(&package).await.unwrap();
        fs::write(package.join("segment-0.ts"), b"x").await.unwrap();

        let scanner = DownloadsScanner::new(temp.path().to_path_buf());
        assert_eq!(scanner.find_by_name("Show-1.movpkg").await.unwrap(), Some(package));
        assert_eq!(scanner.find_by_name("segment-0.ts").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_find_subtitle_any_extension() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("subtitle-abc.srt"), b"1").await.unwrap();

        let scanner = DownloadsScanner::new(temp.path().to_path_buf());
        assert_eq!(
            scanner.find_subtitle("abc").await.unwrap(),
            Some(temp.path().join("subtitle-abc.srt"))
        );
        assert_eq!(scanner.find_subtitle("ab").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_missing_root_finds_nothing() {
        let scanner = DownloadsScanner::new(PathBuf::from("/nonexistent/streamshelf"));
        assert_eq!(scanner.find_by_name("a.mp4").await.unwrap(), None);
    }
}
