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

//! Core configuration
//!
//! # Directory Layout
//! - `<data_dir>/downloads` - persistent, app-private download directory. Survives
//!   app updates and is not the user-visible documents directory.
//! - `<data_dir>/tmp` - transport scratch space, emptied of stale files on startup
//! - `<data_dir>/streamshelf.db` - SQLite key-value store

use crate::error::{Result, ShelfError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the JSON config file inside the data directory
pub const CONFIG_FILE_NAME: &str = "config.json";

/// Download scheduling configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DownloadConfig {
    /// Maximum concurrent downloads
    pub max_concurrent_downloads: usize,

    /// Delay between starting items of one scheduler batch, multiplied by batch index
    pub stagger_delay_ms: u64,

    /// Re-check interval while the queue is waiting for a free slot
    pub poll_interval_ms: u64,

    /// Minimum progress delta before a progress event is broadcast
    pub progress_threshold: f64,

    /// Whole-request timeout for manifests, keys and subtitles
    pub request_timeout_secs: u64,

    /// Longest gap between two body chunks of a media transfer
    pub read_idle_timeout_secs: u64,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: 3,
            stagger_delay_ms: 100,
            poll_interval_ms: 1000,
            progress_threshold: 0.005,
            request_timeout_secs: 300,
            read_idle_timeout_secs: 60,
        }
    }
}

impl DownloadConfig {
    pub fn stagger_delay(&self) -> Duration {
        Duration::from_millis(self.stagger_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn read_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.read_idle_timeout_secs)
    }
}

/// Top-level configuration, usually read from `config.json` in the app container
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CoreConfig {
    /// Application support directory
    pub data_dir: PathBuf,

    /// tracing filter directive used when `RUST_LOG` is not set
    pub log_filter: String,

    pub download: DownloadConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("."),
            log_filter: "info".to_string(),
            download: DownloadConfig::default(),
        }
    }
}

impl CoreConfig {
    /// Configuration rooted at `data_dir` with default settings
    pub fn with_data_dir<P: Into<PathBuf>>(data_dir: P) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Load configuration from a JSON file, falling back to defaults if it doesn't exist
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let json = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json).map_err(|e| {
            ShelfError::ConfigurationError(format!("{}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load `<data_dir>/config.json`, writing the defaults there on first run
    ///
    /// The `data_dir` argument always replaces whatever the file stores.
    pub fn load_or_init(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join(CONFIG_FILE_NAME);
        if path.exists() {
            let mut config = Self::load(&path)?;
            config.data_dir = data_dir.to_path_buf();
            return Ok(config);
        }

        std::fs::create_dir_all(data_dir)?;
        let config = Self::with_data_dir(data_dir);
        config.save(&path)?;
        tracing::info!(path = %path.display(), "Wrote default configuration");
        Ok(config)
    }

    /// Write configuration as pretty JSON
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.download.max_concurrent_downloads == 0 {
            return Err(ShelfError::ConfigurationError(
                "max_concurrent_downloads must be at least 1".to_string(),
            ));
        }
        if self.download.request_timeout_secs == 0 || self.download.read_idle_timeout_secs == 0 {
            return Err(ShelfError::ConfigurationError(
                "timeouts must be at least one second".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.download.progress_threshold) {
            return Err(ShelfError::ConfigurationError(format!(
                "progress_threshold must be within 0..=1, got {}",
                self.download.progress_threshold
            )));
        }
        Ok(())
    }

    pub fn downloads_dir(&self) -> PathBuf {
        self.data_dir.join("downloads")
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.data_dir.join("tmp")
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("streamshelf.db")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = CoreConfig::default();
        assert_eq!(config.download.max_concurrent_downloads, 3);
        assert_eq!(config.download.stagger_delay(), Duration::from_millis(100));
        assert_eq!(config.download.poll_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let temp = TempDir::new().unwrap();
        let config = CoreConfig::load(&temp.path().join("nope.json")).unwrap();
        assert_eq!(config, CoreConfig::default());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.json");
        std::fs::write(&path, r#"{"download": {"max_concurrent_downloads": 5}}"#).unwrap();

        let config = CoreConfig::load(&path).unwrap();
        assert_eq!(config.download.max_concurrent_downloads, 5);
        assert_eq!(config.download.poll_interval_ms, 1000);
        assert_eq!(config.log_filter, "info");
    }

    #[test]
    fn test_load_or_init_writes_defaults_once() {
        let temp = TempDir::new().unwrap();
        let data_dir = temp.path().join("support");

        let first = CoreConfig::load_or_init(&data_dir).unwrap();
        assert_eq!(first.data_dir, data_dir);
        assert_eq!(first.download, DownloadConfig::default());
        assert!(data_dir.join(CONFIG_FILE_NAME).exists());

        // Edits to the written file are honored; the stored data_dir is not
        let mut edited = first.clone();
        edited.data_dir = PathBuf::from("/elsewhere");
        edited.download.max_concurrent_downloads = 1;
        edited.save(&data_dir.join(CONFIG_FILE_NAME)).unwrap();

        let second = CoreConfig::load_or_init(&data_dir).unwrap();
        assert_eq!(second.data_dir, data_dir);
        assert_eq!(second.download.max_concurrent_downloads, 1);
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let mut config = CoreConfig::default();
        config.download.read_idle_timeout_secs = 0;
        assert!(matches!(config.validate(), Err(ShelfError::ConfigurationError(_))));
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.json");
        std::fs::write(&path, r#"{"download": {"max_concurrent_downloads": 0}}"#).unwrap();

        assert!(matches!(
            CoreConfig::load(&path),
            Err(ShelfError::ConfigurationError(_))
        ));
    }
}
