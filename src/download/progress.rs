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

//! Download progress normalization and reporting
//!
//! # Progress Information
//! - Segmented: loaded media time over expected duration
//! - Direct: received bytes over expected bytes
//! - Both are clamped to `[0, 1]` and never decrease for a given download
//!
//! Reporting is debounced: a value is forwarded when it is the first one, when it
//! moved by at least the threshold since the last report, or when it reaches 1.0.

use serde::{Deserialize, Serialize};

/// Default minimum change between two reports (0.5 %)
pub const DEFAULT_PROGRESS_THRESHOLD: f64 = 0.005;

/// Download status enum representing the lifecycle of a download
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    /// Waiting for a slot
    Queued,
    /// Transport running
    Downloading,
    /// Persisted as an asset
    Completed,
    /// Cancelled by user
    Cancelled,
    /// Transport or persistence failed
    Failed,
}

impl DownloadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadStatus::Queued => "queued",
            DownloadStatus::Downloading => "downloading",
            DownloadStatus::Completed => "completed",
            DownloadStatus::Cancelled => "cancelled",
            DownloadStatus::Failed => "failed",
        }
    }
}

/// A loaded range of media time, in seconds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: f64,
    pub duration: f64,
}

impl TimeRange {
    pub fn new(start: f64, duration: f64) -> Self {
        Self { start, duration }
    }
}

fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// `sum(loaded durations) / expected`; 0 when the expected duration is unknown
pub fn segmented_progress(loaded: &[TimeRange], expected_duration: f64) -> f64 {
    if expected_duration <= 0.0 {
        return 0.0;
    }
    let loaded: f64 = loaded.iter().map(|r| r.duration.max(0.0)).sum();
    clamp_unit(loaded / expected_duration)
}

/// `received / expected`; 0 when the total size is unknown
pub fn byte_progress(received: u64, expected: Option<u64>) -> f64 {
    match expected {
        Some(total) if total > 0 => clamp_unit(received as f64 / total as f64),
        _ => 0.0,
    }
}

/// Tracks one download's progress and decides which updates are reported
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    current: f64,
    last_reported: Option<f64>,
    threshold: f64,
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new(DEFAULT_PROGRESS_THRESHOLD)
    }
}

impl ProgressReporter {
    pub fn new(threshold: f64) -> Self {
        Self {
            current: 0.0,
            last_reported: None,
            threshold,
        }
    }

    pub fn current(&self) -> f64 {
        self.current
    }

    /// Record a new value; returns the value to report, if any
    ///
    /// Values below the current one are ignored.
    pub fn update(&mut self, value: f64) -> Option<f64> {
        let value = clamp_unit(value).max(self.current);
        self.current = value;

        let report = match self.last_reported {
            None => true,
            Some(last) if last >= 1.0 => false,
            Some(_) if value >= 1.0 => true,
            Some(last) => value - last >= self.threshold,
        };

        if report {
            self.last_reported = Some(value);
            Some(value)
        } else {
            None
        }
    }

    /// Force progress to 1.0; returns `Some(1.0)` unless that was already reported
    pub fn finish(&mut self) -> Option<f64> {
        self.current = 1.0;
        if self.last_reported.is_some_and(|last| last >= 1.0) {
            return None;
        }
        self.last_reported = Some(1.0);
        Some(1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segmented_progress() {
        let ranges = [TimeRange::new(0.0, 30.0), TimeRange::new(30.0, 15.0)];
        assert!((segmented_progress(&ranges, 90.0) - 0.5).abs() < 1e-9);
        assert_eq!(segmented_progress(&ranges, 0.0), 0.0);
        assert_eq!(segmented_progress(&ranges, 10.0), 1.0);
    }

    #[test]
    fn test_byte_progress() {
        assert_eq!(byte_progress(50, Some(200)), 0.25);
        assert_eq!(byte_progress(50, None), 0.0);
        assert_eq!(byte_progress(500, Some(200)), 1.0);
    }

    #[test]
    fn test_debounce() {
        let mut reporter = ProgressReporter::default();
        assert_eq!(reporter.update(0.001), Some(0.001));
        assert_eq!(reporter.update(0.004), None);
        assert_eq!(reporter.update(0.007), Some(0.007));
        assert_eq!(reporter.update(0.0075), None);
        assert_eq!(reporter.update(1.0), Some(1.0));
        assert_eq!(reporter.update(1.0), None);
        assert_eq!(reporter.finish(), None);
    }

    #[test]
    fn test_never_decreases() {
        let mut reporter = ProgressReporter::default();
        reporter.update(0.5);
        assert_eq!(reporter.update(0.2), None);
        assert_eq!(reporter.current(), 0.5);
    }

    #[test]
    fn test_finish_reports_once() {
        let mut reporter = ProgressReporter::default();
        reporter.update(0.9);
        assert_eq!(reporter.finish(), Some(1.0));
        assert_eq!(reporter.finish(), None);
    }

    #[test]
    fn test_status_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&DownloadStatus::Queued).unwrap(), "\"queued\"");
        assert_eq!(DownloadStatus::Cancelled.as_str(), "cancelled");
    }
}
