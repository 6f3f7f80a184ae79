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

//! Quality preference resolution
//!
//! Two independent preferences are kept, one per network class. The caller decides
//! which class is active and passes the matching preference to
//! [`find_closest_quality`].
//!
//! # Fallback chain
//! 1. Exact label (`"1080p"` matches `"1080p (FHD)"`)
//! 2. `"Auto"` -> the adaptive entry
//! 3. `"Data Saver"` -> the lowest resolution
//! 4. Closest height to the numeric preference (ties go to the higher resolution)
//! 5. The last quality the user actually played
//! 6. The first available variant

use crate::error::Result;
use crate::storage::queries;
use crate::stream::manifest::{QualityVariant, AUTO_LABEL};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

pub const DATA_SAVER_LABEL: &str = "Data Saver";

const WIFI_KEY: &str = "videoQualityWiFi";
const CELLULAR_KEY: &str = "videoQualityCellular";
const LAST_USED_KEY: &str = "lastUsedQuality";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkClass {
    Wifi,
    Cellular,
}

/// Persisted quality preferences
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityPreferences {
    pub wifi: String,
    pub cellular: String,
    pub last_used: Option<String>,
}

impl Default for QualityPreferences {
    fn default() -> Self {
        Self {
            wifi: AUTO_LABEL.to_string(),
            cellular: "480p".to_string(),
            last_used: None,
        }
    }
}

impl QualityPreferences {
    pub fn preferred_for(&self, network: NetworkClass) -> &str {
        match network {
            NetworkClass::Wifi => &self.wifi,
            NetworkClass::Cellular => &self.cellular,
        }
    }

    pub fn set_preferred(&mut self, network: NetworkClass, label: impl Into<String>) {
        match network {
            NetworkClass::Wifi => self.wifi = label.into(),
            NetworkClass::Cellular => self.cellular = label.into(),
        }
    }

    /// Resolve the variant to play on `network`
    pub fn select<'a>(&self, network: NetworkClass, available: &'a [QualityVariant]) -> Option<&'a QualityVariant> {
        find_closest_quality(self.preferred_for(network), available, self.last_used.as_deref())
    }

    /// Load from the key-value store; missing keys keep their defaults
    pub async fn load(pool: &SqlitePool) -> Result<Self> {
        let mut prefs = Self::default();
        if let Some(wifi) = queries::get_value(pool, WIFI_KEY).await? {
            prefs.wifi = wifi;
        }
        if let Some(cellular) = queries::get_value(pool, CELLULAR_KEY).await? {
            prefs.cellular = cellular;
        }
        prefs.last_used = queries::get_value(pool, LAST_USED_KEY).await?;
        Ok(prefs)
    }

    pub async fn save(&self, pool: &SqlitePool) -> Result<()> {
        queries::set_value(pool, WIFI_KEY, &self.wifi).await?;
        queries::set_value(pool, CELLULAR_KEY, &self.cellular).await?;
        match &self.last_used {
            Some(label) => queries::set_value(pool, LAST_USED_KEY, label).await?,
            None => queries::delete_value(pool, LAST_USED_KEY).await?,
        }
        Ok(())
    }

    /// Remember the quality the player ended up using
    pub async fn record_last_used(&mut self, pool: &SqlitePool, label: &str) -> Result<()> {
        self.last_used = Some(label.to_string());
        queries::set_value(pool, LAST_USED_KEY, label).await
    }
}

/// Leading number of a label such as `"1080p (FHD)"` or `"720"`
pub fn parse_height(label: &str) -> Option<u32> {
    let digits: String = label
        .trim()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

fn label_matches(variant: &QualityVariant, preferred: &str) -> bool {
    let label = variant.label.to_ascii_lowercase();
    let preferred = preferred.trim().to_ascii_lowercase();
    if label == preferred {
        return true;
    }
    // "1080p" against "1080p (FHD)"
    label
        .strip_prefix(&preferred)
        .is_some_and(|rest| rest.starts_with(' '))
}

/// Pick the variant closest to `preferred`; `None` only when `available` is empty.
pub fn find_closest_quality<'a>(
    preferred: &str,
    available: &'a [QualityVariant],
    last_used: Option<&str>,
) -> Option<&'a QualityVariant> {
    if available.is_empty() {
        return None;
    }

    if let Some(exact) = available.iter().find(|v| label_matches(v, preferred)) {
        return Some(exact);
    }

    let resolutions = || available.iter().filter(|v| v.height.is_some());

    if preferred.eq_ignore_ascii_case(DATA_SAVER_LABEL) {
        if let Some(lowest) = resolutions().min_by_key(|v| v.height) {
            return Some(lowest);
        }
    }

    if let Some(target) = parse_height(preferred) {
        // min_by_key keeps the first minimum, so iterate highest first for ties
        let mut sorted: Vec<&QualityVariant> = resolutions().collect();
        sorted.sort_by(|a, b| b.height.cmp(&a.height));
        if let Some(closest) = sorted
            .into_iter()
            .min_by_key(|v| v.height.unwrap_or(0).abs_diff(target))
        {
            return Some(closest);
        }
    }

    if let Some(last) = last_used {
        if let Some(previous) = available.iter().find(|v| label_matches(v, last)) {
            return Some(previous);
        }
    }

    available.first()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Database;

    fn variant(label: &str, height: Option<u32>) -> QualityVariant {
        QualityVariant {
            label: label.to_string(),
            url: format!("https://cdn.example.com/{}.m3u8", label),
            height,
        }
    }

    fn sample() -> Vec<QualityVariant> {
        vec![
            variant("Auto", None),
            variant("1080p (FHD)", Some(1080)),
            variant("720p (HD)", Some(720)),
            variant("480p (SD)", Some(480)),
        ]
    }

    #[test]
    fn test_exact_label() {
        let available = sample();
        assert_eq!(find_closest_quality("720p", &available, None).unwrap().label, "720p (HD)");
        assert_eq!(find_closest_quality("auto", &available, None).unwrap().label, "Auto");
    }

    #[test]
    fn test_numeric_proximity() {
        let available = sample();
        assert_eq!(find_closest_quality("1440p", &available, None).unwrap().height, Some(1080));
        assert_eq!(find_closest_quality("360p", &available, None).unwrap().height, Some(480));
        // 600 is 120 from both 720 and 480
        assert_eq!(find_closest_quality("600p", &available, None).unwrap().height, Some(720));
    }

    #[test]
    fn test_data_saver_picks_lowest() {
        let available = sample();
        assert_eq!(find_closest_quality("Data Saver", &available, None).unwrap().height, Some(480));
    }

    #[test]
    fn test_fallbacks() {
        let auto_only = vec![variant("Auto", None)];
        assert_eq!(find_closest_quality("1080p", &auto_only, None).unwrap().label, "Auto");

        let available = sample();
        assert_eq!(
            find_closest_quality("Best", &available, Some("480p (SD)")).unwrap().label,
            "480p (SD)"
        );
        assert_eq!(find_closest_quality("Best", &available, None).unwrap().label, "Auto");
        assert!(find_closest_quality("1080p", &[], Some("720p")).is_none());
    }

    #[test]
    fn test_preference_per_network() {
        let mut prefs = QualityPreferences::default();
        prefs.set_preferred(NetworkClass::Wifi, "1080p");
        let available = sample();

        assert_eq!(prefs.select(NetworkClass::Wifi, &available).unwrap().height, Some(1080));
        assert_eq!(prefs.select(NetworkClass::Cellular, &available).unwrap().height, Some(480));
    }

    #[tokio::test]
    async fn test_preferences_round_trip_through_store() {
        let db = Database::new_in_memory().await.unwrap();

        let mut prefs = QualityPreferences::load(db.pool()).await.unwrap();
        assert_eq!(prefs, QualityPreferences::default());

        prefs.set_preferred(NetworkClass::Cellular, "Data Saver");
        prefs.save(db.pool()).await.unwrap();
        prefs.record_last_used(db.pool(), "720p (HD)").await.unwrap();

        let loaded = QualityPreferences::load(db.pool()).await.unwrap();
        assert_eq!(loaded.cellular, "Data Saver");
        assert_eq!(loaded.last_used.as_deref(), Some("720p (HD)"));
    }
}
