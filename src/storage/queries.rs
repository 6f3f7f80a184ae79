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

//! Key-value queries
//!
//! Every write replaces the whole value for a key. There are no partial updates.

use crate::error::Result;
use chrono::Utc;
use serde::{de::DeserializeOwned, Serialize};
use sqlx::SqlitePool;

// ============================================================================
// RAW VALUES
// ============================================================================

pub async fn get_value(pool: &SqlitePool, key: &str) -> Result<Option<String>> {
    let value: Option<String> = sqlx::query_scalar("SELECT value FROM KeyValueStore WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await?;

    Ok(value)
}

/// Insert or replace a value
pub async fn set_value(pool: &SqlitePool, key: &str, value: &str) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO KeyValueStore (key, value, updated_at)
        VALUES (?, ?, ?)
        ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
        "#,
    )
    .bind(key)
    .bind(value)
    .bind(Utc::now().to_rfc3339())
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn delete_value(pool: &SqlitePool, key: &str) -> Result<()> {
    sqlx::query("DELETE FROM KeyValueStore WHERE key = ?")
        .bind(key)
        .execute(pool)
        .await?;

    Ok(())
}

// ============================================================================
// JSON VALUES
// ============================================================================

/// Encode `value` as JSON and store it under `key`
pub async fn set_json<T: Serialize + ?Sized>(pool: &SqlitePool, key: &str, value: &T) -> Result<()> {
    let json = serde_json::to_string(value)?;
    set_value(pool, key, &json).await
}

/// Decode the JSON stored under `key`.
///
/// A missing key is `Ok(None)`; a corrupt value is an error so callers can decide how
/// to degrade.
pub async fn get_json<T: DeserializeOwned>(pool: &SqlitePool, key: &str) -> Result<Option<T>> {
    match get_value(pool, key).await? {
        Some(json) => Ok(Some(serde_json::from_str(&json)?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Database;

    #[tokio::test]
    async fn test_set_get_replace_delete() {
        let db = Database::new_in_memory().await.unwrap();
        let pool = db.pool();

        assert_eq!(get_value(pool, "k").await.unwrap(), None);

        set_value(pool, "k", "one").await.unwrap();
        set_value(pool, "k", "two").await.unwrap();
        assert_eq!(get_value(pool, "k").await.unwrap().as_deref(), Some("two"));

        delete_value(pool, "k").await.unwrap();
        assert_eq!(get_value(pool, "k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_corrupt_json_is_an_error() {
        let db = Database::new_in_memory().await.unwrap();
        set_value(db.pool(), "list", "{not json").await.unwrap();

        let result: Result<Option<Vec<String>>> = get_json(db.pool(), "list").await;
        assert!(result.is_err());
    }
}
