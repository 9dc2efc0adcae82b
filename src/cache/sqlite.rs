//! SQLite 캐시 저장소
//!
//! 재시작 후에도 캐시가 유지됩니다. 시각은 밀리초 정수로 저장합니다.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{CacheBackend, CacheEntry, CacheKey, CacheStats, CachedAnswer};
use crate::knowledge::open_connection;

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

/// SQLite 기반 캐시 저장소
pub struct SqliteCacheBackend {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl SqliteCacheBackend {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = open_connection(path)?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS response_cache (
                cache_key TEXT PRIMARY KEY,
                query_key TEXT NOT NULL,
                query TEXT NOT NULL,
                answer TEXT NOT NULL,
                fragment_ids TEXT NOT NULL,
                created_at_ms INTEGER NOT NULL,
                expires_at_ms INTEGER NOT NULL,
                invalidated_at_ms INTEGER,
                hit_count INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_cache_query_key ON response_cache(query_key);
            CREATE INDEX IF NOT EXISTS idx_cache_expires ON response_cache(expires_at_ms);",
        )
        .context("Failed to create response_cache table")?;

        tracing::debug!("Cache store initialized at {:?}", path);

        Ok(Self {
            conn: Mutex::new(conn),
            db_path: path.to_path_buf(),
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))
    }

    fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<(CacheEntry, String)> {
        let fragment_ids: String = row.get(4)?;
        Ok((
            CacheEntry {
                key: CacheKey::from_raw(row.get::<_, String>(0)?),
                answer: CachedAnswer {
                    query_key: row.get(1)?,
                    query: row.get(2)?,
                    answer: row.get(3)?,
                    fragment_ids: vec![],
                },
                created_at: from_millis(row.get(5)?),
                expires_at: from_millis(row.get(6)?),
            },
            fragment_ids,
        ))
    }

    fn decode(raw: (CacheEntry, String)) -> Result<CacheEntry> {
        let (mut entry, fragment_ids) = raw;
        entry.answer.fragment_ids =
            serde_json::from_str(&fragment_ids).context("Corrupt fragment id list in cache")?;
        Ok(entry)
    }
}

const ENTRY_COLUMNS: &str =
    "cache_key, query_key, query, answer, fragment_ids, created_at_ms, expires_at_ms";

impl CacheBackend for SqliteCacheBackend {
    fn load(&self, key: &CacheKey, now: DateTime<Utc>) -> Result<Option<CacheEntry>> {
        let conn = self.lock()?;
        let now_ms = now.timestamp_millis();

        let raw = conn
            .query_row(
                &format!(
                    "SELECT {} FROM response_cache
                     WHERE cache_key = ?1 AND invalidated_at_ms IS NULL AND expires_at_ms > ?2",
                    ENTRY_COLUMNS
                ),
                params![key.as_str(), now_ms],
                Self::row_to_entry,
            )
            .optional()
            .context("Failed to read cache entry")?;

        let Some(raw) = raw else {
            return Ok(None);
        };

        conn.execute(
            "UPDATE response_cache SET hit_count = hit_count + 1 WHERE cache_key = ?1",
            params![key.as_str()],
        )
        .context("Failed to update hit count")?;

        Self::decode(raw).map(Some)
    }

    fn store(&self, entry: &CacheEntry) -> Result<()> {
        let conn = self.lock()?;
        let fragment_ids = serde_json::to_string(&entry.answer.fragment_ids)?;

        conn.execute(
            "INSERT OR REPLACE INTO response_cache
             (cache_key, query_key, query, answer, fragment_ids,
              created_at_ms, expires_at_ms, invalidated_at_ms, hit_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL, 0)",
            params![
                entry.key.as_str(),
                entry.answer.query_key,
                entry.answer.query,
                entry.answer.answer,
                fragment_ids,
                entry.created_at.timestamp_millis(),
                entry.expires_at.timestamp_millis(),
            ],
        )
        .context("Failed to store cache entry")?;

        Ok(())
    }

    fn invalidate(&self, key: &CacheKey, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE response_cache SET invalidated_at_ms = ?2
                 WHERE cache_key = ?1 AND invalidated_at_ms IS NULL",
                params![key.as_str(), now.timestamp_millis()],
            )
            .context("Failed to invalidate cache entry")?;
        Ok(changed > 0)
    }

    fn invalidate_query(&self, query_key: &str, now: DateTime<Utc>) -> Result<usize> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE response_cache SET invalidated_at_ms = ?2
                 WHERE query_key = ?1 AND invalidated_at_ms IS NULL",
                params![query_key, now.timestamp_millis()],
            )
            .context("Failed to invalidate cache entries for query")?;
        Ok(changed)
    }

    fn sweep(&self, now: DateTime<Utc>) -> Result<usize> {
        let conn = self.lock()?;
        let removed = conn
            .execute(
                "DELETE FROM response_cache WHERE expires_at_ms <= ?1",
                params![now.timestamp_millis()],
            )
            .context("Failed to sweep cache")?;
        Ok(removed)
    }

    fn clear(&self) -> Result<usize> {
        let conn = self.lock()?;
        let removed = conn
            .execute("DELETE FROM response_cache", [])
            .context("Failed to clear cache")?;
        Ok(removed)
    }

    fn stats(&self, now: DateTime<Utc>) -> Result<CacheStats> {
        let conn = self.lock()?;

        let (total, live, invalidated, hits): (i64, i64, i64, i64) = conn
            .query_row(
                "SELECT
                    COUNT(*),
                    COALESCE(SUM(CASE WHEN invalidated_at_ms IS NULL AND expires_at_ms > ?1 THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN invalidated_at_ms IS NOT NULL THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(hit_count), 0)
                 FROM response_cache",
                params![now.timestamp_millis()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .context("Failed to read cache stats")?;

        Ok(CacheStats {
            total_entries: total as usize,
            live_entries: live as usize,
            invalidated_entries: invalidated as usize,
            total_hits: hits as u64,
        })
    }

    fn recent(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<CacheEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM response_cache
             WHERE invalidated_at_ms IS NULL AND expires_at_ms > ?1
             ORDER BY created_at_ms DESC, cache_key ASC
             LIMIT ?2",
            ENTRY_COLUMNS
        ))?;

        let rows = stmt
            .query_map(params![now.timestamp_millis(), limit as i64], Self::row_to_entry)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to list cache entries")?;

        rows.into_iter().map(Self::decode).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_persists_across_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("cache.db");
        let now = DateTime::from_timestamp_millis(Utc::now().timestamp_millis()).unwrap();

        let entry = CacheEntry {
            key: CacheKey::from_raw("k1"),
            answer: CachedAnswer {
                query_key: "q1".into(),
                query: "what is x".into(),
                answer: "X is a consultancy".into(),
                fragment_ids: vec![3, 1],
            },
            created_at: now,
            expires_at: now + Duration::hours(1),
        };

        {
            let backend = SqliteCacheBackend::open(&path).unwrap();
            backend.store(&entry).unwrap();
        }

        let backend = SqliteCacheBackend::open(&path).unwrap();
        assert_eq!(backend.load(&entry.key, now).unwrap(), Some(entry.clone()));
        assert!(backend
            .load(&entry.key, now + Duration::hours(2))
            .unwrap()
            .is_none());
    }
}
