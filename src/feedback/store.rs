//! Learning Store - 피드백 학습 상태 저장소 (SQLite)
//!
//! 테이블:
//! - chunk_adjustments: 프래그먼트별 adjustment
//! - query_mappings: 긍정 피드백으로 학습한 쿼리→프래그먼트 매핑
//! - query_feedback: 쿼리별 플래그 상태와 부정 카운터
//! - flagged_queries: 플래그 감사 기록 (삭제하지 않음)
//! - processed_events: 적용된 이벤트 ID (멱등성)

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};

use super::{
    AdjustmentRecord, FlagState, FlaggedQuery, LearnerStats, QueryChunkMapping,
    QueryFeedbackState,
};
use crate::knowledge::{open_connection, parse_datetime};
use crate::scoring::{FragmentId, Polarity};

fn parse_optional(s: Option<String>) -> Option<DateTime<Utc>> {
    s.as_deref().map(parse_datetime)
}

pub struct LearningStore {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl LearningStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = open_connection(path)?;
        let store = Self {
            conn: Mutex::new(conn),
            db_path: path.to_path_buf(),
        };
        store.initialize()?;
        Ok(store)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))
    }

    /// `f`의 모든 쓰기를 한 트랜잭션으로 커밋
    ///
    /// `f`가 실패하면 전부 롤백됩니다. `after_commit`은 커밋 직후, 연결 락을
    /// 쥔 채로 실행되므로 메모리 상태 반영이 다른 쓰기와 섞이지 않습니다.
    pub fn write_transaction<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> Result<T>,
        after_commit: impl FnOnce(&T),
    ) -> Result<T> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().context("Failed to begin transaction")?;
        let value = f(&tx)?;
        tx.commit().context("Failed to commit learning transaction")?;
        after_commit(&value);
        Ok(value)
    }

    fn initialize(&self) -> Result<()> {
        let conn = self.lock()?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS chunk_adjustments (
                fragment_id INTEGER PRIMARY KEY,
                adjustment REAL NOT NULL DEFAULT 0.0,
                positive_count INTEGER NOT NULL DEFAULT 0,
                negative_count INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS query_mappings (
                query_key TEXT NOT NULL,
                query TEXT NOT NULL,
                fragment_id INTEGER NOT NULL,
                weight INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                last_used TEXT NOT NULL,
                PRIMARY KEY (query_key, fragment_id)
            );

            CREATE TABLE IF NOT EXISTS query_feedback (
                query_key TEXT PRIMARY KEY,
                query TEXT NOT NULL,
                state TEXT NOT NULL,
                negative_count INTEGER NOT NULL DEFAULT 0,
                window_start TEXT,
                last_negative_at TEXT
            );

            CREATE TABLE IF NOT EXISTS flagged_queries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                query_key TEXT NOT NULL,
                query TEXT NOT NULL,
                negative_count INTEGER NOT NULL,
                flagged_at TEXT NOT NULL,
                reason TEXT NOT NULL,
                resolved_at TEXT
            );

            CREATE TABLE IF NOT EXISTS processed_events (
                event_id TEXT PRIMARY KEY,
                query_key TEXT NOT NULL,
                applied_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_flagged_query_key ON flagged_queries(query_key);",
        )
        .context("Failed to create learning tables")?;

        tracing::debug!("Learning store initialized at {:?}", self.db_path);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------------

    pub fn is_processed(&self, event_id: &str) -> Result<bool> {
        let conn = self.lock()?;
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM processed_events WHERE event_id = ?1",
                params![event_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// 이벤트 ID 기록. 이미 있으면 false
    pub fn claim_event(
        conn: &Connection,
        event_id: &str,
        query_key: &str,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO processed_events (event_id, query_key, applied_at)
                 VALUES (?1, ?2, ?3)",
                params![event_id, query_key, at.to_rfc3339()],
            )
            .context("Failed to record event id")?;
        Ok(inserted == 1)
    }

    // ------------------------------------------------------------------------
    // Adjustments
    // ------------------------------------------------------------------------

    fn row_to_adjustment(row: &Row<'_>) -> rusqlite::Result<AdjustmentRecord> {
        Ok(AdjustmentRecord {
            fragment_id: row.get(0)?,
            adjustment: row.get(1)?,
            positive_count: row.get(2)?,
            negative_count: row.get(3)?,
            updated_at: parse_datetime(&row.get::<_, String>(4)?),
        })
    }

    pub fn load_adjustments(&self) -> Result<Vec<AdjustmentRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT fragment_id, adjustment, positive_count, negative_count, updated_at
             FROM chunk_adjustments ORDER BY fragment_id",
        )?;
        let records = stmt
            .query_map([], Self::row_to_adjustment)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to load adjustments")?;
        Ok(records)
    }

    pub fn save_adjustment(
        conn: &Connection,
        fragment_id: FragmentId,
        adjustment: f64,
        polarity: Polarity,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let (pos, neg) = match polarity {
            Polarity::Positive => (1, 0),
            Polarity::Negative => (0, 1),
        };

        conn.execute(
            "INSERT INTO chunk_adjustments
             (fragment_id, adjustment, positive_count, negative_count, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(fragment_id) DO UPDATE SET
                adjustment = excluded.adjustment,
                positive_count = positive_count + excluded.positive_count,
                negative_count = negative_count + excluded.negative_count,
                updated_at = excluded.updated_at",
            params![fragment_id, adjustment, pos, neg, at.to_rfc3339()],
        )
        .context("Failed to save adjustment")?;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Mappings
    // ------------------------------------------------------------------------

    fn row_to_mapping(row: &Row<'_>) -> rusqlite::Result<QueryChunkMapping> {
        Ok(QueryChunkMapping {
            query_key: row.get(0)?,
            query: row.get(1)?,
            fragment_id: row.get(2)?,
            weight: row.get(3)?,
            created_at: parse_datetime(&row.get::<_, String>(4)?),
            last_used: parse_datetime(&row.get::<_, String>(5)?),
        })
    }

    /// 매핑 생성 또는 강화. 새 가중치 반환
    pub fn strengthen_mapping(
        conn: &Connection,
        query_key: &str,
        query: &str,
        fragment_id: FragmentId,
        at: DateTime<Utc>,
    ) -> Result<u32> {
        let now = at.to_rfc3339();

        conn.execute(
            "INSERT INTO query_mappings (query_key, query, fragment_id, weight, created_at, last_used)
             VALUES (?1, ?2, ?3, 1, ?4, ?4)
             ON CONFLICT(query_key, fragment_id) DO UPDATE SET
                weight = weight + 1,
                last_used = excluded.last_used",
            params![query_key, query, fragment_id, now],
        )
        .context("Failed to learn query mapping")?;

        let weight = conn.query_row(
            "SELECT weight FROM query_mappings WHERE query_key = ?1 AND fragment_id = ?2",
            params![query_key, fragment_id],
            |row| row.get(0),
        )?;
        Ok(weight)
    }

    pub fn mappings_for(&self, query_key: &str) -> Result<Vec<QueryChunkMapping>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT query_key, query, fragment_id, weight, created_at, last_used
             FROM query_mappings WHERE query_key = ?1
             ORDER BY weight DESC, fragment_id ASC",
        )?;
        let mappings = stmt
            .query_map(params![query_key], Self::row_to_mapping)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(mappings)
    }

    pub fn all_mappings(&self) -> Result<Vec<QueryChunkMapping>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT query_key, query, fragment_id, weight, created_at, last_used
             FROM query_mappings ORDER BY query_key, fragment_id",
        )?;
        let mappings = stmt
            .query_map([], Self::row_to_mapping)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(mappings)
    }

    // ------------------------------------------------------------------------
    // Query state & flags
    // ------------------------------------------------------------------------

    pub fn load_query_state(&self, query_key: &str) -> Result<Option<QueryFeedbackState>> {
        let conn = self.lock()?;
        let state = conn
            .query_row(
                "SELECT query_key, query, state, negative_count, window_start, last_negative_at
                 FROM query_feedback WHERE query_key = ?1",
                params![query_key],
                |row| {
                    Ok(QueryFeedbackState {
                        query_key: row.get(0)?,
                        query: row.get(1)?,
                        state: FlagState::from_db(&row.get::<_, String>(2)?),
                        negative_count: row.get(3)?,
                        window_start: parse_optional(row.get(4)?),
                        last_negative_at: parse_optional(row.get(5)?),
                    })
                },
            )
            .optional()
            .context("Failed to read query feedback state")?;
        Ok(state)
    }

    pub fn save_query_state(conn: &Connection, state: &QueryFeedbackState) -> Result<()> {
        conn.execute(
            "INSERT OR REPLACE INTO query_feedback
             (query_key, query, state, negative_count, window_start, last_negative_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                state.query_key,
                state.query,
                state.state.as_str(),
                state.negative_count,
                state.window_start.map(|t| t.to_rfc3339()),
                state.last_negative_at.map(|t| t.to_rfc3339()),
            ],
        )
        .context("Failed to save query feedback state")?;
        Ok(())
    }

    pub fn insert_flag(conn: &Connection, flag: &FlaggedQuery) -> Result<i64> {
        conn.execute(
            "INSERT INTO flagged_queries (query_key, query, negative_count, flagged_at, reason, resolved_at)
             VALUES (?1, ?2, ?3, ?4, ?5, NULL)",
            params![
                flag.query_key,
                flag.query,
                flag.negative_count,
                flag.flagged_at.to_rfc3339(),
                flag.reason,
            ],
        )
        .context("Failed to insert flagged query")?;
        Ok(conn.last_insert_rowid())
    }

    /// 미해결 플래그를 해결 처리. 바뀐 행 수 반환
    pub fn resolve_flags(conn: &Connection, query_key: &str, at: DateTime<Utc>) -> Result<usize> {
        let changed = conn
            .execute(
                "UPDATE flagged_queries SET resolved_at = ?2
                 WHERE query_key = ?1 AND resolved_at IS NULL",
                params![query_key, at.to_rfc3339()],
            )
            .context("Failed to resolve flagged query")?;
        Ok(changed)
    }

    pub fn flagged_queries(&self, include_resolved: bool) -> Result<Vec<FlaggedQuery>> {
        let conn = self.lock()?;
        let sql = if include_resolved {
            "SELECT id, query_key, query, negative_count, flagged_at, reason, resolved_at
             FROM flagged_queries ORDER BY id DESC"
        } else {
            "SELECT id, query_key, query, negative_count, flagged_at, reason, resolved_at
             FROM flagged_queries WHERE resolved_at IS NULL ORDER BY id DESC"
        };

        let mut stmt = conn.prepare(sql)?;
        let flags = stmt
            .query_map([], |row| {
                Ok(FlaggedQuery {
                    id: row.get(0)?,
                    query_key: row.get(1)?,
                    query: row.get(2)?,
                    negative_count: row.get(3)?,
                    flagged_at: parse_datetime(&row.get::<_, String>(4)?),
                    reason: row.get(5)?,
                    resolved_at: parse_optional(row.get(6)?),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(flags)
    }

    // ------------------------------------------------------------------------
    // Stats
    // ------------------------------------------------------------------------

    pub fn stats(&self) -> Result<LearnerStats> {
        let conn = self.lock()?;

        let (adjusted, boosted, penalized): (i64, i64, i64) = conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(CASE WHEN adjustment > 0 THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN adjustment < 0 THEN 1 ELSE 0 END), 0)
             FROM chunk_adjustments",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;

        let (active, resolved): (i64, i64) = conn.query_row(
            "SELECT COALESCE(SUM(CASE WHEN resolved_at IS NULL THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN resolved_at IS NOT NULL THEN 1 ELSE 0 END), 0)
             FROM flagged_queries",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let (queries, mappings, signals): (i64, i64, i64) = conn.query_row(
            "SELECT COUNT(DISTINCT query_key), COUNT(*), COALESCE(SUM(weight), 0)
             FROM query_mappings",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;

        let events: i64 =
            conn.query_row("SELECT COUNT(*) FROM processed_events", [], |row| row.get(0))?;

        Ok(LearnerStats {
            adjusted_fragments: adjusted as usize,
            boosted_fragments: boosted as usize,
            penalized_fragments: penalized as usize,
            active_flags: active as usize,
            resolved_flags: resolved as usize,
            mapped_queries: queries as usize,
            total_mappings: mappings as usize,
            total_positive_signals: signals as u64,
            processed_events: events as usize,
        })
    }
}
