//! Query Log - 검색 기록
//!
//! 엔진은 검색마다 `QueryRecord`를 남깁니다(append-only). 전체 응답에 대한
//! 피드백은 해당 쿼리 키의 가장 최근 기록으로 프래그먼트를 찾아냅니다.
//!
//! 평균 스코어가 낮은 쿼리와 자주 들어오는 쿼리는 지식 공백을 찾는 데 씁니다.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::knowledge::{open_connection, parse_datetime};
use crate::scoring::FragmentId;

/// 검색 한 건의 기록
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRecord {
    pub query: String,
    pub query_key: String,
    pub timestamp: DateTime<Utc>,
    /// 반환된 상위 프래그먼트 (순위 순)
    pub fragment_ids: Vec<FragmentId>,
    pub response_time_ms: u64,
    pub expanded_query: Option<String>,
    /// 프래그먼트별 최종 퓨전 스코어
    pub scores: Vec<f64>,
}

/// 쿼리 로그 통계
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryLogStats {
    pub total_queries: usize,
    pub unique_queries: usize,
    pub avg_response_time_ms: f64,
    pub empty_results: usize,
}

/// 자주 들어오는 쿼리 (쿼리 키 단위)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommonQuery {
    /// 가장 최근 원문
    pub query: String,
    pub query_key: String,
    pub count: usize,
    pub avg_score: f64,
}

/// 반환된 스코어의 평균 (결과가 없으면 0)
pub fn mean_score(scores: &[f64]) -> f64 {
    if scores.is_empty() {
        0.0
    } else {
        scores.iter().sum::<f64>() / scores.len() as f64
    }
}

/// 쿼리 로그 기록/조회
pub trait QueryLog: Send + Sync {
    fn record(&self, record: &QueryRecord) -> Result<()>;

    /// 쿼리 키의 가장 최근 기록
    fn latest_for_query(&self, query_key: &str) -> Result<Option<QueryRecord>>;
}

// ============================================================================
// SqliteQueryLog
// ============================================================================

/// SQLite 쿼리 로그
pub struct SqliteQueryLog {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl SqliteQueryLog {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = open_connection(path)?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS query_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                query TEXT NOT NULL,
                query_key TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                fragment_ids TEXT NOT NULL,
                response_time_ms INTEGER NOT NULL,
                expanded_query TEXT,
                scores TEXT NOT NULL,
                avg_score REAL NOT NULL DEFAULT 0.0
            );
            CREATE INDEX IF NOT EXISTS idx_query_log_key ON query_log(query_key);
            CREATE INDEX IF NOT EXISTS idx_query_log_score ON query_log(avg_score);",
        )
        .context("Failed to create query_log table")?;

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

    fn row_to_record(row: &Row<'_>) -> rusqlite::Result<(QueryRecord, String, String)> {
        Ok((
            QueryRecord {
                query: row.get(0)?,
                query_key: row.get(1)?,
                timestamp: parse_datetime(&row.get::<_, String>(2)?),
                fragment_ids: vec![],
                response_time_ms: row.get::<_, i64>(4)? as u64,
                expanded_query: row.get(5)?,
                scores: vec![],
            },
            row.get(3)?,
            row.get(6)?,
        ))
    }

    fn decode(raw: (QueryRecord, String, String)) -> Result<QueryRecord> {
        let (mut record, ids, scores) = raw;
        record.fragment_ids = serde_json::from_str(&ids).context("Corrupt fragment id list")?;
        record.scores = serde_json::from_str(&scores).context("Corrupt score list")?;
        Ok(record)
    }

    /// 최근 기록 (최신순)
    pub fn recent(&self, limit: usize) -> Result<Vec<QueryRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT query, query_key, timestamp, fragment_ids, response_time_ms, expanded_query, scores
             FROM query_log ORDER BY id DESC LIMIT ?1",
        )?;

        let rows = stmt
            .query_map(params![limit as i64], Self::row_to_record)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to list query log")?;

        rows.into_iter().map(Self::decode).collect()
    }

    /// 평균 스코어가 `threshold` 미만인 기록 (낮은 순)
    pub fn low_score_queries(&self, threshold: f64, limit: usize) -> Result<Vec<QueryRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT query, query_key, timestamp, fragment_ids, response_time_ms, expanded_query, scores
             FROM query_log WHERE avg_score < ?1
             ORDER BY avg_score ASC, id DESC LIMIT ?2",
        )?;

        let rows = stmt
            .query_map(params![threshold, limit as i64], Self::row_to_record)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to list low score queries")?;

        rows.into_iter().map(Self::decode).collect()
    }

    /// 가장 많이 들어온 쿼리 (횟수 내림차순)
    pub fn common_queries(&self, limit: usize) -> Result<Vec<CommonQuery>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT
                (SELECT latest.query FROM query_log latest
                 WHERE latest.query_key = q.query_key ORDER BY latest.id DESC LIMIT 1),
                q.query_key, COUNT(*), AVG(q.avg_score)
             FROM query_log q
             GROUP BY q.query_key
             ORDER BY COUNT(*) DESC, q.query_key ASC
             LIMIT ?1",
        )?;

        let common = stmt
            .query_map(params![limit as i64], |row| {
                Ok(CommonQuery {
                    query: row.get(0)?,
                    query_key: row.get(1)?,
                    count: row.get::<_, i64>(2)? as usize,
                    avg_score: row.get::<_, Option<f64>>(3)?.unwrap_or(0.0),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to list common queries")?;

        Ok(common)
    }

    pub fn stats(&self) -> Result<QueryLogStats> {
        let conn = self.lock()?;

        let (total, unique, avg, empty): (i64, i64, Option<f64>, i64) = conn.query_row(
            "SELECT COUNT(*), COUNT(DISTINCT query_key), AVG(response_time_ms),
                    COALESCE(SUM(CASE WHEN fragment_ids = '[]' THEN 1 ELSE 0 END), 0)
             FROM query_log",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )?;

        Ok(QueryLogStats {
            total_queries: total as usize,
            unique_queries: unique as usize,
            avg_response_time_ms: avg.unwrap_or(0.0),
            empty_results: empty as usize,
        })
    }
}

impl QueryLog for SqliteQueryLog {
    fn record(&self, record: &QueryRecord) -> Result<()> {
        let conn = self.lock()?;

        conn.execute(
            "INSERT INTO query_log
             (query, query_key, timestamp, fragment_ids, response_time_ms, expanded_query, scores, avg_score)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.query,
                record.query_key,
                record.timestamp.to_rfc3339(),
                serde_json::to_string(&record.fragment_ids)?,
                record.response_time_ms as i64,
                record.expanded_query,
                serde_json::to_string(&record.scores)?,
                mean_score(&record.scores),
            ],
        )
        .context("Failed to insert query record")?;

        Ok(())
    }

    fn latest_for_query(&self, query_key: &str) -> Result<Option<QueryRecord>> {
        let conn = self.lock()?;

        let raw = conn
            .query_row(
                "SELECT query, query_key, timestamp, fragment_ids, response_time_ms, expanded_query, scores
                 FROM query_log WHERE query_key = ?1 ORDER BY id DESC LIMIT 1",
                params![query_key],
                Self::row_to_record,
            )
            .optional()
            .context("Failed to read query record")?;

        raw.map(Self::decode).transpose()
    }
}
