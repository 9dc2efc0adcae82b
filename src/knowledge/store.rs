//! Knowledge Store - rusqlite 기반 프래그먼트 저장소
//!
//! 검색 대상 프래그먼트(텍스트 + 출처)를 저장합니다. 엔진은 이 저장소를
//! 읽기만 하며, 피드백 adjustment는 별도 학습 저장소에 둡니다.
//! 저장 위치: ~/.feedrank/knowledge.db

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, Row};
use serde::{Deserialize, Serialize};

use crate::scoring::FragmentId;

// ============================================================================
// Data Directory
// ============================================================================

/// 데이터 디렉토리 경로 (~/.feedrank/)
pub fn get_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".feedrank")
}

/// SQLite 연결 열기 (부모 디렉토리 자동 생성)
///
/// 학습/캐시/쿼리 로그 저장소도 같은 방식으로 엽니다.
pub(crate) fn open_connection(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }
    }

    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .context("Failed to open SQLite database")?;

    // 여러 저장소 핸들이 같은 파일을 동시에 쓸 수 있도록
    conn.busy_timeout(std::time::Duration::from_secs(5))
        .context("Failed to set busy timeout")?;
    let _ = conn.pragma_update(None, "journal_mode", "WAL");

    Ok(conn)
}

/// RFC3339 문자열을 DateTime<Utc>로 파싱
pub(crate) fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

// ============================================================================
// Types
// ============================================================================

/// 검색 가능한 텍스트 단위
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fragment {
    pub id: FragmentId,
    /// 출처 (URL, 파일 경로 등)
    pub source: String,
    pub title: Option<String>,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// 새 프래그먼트 입력용 구조체
#[derive(Debug, Clone)]
pub struct NewFragment {
    pub source: String,
    pub title: Option<String>,
    pub content: String,
}

/// 저장소 통계
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub fragment_count: usize,
    pub total_content_bytes: usize,
    pub db_path: PathBuf,
}

// ============================================================================
// FragmentSource Trait
// ============================================================================

/// 지식 저장소의 읽기 경계
///
/// 엔진은 프래그먼트 텍스트를 절대 수정하지 않습니다.
pub trait FragmentSource: Send + Sync {
    fn get_fragment(&self, id: FragmentId) -> Result<Option<Fragment>>;

    fn list_fragment_ids(&self) -> Result<Vec<FragmentId>>;

    /// 렉시컬 인덱스 재구축용 전체 목록
    fn list_fragments(&self) -> Result<Vec<Fragment>>;
}

// ============================================================================
// KnowledgeStore
// ============================================================================

/// Knowledge Store - 동기 프래그먼트 저장소
pub struct KnowledgeStore {
    conn: Arc<Mutex<Connection>>,
    db_path: PathBuf,
}

impl KnowledgeStore {
    /// 저장소 열기 (없으면 생성)
    pub fn open(path: &Path) -> Result<Self> {
        let conn = open_connection(path)?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
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

    /// 스키마 초기화
    fn initialize(&self) -> Result<()> {
        let conn = self.lock()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS fragments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source TEXT NOT NULL,
                title TEXT,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
            [],
        )
        .context("Failed to create fragments table")?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_fragments_source ON fragments(source)",
            [],
        )
        .context("Failed to create source index")?;

        tracing::debug!("Knowledge store initialized at {:?}", self.db_path);
        Ok(())
    }

    fn row_to_fragment(row: &Row<'_>) -> rusqlite::Result<Fragment> {
        Ok(Fragment {
            id: row.get(0)?,
            source: row.get(1)?,
            title: row.get(2)?,
            content: row.get(3)?,
            created_at: parse_datetime(&row.get::<_, String>(4)?),
        })
    }

    /// 프래그먼트 저장
    pub fn add_fragment(&self, fragment: NewFragment) -> Result<FragmentId> {
        let conn = self.lock()?;
        let now = Utc::now().to_rfc3339();

        conn.execute(
            "INSERT INTO fragments (source, title, content, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![fragment.source, fragment.title, fragment.content, now],
        )
        .context("Failed to insert fragment")?;

        let id = conn.last_insert_rowid();
        tracing::info!("Added fragment: {} (id={})", fragment.source, id);

        Ok(id)
    }

    /// 출처별 프래그먼트 목록
    pub fn list_by_source(&self, source: &str) -> Result<Vec<Fragment>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, source, title, content, created_at FROM fragments
             WHERE source = ?1 ORDER BY id",
        )?;

        let fragments = stmt
            .query_map(params![source], Self::row_to_fragment)?
            .filter_map(|r| r.ok())
            .collect();

        Ok(fragments)
    }

    /// 프래그먼트 삭제
    ///
    /// 렉시컬 인덱스는 호출자가 재구축해야 합니다.
    pub fn delete_fragment(&self, id: FragmentId) -> Result<bool> {
        let conn = self.lock()?;
        let rows = conn.execute("DELETE FROM fragments WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }

    /// 저장소 통계
    pub fn stats(&self) -> Result<StoreStats> {
        let conn = self.lock()?;

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM fragments", [], |row| row.get(0))
            .unwrap_or(0);

        let total_size: i64 = conn
            .query_row(
                "SELECT COALESCE(SUM(LENGTH(content)), 0) FROM fragments",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        Ok(StoreStats {
            fragment_count: count as usize,
            total_content_bytes: total_size as usize,
            db_path: self.db_path.clone(),
        })
    }
}

impl FragmentSource for KnowledgeStore {
    fn get_fragment(&self, id: FragmentId) -> Result<Option<Fragment>> {
        let conn = self.lock()?;

        let mut stmt = conn.prepare(
            "SELECT id, source, title, content, created_at FROM fragments WHERE id = ?1",
        )?;

        let fragment = stmt.query_row(params![id], Self::row_to_fragment).ok();
        Ok(fragment)
    }

    fn list_fragment_ids(&self) -> Result<Vec<FragmentId>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT id FROM fragments ORDER BY id")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(ids)
    }

    fn list_fragments(&self) -> Result<Vec<Fragment>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, source, title, content, created_at FROM fragments ORDER BY id",
        )?;
        let fragments = stmt
            .query_map([], Self::row_to_fragment)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(fragments)
    }
}

// ============================================================================
// Tests
// ============================================================================
