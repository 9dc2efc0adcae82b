//! Response Cache - 답변 캐시
//!
//! 캐시 키는 정규화된 쿼리와 요청 파라미터(top_k, temperature, 기능 플래그)의
//! SHA-256 입니다. 같은 쿼리라도 플래그가 다르면 다른 키가 됩니다.
//!
//! 무효화는 소프트 삭제입니다. 무효화/만료된 항목은 읽을 수 없지만
//! `sweep`이 지울 때까지 감사용으로 남습니다.

mod sqlite;

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{RetrievalError, Result};
use crate::locks::KeyedLocks;
use crate::query::{sha256_prefix, RetrievalFlags, RetrievalRequest};
use crate::scoring::FragmentId;

pub use sqlite::SqliteCacheBackend;

// ============================================================================
// Types
// ============================================================================

/// 캐시 키
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey(String);

/// 캐시 키에 들어가는 요청 파라미터
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheParams {
    pub top_k: usize,
    pub temperature: f32,
    pub flags: RetrievalFlags,
}

impl CacheKey {
    /// 정규화된 쿼리 + 파라미터로 키 생성
    pub fn derive(normalized_query: &str, params: &CacheParams) -> Self {
        // serde_json 맵은 키 순서가 정렬되어 있어 직렬화가 결정적
        let params_json = serde_json::json!({
            "top_k": params.top_k,
            "temperature": format!("{:.3}", params.temperature),
            "flags": {
                "expansion": params.flags.use_expansion,
                "hyde": params.flags.use_hyde,
                "hybrid": params.flags.use_hybrid,
                "history": params.flags.use_history,
            },
        });
        CacheKey(sha256_prefix(
            &format!("{}|{}", normalized_query, params_json),
            32,
        ))
    }

    pub fn for_request(request: &RetrievalRequest) -> Self {
        Self::derive(
            &request.normalized_query(),
            &CacheParams {
                top_k: request.top_k,
                temperature: request.temperature,
                flags: request.flags,
            },
        )
    }

    pub fn from_raw(key: impl Into<String>) -> Self {
        CacheKey(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// 캐시에 저장되는 답변
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedAnswer {
    pub query_key: String,
    pub query: String,
    pub answer: String,
    /// 답변 생성에 쓰인 프래그먼트
    pub fragment_ids: Vec<FragmentId>,
}

/// 캐시 항목
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub answer: CachedAnswer,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// 캐시 통계
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub total_entries: usize,
    pub live_entries: usize,
    pub invalidated_entries: usize,
    pub total_hits: u64,
}

// ============================================================================
// CacheBackend Trait
// ============================================================================

/// 캐시 저장소
///
/// 시각은 호출자가 넘깁니다. 구현은 밀리초 단위로 저장합니다.
pub trait CacheBackend: Send + Sync {
    /// 살아있는 항목 조회 (조회 시 hit count 증가)
    fn load(&self, key: &CacheKey, now: DateTime<Utc>) -> anyhow::Result<Option<CacheEntry>>;

    /// 저장 (같은 키의 기존 항목과 무효화 표시를 덮어씀)
    fn store(&self, entry: &CacheEntry) -> anyhow::Result<()>;

    /// 키 하나 소프트 삭제
    fn invalidate(&self, key: &CacheKey, now: DateTime<Utc>) -> anyhow::Result<bool>;

    /// 쿼리 키에 해당하는 모든 항목 소프트 삭제
    fn invalidate_query(&self, query_key: &str, now: DateTime<Utc>) -> anyhow::Result<usize>;

    /// 만료된 항목 영구 삭제
    fn sweep(&self, now: DateTime<Utc>) -> anyhow::Result<usize>;

    fn clear(&self) -> anyhow::Result<usize>;

    fn stats(&self, now: DateTime<Utc>) -> anyhow::Result<CacheStats>;

    /// 최근 저장된 살아있는 항목
    fn recent(&self, limit: usize, now: DateTime<Utc>) -> anyhow::Result<Vec<CacheEntry>>;
}

// ============================================================================
// ResponseCache
// ============================================================================

/// 밀리초 단위로 자름 (저장소 정밀도와 맞춤)
fn truncate_millis(at: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(at.timestamp_millis()).unwrap_or(at)
}

fn backend_error(err: anyhow::Error) -> RetrievalError {
    RetrievalError::cache_backend(format!("{:#}", err))
}

/// 응답 캐시
///
/// 쓰기 작업은 키 단위로 직렬화됩니다. `put`과 `invalidate_query`는 같은
/// 쿼리 키 락을 잡으므로, 부정 피드백의 무효화가 동시 `put`에 덮이지 않습니다.
pub struct ResponseCache {
    backend: Arc<dyn CacheBackend>,
    ttl: Duration,
    query_locks: KeyedLocks,
    key_locks: KeyedLocks,
}

impl ResponseCache {
    pub fn new(backend: Arc<dyn CacheBackend>, ttl: Duration) -> Self {
        Self {
            backend,
            ttl,
            query_locks: KeyedLocks::new(),
            key_locks: KeyedLocks::new(),
        }
    }

    /// 시간 단위 TTL로 생성
    pub fn with_ttl_hours(backend: Arc<dyn CacheBackend>, ttl_hours: i64) -> Self {
        Self::new(backend, Duration::hours(ttl_hours.max(1)))
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
        self.get_at(key, Utc::now())
    }

    pub fn get_at(&self, key: &CacheKey, now: DateTime<Utc>) -> Result<Option<CacheEntry>> {
        let entry = self.backend.load(key, now).map_err(backend_error)?;
        match &entry {
            Some(_) => tracing::debug!("Cache hit: {}", key),
            None => tracing::debug!("Cache miss: {}", key),
        }
        Ok(entry)
    }

    /// 기본 TTL로 저장
    pub fn put(&self, key: CacheKey, answer: CachedAnswer) -> Result<CacheEntry> {
        self.put_at(key, answer, self.ttl, Utc::now())
    }

    pub fn put_at(
        &self,
        key: CacheKey,
        answer: CachedAnswer,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<CacheEntry> {
        let created_at = truncate_millis(now);
        let entry = CacheEntry {
            key,
            answer,
            created_at,
            expires_at: created_at + ttl,
        };

        let query_key = entry.answer.query_key.clone();
        self.query_locks.with_lock(&query_key, || {
            self.key_locks
                .with_lock(entry.key.as_str(), || self.backend.store(&entry))
        })
        .map_err(backend_error)?;

        tracing::debug!("Cached answer {} (query {})", entry.key, query_key);
        Ok(entry)
    }

    pub fn invalidate(&self, key: &CacheKey) -> Result<bool> {
        let now = Utc::now();
        self.key_locks
            .with_lock(key.as_str(), || self.backend.invalidate(key, now))
            .map_err(backend_error)
    }

    /// 쿼리 키의 모든 캐시 항목 무효화 (파라미터 무관)
    pub fn invalidate_query(&self, query_key: &str) -> Result<usize> {
        self.invalidate_query_at(query_key, Utc::now())
    }

    pub fn invalidate_query_at(&self, query_key: &str, now: DateTime<Utc>) -> Result<usize> {
        let count = self
            .query_locks
            .with_lock(query_key, || self.backend.invalidate_query(query_key, now))
            .map_err(backend_error)?;

        if count > 0 {
            tracing::info!("Invalidated {} cache entries for query {}", count, query_key);
        }
        Ok(count)
    }

    pub fn sweep(&self) -> Result<usize> {
        self.sweep_at(Utc::now())
    }

    pub fn sweep_at(&self, now: DateTime<Utc>) -> Result<usize> {
        let removed = self.backend.sweep(now).map_err(backend_error)?;
        tracing::info!("Swept {} expired cache entries", removed);
        Ok(removed)
    }

    pub fn clear(&self) -> Result<usize> {
        self.backend.clear().map_err(backend_error)
    }

    pub fn stats(&self) -> Result<CacheStats> {
        self.backend.stats(Utc::now()).map_err(backend_error)
    }

    pub fn recent(&self, limit: usize) -> Result<Vec<CacheEntry>> {
        self.backend.recent(limit, Utc::now()).map_err(backend_error)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use tempfile::TempDir;

    fn create_test_cache() -> (TempDir, ResponseCache) {
        let temp_dir = TempDir::new().unwrap();
        let backend = SqliteCacheBackend::open(&temp_dir.path().join("cache.db")).unwrap();
        (temp_dir, ResponseCache::with_ttl_hours(Arc::new(backend), 24))
    }

    fn answer(query: &str, text: &str) -> CachedAnswer {
        CachedAnswer {
            query_key: crate::query::query_key(query),
            query: query.to_string(),
            answer: text.to_string(),
            fragment_ids: vec![2, 7],
        }
    }

    fn key_for(query: &str, flags: RetrievalFlags) -> CacheKey {
        CacheKey::for_request(&RetrievalRequest::new(query, 5).with_flags(flags))
    }

    #[test]
    fn test_key_depends_on_flags_and_params() {
        let base = RetrievalFlags::default();
        let hyde = RetrievalFlags {
            use_hyde: true,
            ..base
        };

        assert_eq!(key_for("What is X?", base), key_for("  what is x? ", base));
        assert_ne!(key_for("what is x?", base), key_for("what is x?", hyde));

        let a = CacheKey::for_request(&RetrievalRequest::new("q", 5).with_temperature(0.7));
        let b = CacheKey::for_request(&RetrievalRequest::new("q", 5).with_temperature(0.7001));
        let c = CacheKey::for_request(&RetrievalRequest::new("q", 5).with_temperature(0.75));
        let d = CacheKey::for_request(&RetrievalRequest::new("q", 6));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }

    #[test]
    fn test_put_then_get_round_trip() {
        let (_dir, cache) = create_test_cache();
        let key = key_for("what is x", RetrievalFlags::default());

        let stored = cache.put(key.clone(), answer("what is x", "X is a company")).unwrap();
        let loaded = cache.get(&key).unwrap().unwrap();
        assert_eq!(loaded, stored);
    }

    #[test]
    fn test_put_overwrites_existing_entry() {
        let (_dir, cache) = create_test_cache();
        let key = key_for("what is x", RetrievalFlags::default());

        cache.put(key.clone(), answer("what is x", "old")).unwrap();
        cache.put(key.clone(), answer("what is x", "new")).unwrap();

        assert_eq!(cache.get(&key).unwrap().unwrap().answer.answer, "new");
        assert_eq!(cache.stats().unwrap().total_entries, 1);
    }

    #[test]
    fn test_expired_entry_is_unreadable_and_swept() {
        let (_dir, cache) = create_test_cache();
        let key = key_for("q", RetrievalFlags::default());
        let past = Utc::now() - Duration::hours(48);

        cache.put_at(key.clone(), answer("q", "stale"), Duration::hours(24), past).unwrap();
        assert!(cache.get(&key).unwrap().is_none());

        assert_eq!(cache.sweep().unwrap(), 1);
        assert_eq!(cache.stats().unwrap().total_entries, 0);
    }

    #[test]
    fn test_invalidate_is_soft_delete() {
        let (_dir, cache) = create_test_cache();
        let key = key_for("q", RetrievalFlags::default());
        cache.put(key.clone(), answer("q", "a")).unwrap();

        assert!(cache.invalidate(&key).unwrap());
        assert!(cache.get(&key).unwrap().is_none());

        let stats = cache.stats().unwrap();
        assert_eq!(stats.total_entries, 1);
        assert_eq!(stats.invalidated_entries, 1);
        assert_eq!(stats.live_entries, 0);

        // 다시 저장하면 살아남
        cache.put(key.clone(), answer("q", "b")).unwrap();
        assert!(cache.get(&key).unwrap().is_some());
    }

    #[test]
    fn test_invalidate_query_covers_all_params() {
        let (_dir, cache) = create_test_cache();
        let plain = key_for("what is x", RetrievalFlags::default());
        let hyde = key_for(
            "what is x",
            RetrievalFlags {
                use_hyde: true,
                ..Default::default()
            },
        );
        let other = key_for("pricing", RetrievalFlags::default());

        cache.put(plain.clone(), answer("what is x", "a")).unwrap();
        cache.put(hyde.clone(), answer("what is x", "b")).unwrap();
        cache.put(other.clone(), answer("pricing", "c")).unwrap();

        assert_eq!(cache.invalidate_query(&crate::query::query_key("What is X")).unwrap(), 2);
        assert!(cache.get(&plain).unwrap().is_none());
        assert!(cache.get(&hyde).unwrap().is_none());
        assert!(cache.get(&other).unwrap().is_some());
    }

    #[test]
    fn test_hit_count_and_recent() {
        let (_dir, cache) = create_test_cache();
        let key = key_for("q", RetrievalFlags::default());
        cache.put(key.clone(), answer("q", "a")).unwrap();

        cache.get(&key).unwrap();
        cache.get(&key).unwrap();

        assert_eq!(cache.stats().unwrap().total_hits, 2);
        assert_eq!(cache.recent(10).unwrap().len(), 1);

        assert_eq!(cache.clear().unwrap(), 1);
        assert!(cache.recent(10).unwrap().is_empty());
    }

    struct DownBackend;

    impl CacheBackend for DownBackend {
        fn load(&self, _: &CacheKey, _: DateTime<Utc>) -> anyhow::Result<Option<CacheEntry>> {
            bail!("database is locked")
        }
        fn store(&self, _: &CacheEntry) -> anyhow::Result<()> {
            bail!("database is locked")
        }
        fn invalidate(&self, _: &CacheKey, _: DateTime<Utc>) -> anyhow::Result<bool> {
            bail!("database is locked")
        }
        fn invalidate_query(&self, _: &str, _: DateTime<Utc>) -> anyhow::Result<usize> {
            bail!("database is locked")
        }
        fn sweep(&self, _: DateTime<Utc>) -> anyhow::Result<usize> {
            bail!("database is locked")
        }
        fn clear(&self) -> anyhow::Result<usize> {
            bail!("database is locked")
        }
        fn stats(&self, _: DateTime<Utc>) -> anyhow::Result<CacheStats> {
            bail!("database is locked")
        }
        fn recent(&self, _: usize, _: DateTime<Utc>) -> anyhow::Result<Vec<CacheEntry>> {
            bail!("database is locked")
        }
    }

    #[test]
    fn test_backend_failure_maps_to_unavailable() {
        let cache = ResponseCache::with_ttl_hours(Arc::new(DownBackend), 24);
        let key = key_for("q", RetrievalFlags::default());

        assert!(matches!(
            cache.get(&key),
            Err(RetrievalError::CacheBackendUnavailable(_))
        ));
        assert!(matches!(
            cache.invalidate_query("abc"),
            Err(RetrievalError::CacheBackendUnavailable(_))
        ));
    }
}
