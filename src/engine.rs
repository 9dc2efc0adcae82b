//! Retrieval Engine - 쿼리 한 건의 검색 흐름
//!
//! 쿼리 → 확장/임베딩 (동시) → 렉시컬/시맨틱/히스토리 순위 (동시)
//! → RRF 퓨전 + 피드백 adjustment → 프래그먼트 로드 → 검색 기록.
//!
//! 외부 호출 실패는 요청을 실패시키지 않습니다. 빠진 경로는
//! `Evidence::degradations`에 남습니다.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;

use crate::augment::QueryAugmenter;
use crate::cache::{CacheEntry, CacheKey, CachedAnswer, ResponseCache, SqliteCacheBackend};
use crate::config::FeedrankConfig;
use crate::embedding::{has_api_key, EmbedTask, EmbeddingProvider, GeminiEmbedding};
use crate::error::{Degradation, RetrievalError, Result};
use crate::feedback::{FeedbackEvent, FeedbackLearner, FeedbackOutcome, LearnerSettings};
use crate::fusion::{FusedResult, FusionEngine};
use crate::knowledge::{Fragment, FragmentSource, KnowledgeStore, LanceVectorStore, VectorStore};
use crate::llm::{GeminiLlm, LlmProvider};
use crate::query::RetrievalRequest;
use crate::query_log::{QueryLog, QueryRecord, SqliteQueryLog};
use crate::ranking::{
    HistoryRanker, LexicalRanker, RankedResult, RankerTag, RankingQuery, RankingSource,
    SemanticRanker,
};

// ============================================================================
// Data Paths
// ============================================================================

/// 데이터 디렉토리 안의 파일 배치
#[derive(Debug, Clone)]
pub struct DataPaths {
    root: PathBuf,
}

impl DataPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn knowledge_db(&self) -> PathBuf {
        self.root.join("knowledge.db")
    }

    pub fn learning_db(&self) -> PathBuf {
        self.root.join("learning.db")
    }

    pub fn cache_db(&self) -> PathBuf {
        self.root.join("cache.db")
    }

    pub fn query_log_db(&self) -> PathBuf {
        self.root.join("query_log.db")
    }

    pub fn vectors(&self) -> PathBuf {
        self.root.join("vectors.lance")
    }
}

// ============================================================================
// Evidence
// ============================================================================

/// 근거 프래그먼트 하나
#[derive(Debug, Clone, Serialize)]
pub struct EvidenceItem {
    pub fragment: Fragment,
    pub fused: FusedResult,
}

/// 검색 결과 (순위순 근거 + 처리 기록)
#[derive(Debug, Clone, Serialize)]
pub struct Evidence {
    pub query: String,
    pub query_key: String,
    pub cache_key: CacheKey,
    pub items: Vec<EvidenceItem>,
    pub expanded_terms: Vec<String>,
    pub expanded_query: Option<String>,
    #[serde(skip)]
    pub degradations: Vec<Degradation>,
    pub elapsed_ms: u64,
}

impl Evidence {
    pub fn fragment_ids(&self) -> Vec<i64> {
        self.items.iter().map(|item| item.fragment.id).collect()
    }

    pub fn is_degraded(&self) -> bool {
        !self.degradations.is_empty()
    }
}

/// 캐시 조회 결과
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup {
    Hit(CacheEntry),
    Miss,
    /// 캐시 없음 또는 저장소 오류로 우회
    Bypassed(String),
}

// ============================================================================
// RetrievalEngine
// ============================================================================

/// 검색 결정 엔진
pub struct RetrievalEngine {
    fragments: Arc<dyn FragmentSource>,
    lexical: Arc<LexicalRanker>,
    semantic: Option<SemanticRanker>,
    history: Option<HistoryRanker>,
    augmenter: QueryAugmenter,
    fusion: FusionEngine,
    learner: Arc<FeedbackLearner>,
    cache: Option<Arc<ResponseCache>>,
    query_log: Option<Arc<dyn QueryLog>>,
    candidate_multiplier: usize,
}

impl RetrievalEngine {
    /// 렉시컬 전용 엔진 (나머지는 builder로 추가)
    pub fn new(fragments: Arc<dyn FragmentSource>, learner: Arc<FeedbackLearner>) -> Self {
        Self {
            fragments,
            lexical: Arc::new(LexicalRanker::default()),
            semantic: None,
            history: None,
            augmenter: QueryAugmenter::default(),
            fusion: FusionEngine::default(),
            learner,
            cache: None,
            query_log: None,
            candidate_multiplier: 2,
        }
    }

    /// 설정대로 SQLite/LanceDB/Gemini 어댑터를 연결
    ///
    /// API 키가 없으면 LLM/임베딩 없이 렉시컬 검색만 합니다.
    pub async fn open(config: &FeedrankConfig) -> anyhow::Result<Self> {
        config.validate()?;
        let paths = DataPaths::new(config.data_dir());

        let store = Arc::new(
            KnowledgeStore::open(&paths.knowledge_db()).context("Failed to open knowledge store")?,
        );
        let query_log: Arc<dyn QueryLog> = Arc::new(SqliteQueryLog::open(&paths.query_log_db())?);

        let cache = if config.cache.enabled {
            let backend = SqliteCacheBackend::open(&paths.cache_db())?;
            Some(Arc::new(ResponseCache::with_ttl_hours(
                Arc::new(backend),
                config.cache.ttl_hours,
            )))
        } else {
            None
        };

        let mut learner = FeedbackLearner::open(
            &paths.learning_db(),
            LearnerSettings::from_config(&config.feedback),
        )?
        .with_query_log(Arc::clone(&query_log));
        if let Some(cache) = &cache {
            learner = learner.with_cache(Arc::clone(cache));
        }

        let (llm, embedder): (Option<Arc<dyn LlmProvider>>, Option<Arc<dyn EmbeddingProvider>>) =
            if has_api_key() {
                let retry = config.providers.retry;
                let llm = GeminiLlm::from_env(config.providers.completion_model.clone())?
                    .with_retry(retry);
                let embedder =
                    GeminiEmbedding::from_env_with_dimension(config.providers.embedding_dimension)?
                        .with_task(EmbedTask::Query)
                        .with_retry(retry);
                (
                    Some(Arc::new(llm) as Arc<dyn LlmProvider>),
                    Some(Arc::new(embedder) as Arc<dyn EmbeddingProvider>),
                )
            } else {
                tracing::warn!("No Gemini API key found; running lexical-only retrieval");
                (None, None)
            };

        let augmenter = QueryAugmenter::standard(
            llm,
            embedder.clone(),
            config.augment.synonyms.clone(),
            config.retrieval.expanded_term_weight,
        );

        let mut engine = Self::new(store, Arc::new(learner))
            .with_augmenter(augmenter)
            .with_fusion(FusionEngine::new(
                config.retrieval.rrf_constant,
                config.feedback.bounds(),
            ))
            .with_query_log(query_log)
            .with_candidate_multiplier(config.retrieval.candidate_multiplier);

        if let Some(cache) = cache {
            engine = engine.with_cache(cache);
        }
        if embedder.is_some() {
            let vectors = LanceVectorStore::open(&paths.vectors()).await?;
            engine = engine.with_vector_search(Arc::new(vectors));
        }
        if config.retrieval.use_history {
            engine = engine.with_history();
        }

        Ok(engine)
    }

    pub fn with_vector_search(mut self, store: Arc<dyn VectorStore>) -> Self {
        self.semantic = Some(SemanticRanker::new(store));
        self
    }

    /// 학습된 매핑 랭커 사용
    pub fn with_history(mut self) -> Self {
        self.history = Some(HistoryRanker::new(Arc::clone(&self.learner)));
        self
    }

    pub fn with_augmenter(mut self, augmenter: QueryAugmenter) -> Self {
        self.augmenter = augmenter;
        self
    }

    pub fn with_fusion(mut self, fusion: FusionEngine) -> Self {
        self.fusion = fusion;
        self
    }

    pub fn with_cache(mut self, cache: Arc<ResponseCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_query_log(mut self, query_log: Arc<dyn QueryLog>) -> Self {
        self.query_log = Some(query_log);
        self
    }

    /// 랭커별 후보 수 = top_k × multiplier
    pub fn with_candidate_multiplier(mut self, multiplier: usize) -> Self {
        self.candidate_multiplier = multiplier.max(1);
        self
    }

    pub fn learner(&self) -> &Arc<FeedbackLearner> {
        &self.learner
    }

    pub fn cache(&self) -> Option<&Arc<ResponseCache>> {
        self.cache.as_ref()
    }

    pub fn lexical(&self) -> &LexicalRanker {
        &self.lexical
    }

    // ------------------------------------------------------------------------
    // Retrieval
    // ------------------------------------------------------------------------

    /// 쿼리 하나를 검색해 근거 반환
    pub async fn retrieve(&self, request: &RetrievalRequest) -> Result<Evidence> {
        let start = Instant::now();
        let flags = request.flags;
        let query_key = request.query_key();
        let want_semantic = flags.use_hybrid && self.semantic.is_some();

        let (expansion, embedded) = tokio::join!(
            self.augmenter.expand(&request.query, flags.use_expansion),
            async {
                if want_semantic {
                    Some(self.augmenter.embed(&request.query, flags.use_hyde).await)
                } else {
                    None
                }
            }
        );

        let mut degradations = expansion.degradations.clone();

        let embedding = match embedded {
            Some(outcome) => {
                degradations.extend(outcome.degradations);
                match outcome.embedding {
                    Ok(vector) => Some(vector),
                    Err(e) => {
                        tracing::warn!("Semantic ranking skipped: {}", e);
                        degradations.push(Degradation::RankerSkipped {
                            ranker: RankerTag::Semantic.to_string(),
                            reason: e.to_string(),
                        });
                        None
                    }
                }
            }
            None => None,
        };

        let ranking_query = RankingQuery {
            text: request.query.clone(),
            query_key: query_key.clone(),
            terms: expansion.terms.clone(),
            embedding,
            limit: request.top_k.max(1) * self.candidate_multiplier,
        };

        let mut sources: Vec<&dyn RankingSource> = Vec::with_capacity(3);
        sources.push(self.lexical.as_ref());
        if let (Some(semantic), Some(_)) = (&self.semantic, &ranking_query.embedding) {
            if flags.use_hybrid {
                sources.push(semantic);
            }
        }
        if flags.use_history {
            if let Some(history) = &self.history {
                sources.push(history);
            }
        }

        let results = join_all(sources.iter().map(|s| s.produce_ranking(&ranking_query))).await;

        let mut rankings: Vec<Vec<RankedResult>> = Vec::with_capacity(results.len());
        for (source, result) in sources.iter().zip(results) {
            match result {
                Ok(ranking) => rankings.push(ranking),
                Err(RetrievalError::IndexStale) => {
                    let count = self.rebuild_index()?;
                    degradations.push(Degradation::IndexRebuilt { fragments: count });
                    rankings.push(self.lexical.rank(&ranking_query.terms, ranking_query.limit)?);
                }
                Err(e) => {
                    tracing::warn!("{} ranking skipped: {}", source.tag(), e);
                    degradations.push(Degradation::RankerSkipped {
                        ranker: source.tag().to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        let candidate_ids: Vec<i64> = rankings
            .iter()
            .flatten()
            .map(|r| r.fragment_id)
            .collect();
        let adjustments = self.learner.adjustments_for(&candidate_ids);
        // 삭제된 프래그먼트를 건너뛰고도 top_k를 채우도록 후보 전체를 퓨전
        let fused = self.fusion.fuse(&rankings, &adjustments, candidate_ids.len());

        let mut items = Vec::with_capacity(request.top_k.min(fused.len()));
        for result in fused {
            if items.len() == request.top_k {
                break;
            }
            match self
                .fragments
                .get_fragment(result.fragment_id)
                .map_err(RetrievalError::storage)?
            {
                Some(fragment) => items.push(EvidenceItem {
                    fragment,
                    fused: result,
                }),
                None => tracing::debug!("Fragment {} no longer exists", result.fragment_id),
            }
        }

        let evidence = Evidence {
            query: request.query.clone(),
            query_key,
            cache_key: CacheKey::for_request(request),
            items,
            expanded_terms: expansion.expanded_terms,
            expanded_query: expansion.expanded_text,
            degradations,
            elapsed_ms: start.elapsed().as_millis() as u64,
        };

        self.log_query(&evidence);

        tracing::info!(
            "Retrieved {} fragments for query {} in {}ms ({} degradations)",
            evidence.items.len(),
            evidence.query_key,
            evidence.elapsed_ms,
            evidence.degradations.len()
        );

        Ok(evidence)
    }

    /// 시간 제한 검색. 시간 초과 시 대기 중인 외부 호출은 취소됨
    pub async fn retrieve_with_timeout(
        &self,
        request: &RetrievalRequest,
        timeout: Duration,
    ) -> Result<Evidence> {
        tokio::time::timeout(timeout, self.retrieve(request))
            .await
            .map_err(|_| RetrievalError::Timeout(timeout))?
    }

    /// 검색 기록 (실패는 경고만 남김)
    fn log_query(&self, evidence: &Evidence) {
        let Some(log) = &self.query_log else {
            return;
        };

        let record = QueryRecord {
            query: evidence.query.clone(),
            query_key: evidence.query_key.clone(),
            timestamp: Utc::now(),
            fragment_ids: evidence.fragment_ids(),
            response_time_ms: evidence.elapsed_ms,
            expanded_query: evidence.expanded_query.clone(),
            scores: evidence.items.iter().map(|i| i.fused.score).collect(),
        };

        if let Err(e) = log.record(&record) {
            tracing::warn!("Failed to record query log: {:#}", e);
        }
    }

    // ------------------------------------------------------------------------
    // Cache
    // ------------------------------------------------------------------------

    /// 요청에 대한 캐시된 답변 조회
    pub fn cached_answer(&self, request: &RetrievalRequest) -> CacheLookup {
        let Some(cache) = &self.cache else {
            return CacheLookup::Bypassed("cache disabled".to_string());
        };

        match cache.get(&CacheKey::for_request(request)) {
            Ok(Some(entry)) => CacheLookup::Hit(entry),
            Ok(None) => CacheLookup::Miss,
            Err(e) => {
                tracing::warn!("Cache lookup bypassed: {}", e);
                CacheLookup::Bypassed(e.to_string())
            }
        }
    }

    /// 생성된 답변을 근거와 함께 캐시. 캐시를 쓸 수 없으면 None
    pub fn cache_answer(&self, evidence: &Evidence, answer: impl Into<String>) -> Option<CacheEntry> {
        let cache = self.cache.as_ref()?;

        let cached = CachedAnswer {
            query_key: evidence.query_key.clone(),
            query: evidence.query.clone(),
            answer: answer.into(),
            fragment_ids: evidence.fragment_ids(),
        };

        match cache.put(evidence.cache_key.clone(), cached) {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::warn!("Cache write bypassed: {}", e);
                None
            }
        }
    }

    // ------------------------------------------------------------------------
    // Feedback & index
    // ------------------------------------------------------------------------

    pub fn apply_feedback(&self, event: &FeedbackEvent) -> Result<FeedbackOutcome> {
        self.learner.apply_feedback(event)
    }

    /// 지식 저장소에서 렉시컬 인덱스 재구축
    pub fn rebuild_index(&self) -> Result<usize> {
        self.lexical
            .rebuild_from(self.fragments.as_ref())
            .map_err(|e| RetrievalError::storage(format!("{:#}", e)))
    }

    /// 코퍼스 변경 알림 (다음 검색에서 재구축)
    pub fn mark_index_stale(&self) {
        self.lexical.mark_stale();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feedback::{FeedbackScope, LearnerStats};
    use crate::knowledge::NewFragment;
    use crate::query::RetrievalFlags;
    use crate::scoring::Polarity;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        store: Arc<KnowledgeStore>,
        engine: RetrievalEngine,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let paths = DataPaths::new(dir.path());

        let store = Arc::new(KnowledgeStore::open(&paths.knowledge_db()).unwrap());
        for (title, content) in [
            ("Services", "We offer cloud migration and consulting services"),
            ("Pricing", "Our pricing model is transparent and project based"),
            ("Low code", "Salesforce consulting and low code platform delivery"),
            ("Office", "The office is located in Lisbon"),
        ] {
            store
                .add_fragment(NewFragment {
                    source: format!("site/{}", title.to_lowercase()),
                    title: Some(title.to_string()),
                    content: content.to_string(),
                })
                .unwrap();
        }

        let query_log: Arc<dyn QueryLog> =
            Arc::new(SqliteQueryLog::open(&paths.query_log_db()).unwrap());
        let backend = SqliteCacheBackend::open(&paths.cache_db()).unwrap();
        let cache = Arc::new(ResponseCache::with_ttl_hours(Arc::new(backend), 24));
        let learner = Arc::new(
            FeedbackLearner::open(&paths.learning_db(), LearnerSettings::default())
                .unwrap()
                .with_query_log(Arc::clone(&query_log))
                .with_cache(Arc::clone(&cache)),
        );

        let engine = RetrievalEngine::new(store.clone(), learner)
            .with_query_log(query_log)
            .with_cache(cache)
            .with_history();

        Fixture {
            _dir: dir,
            store,
            engine,
        }
    }

    fn lexical_only(query: &str) -> RetrievalRequest {
        RetrievalRequest::new(query, 3).with_flags(RetrievalFlags {
            use_expansion: false,
            use_hyde: false,
            use_hybrid: false,
            use_history: true,
        })
    }

    #[tokio::test]
    async fn test_first_query_rebuilds_stale_index() {
        let f = fixture();
        let evidence = f.engine.retrieve(&lexical_only("consulting services")).await.unwrap();

        assert_eq!(evidence.fragment_ids(), vec![1, 3]);
        assert!(evidence
            .degradations
            .contains(&Degradation::IndexRebuilt { fragments: 4 }));

        let again = f.engine.retrieve(&lexical_only("consulting services")).await.unwrap();
        assert!(again.degradations.is_empty());
    }

    #[tokio::test]
    async fn test_mark_stale_picks_up_new_fragments() {
        let f = fixture();
        f.engine.rebuild_index().unwrap();

        let id = f
            .store
            .add_fragment(NewFragment {
                source: "blog/lisbon".into(),
                title: None,
                content: "Lisbon team expands".into(),
            })
            .unwrap();
        f.engine.mark_index_stale();

        let evidence = f.engine.retrieve(&lexical_only("lisbon")).await.unwrap();
        assert!(evidence.fragment_ids().contains(&id));
    }

    #[tokio::test]
    async fn test_deleted_fragment_does_not_shrink_results() {
        let f = fixture();
        f.engine.rebuild_index().unwrap();

        // 인덱스에는 남아 있지만 저장소에서는 사라진 프래그먼트
        assert!(f.store.delete_fragment(1).unwrap());

        let request = RetrievalRequest::new("consulting services", 1).with_flags(RetrievalFlags {
            use_expansion: false,
            use_hyde: false,
            use_hybrid: false,
            use_history: false,
        });
        let evidence = f.engine.retrieve(&request).await.unwrap();
        assert_eq!(evidence.fragment_ids(), vec![3]);
    }

    #[tokio::test]
    async fn test_feedback_reorders_results() {
        let f = fixture();
        let request = lexical_only("consulting services");
        let before = f.engine.retrieve(&request).await.unwrap();
        assert_eq!(before.fragment_ids()[0], 1);

        f.engine
            .apply_feedback(&FeedbackEvent::new(
                &request.query,
                FeedbackScope::Fragment(1),
                Polarity::Negative,
            ))
            .unwrap();
        f.engine
            .apply_feedback(&FeedbackEvent::new(
                &request.query,
                FeedbackScope::Fragment(3),
                Polarity::Positive,
            ))
            .unwrap();

        let after = f.engine.retrieve(&request).await.unwrap();
        assert_eq!(after.fragment_ids()[0], 3);
        let penalized = after.items.iter().find(|i| i.fragment.id == 1).unwrap();
        assert!((penalized.fused.adjustment + 0.15).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_cache_round_trip_and_negative_invalidation() {
        let f = fixture();
        let request = lexical_only("what is the pricing model");

        assert_eq!(f.engine.cached_answer(&request), CacheLookup::Miss);

        let evidence = f.engine.retrieve(&request).await.unwrap();
        let entry = f.engine.cache_answer(&evidence, "Pricing is project based").unwrap();
        assert_eq!(f.engine.cached_answer(&request), CacheLookup::Hit(entry));

        let event = FeedbackEvent::new(&request.query, FeedbackScope::WholeResponse, Polarity::Negative);
        let outcome = f.engine.apply_feedback(&event).unwrap();
        assert_eq!(outcome.cache_entries_invalidated, 1);
        assert_eq!(outcome.fragments_adjusted[0].0, 2);
        assert_eq!(f.engine.cached_answer(&request), CacheLookup::Miss);
    }

    /// 응답하지 않는 임베딩 서비스
    struct StalledEmbedder;

    #[async_trait::async_trait]
    impl EmbeddingProvider for StalledEmbedder {
        async fn embed(&self, _text: &str) -> anyhow::Result<Vec<f32>> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(vec![1.0; 4])
        }

        fn dimension(&self) -> usize {
            4
        }

        fn name(&self) -> &str {
            "stalled"
        }
    }

    struct NoVectors;

    #[async_trait::async_trait]
    impl VectorStore for NoVectors {
        async fn insert_batch(&self, entries: &[crate::knowledge::VectorEntry]) -> anyhow::Result<usize> {
            Ok(entries.len())
        }

        async fn search(&self, _: &[f32], _: usize) -> anyhow::Result<Vec<crate::knowledge::VectorHit>> {
            Ok(vec![])
        }

        async fn delete_by_fragment(&self, _: i64) -> anyhow::Result<usize> {
            Ok(0)
        }

        async fn count(&self) -> anyhow::Result<usize> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_timeout_cancels_pending_calls() {
        let dir = TempDir::new().unwrap();
        let paths = DataPaths::new(dir.path());
        let store = Arc::new(KnowledgeStore::open(&paths.knowledge_db()).unwrap());
        store
            .add_fragment(NewFragment {
                source: "site/pricing".into(),
                title: None,
                content: "Our pricing model is transparent".into(),
            })
            .unwrap();

        let query_log = Arc::new(SqliteQueryLog::open(&paths.query_log_db()).unwrap());
        let learner = Arc::new(
            FeedbackLearner::open(&paths.learning_db(), LearnerSettings::default()).unwrap(),
        );
        let augmenter = QueryAugmenter::standard(
            None,
            Some(Arc::new(StalledEmbedder) as Arc<dyn EmbeddingProvider>),
            Default::default(),
            0.5,
        );
        let engine = RetrievalEngine::new(store, Arc::clone(&learner))
            .with_vector_search(Arc::new(NoVectors))
            .with_augmenter(augmenter)
            .with_query_log(query_log.clone() as Arc<dyn QueryLog>);

        let request = RetrievalRequest::new("how transparent is the pricing model", 3)
            .with_flags(RetrievalFlags {
                use_expansion: false,
                use_hyde: true,
                use_hybrid: true,
                use_history: false,
            });

        let limit = Duration::from_millis(50);
        let started = Instant::now();
        let result = engine.retrieve_with_timeout(&request, limit).await;

        assert!(matches!(result, Err(RetrievalError::Timeout(d)) if d == limit));
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(query_log.stats().unwrap().total_queries, 0);
        assert_eq!(learner.stats().unwrap(), LearnerStats::default());
    }
}
