//! Feedback 모듈 - 피드백 학습기
//!
//! 피드백 이벤트 하나를 받아 다음 상태를 바꿉니다:
//! - 프래그먼트 adjustment (긍정 +boost, 부정 -penalty, 범위 클램핑)
//! - 쿼리→프래그먼트 매핑 (긍정만)
//! - 쿼리 캐시 무효화와 부정 카운터, 플래그 (부정만)
//!
//! 검증은 상태 변경 전에 끝나며, 같은 이벤트 ID는 한 번만 적용됩니다.
//! 같은 쿼리 키의 피드백은 직렬화되고, 서로 다른 쿼리는 서로를 막지 않습니다.

mod store;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::cache::ResponseCache;
use crate::config::FeedbackConfig;
use crate::error::{RetrievalError, Result};
use crate::locks::KeyedLocks;
use crate::query::query_key;
use crate::query_log::QueryLog;
use crate::ranking::tokenize;
use crate::scoring::{apply_delta, AdjustmentBounds, FeedbackWeights, FragmentId, Polarity};

pub use store::LearningStore;

/// 비슷한 쿼리에서 온 매핑의 가중치 비율
const SIMILAR_QUERY_FACTOR: f64 = 0.5;

/// 비슷한 쿼리 판정에 쓰는 최소 단어 길이 (초과)
const MIN_SHARED_WORD_LEN: usize = 3;

// ============================================================================
// Events
// ============================================================================

/// 피드백 대상
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeedbackScope {
    /// 프래그먼트 하나
    Fragment(FragmentId),
    /// 응답 전체 (최근 검색 기록의 프래그먼트 전부)
    WholeResponse,
}

/// 피드백 이벤트
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackEvent {
    pub event_id: String,
    pub query_key: String,
    /// 원본 쿼리 텍스트 (없으면 검색 기록에서 찾음)
    pub query: Option<String>,
    pub scope: FeedbackScope,
    pub polarity: Polarity,
    pub timestamp: DateTime<Utc>,
}

impl FeedbackEvent {
    /// 쿼리 텍스트로 새 이벤트 생성 (ID는 UUID v4)
    pub fn new(query: &str, scope: FeedbackScope, polarity: Polarity) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            query_key: query_key(query),
            query: Some(query.to_string()),
            scope,
            polarity,
            timestamp: Utc::now(),
        }
    }

    pub fn with_event_id(mut self, event_id: impl Into<String>) -> Self {
        self.event_id = event_id.into();
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// 피드백 적용 결과
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FeedbackOutcome {
    /// (프래그먼트, 새 adjustment)
    pub fragments_adjusted: Vec<(FragmentId, f64)>,
    pub cache_entries_invalidated: usize,
    pub mapping_learned: bool,
    /// 이번 이벤트로 새로 플래그되었는지
    pub query_flagged: bool,
    /// 캐시 무효화 실패 (학습 상태는 이미 반영됨)
    pub cache_error: Option<String>,
}

// ============================================================================
// State
// ============================================================================

/// 쿼리별 플래그 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlagState {
    Unflagged,
    Flagged,
}

impl FlagState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlagState::Unflagged => "unflagged",
            FlagState::Flagged => "flagged",
        }
    }

    fn from_db(s: &str) -> Self {
        match s {
            "flagged" => FlagState::Flagged,
            _ => FlagState::Unflagged,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryFeedbackState {
    pub query_key: String,
    pub query: String,
    pub state: FlagState,
    /// 보존 기간 내 부정 피드백 수
    pub negative_count: u32,
    pub window_start: Option<DateTime<Utc>>,
    pub last_negative_at: Option<DateTime<Utc>>,
}

impl QueryFeedbackState {
    fn new(query_key: &str, query: &str) -> Self {
        Self {
            query_key: query_key.to_string(),
            query: query.to_string(),
            state: FlagState::Unflagged,
            negative_count: 0,
            window_start: None,
            last_negative_at: None,
        }
    }

    /// 부정 피드백 한 건 기록. 보존 기간이 지났고 플래그 전이면 1부터 다시 셈
    fn record_negative(&mut self, at: DateTime<Utc>, retention: Duration) {
        let window_elapsed = self
            .window_start
            .map(|start| at - start > retention)
            .unwrap_or(true);

        if self.state == FlagState::Unflagged && window_elapsed {
            self.negative_count = 1;
            self.window_start = Some(at);
        } else {
            self.negative_count += 1;
        }
        self.last_negative_at = Some(at);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdjustmentRecord {
    pub fragment_id: FragmentId,
    pub adjustment: f64,
    pub positive_count: u32,
    pub negative_count: u32,
    pub updated_at: DateTime<Utc>,
}

/// 학습된 쿼리→프래그먼트 매핑
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryChunkMapping {
    pub query_key: String,
    pub query: String,
    pub fragment_id: FragmentId,
    /// 긍정 신호 수
    pub weight: u32,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
}

/// 반복적으로 부정 피드백을 받은 쿼리
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlaggedQuery {
    pub id: i64,
    pub query_key: String,
    pub query: String,
    pub negative_count: u32,
    pub flagged_at: DateTime<Utc>,
    pub reason: String,
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LearnerStats {
    pub adjusted_fragments: usize,
    pub boosted_fragments: usize,
    pub penalized_fragments: usize,
    pub active_flags: usize,
    pub resolved_flags: usize,
    pub mapped_queries: usize,
    pub total_mappings: usize,
    pub total_positive_signals: u64,
    pub processed_events: usize,
}

/// 학습 파라미터
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LearnerSettings {
    pub weights: FeedbackWeights,
    pub bounds: AdjustmentBounds,
    pub flag_threshold: u32,
    pub retention: Duration,
}

impl Default for LearnerSettings {
    fn default() -> Self {
        Self {
            weights: FeedbackWeights::default(),
            bounds: AdjustmentBounds::default(),
            flag_threshold: 2,
            retention: Duration::days(30),
        }
    }
}

impl LearnerSettings {
    pub fn from_config(config: &FeedbackConfig) -> Self {
        Self {
            weights: config.weights(),
            bounds: config.bounds(),
            flag_threshold: config.flag_threshold.max(1),
            retention: Duration::days(config.retention_days.max(1)),
        }
    }
}

// ============================================================================
// FeedbackLearner
// ============================================================================

pub struct FeedbackLearner {
    store: LearningStore,
    settings: LearnerSettings,
    /// fragment id -> adjustment (트랜잭션 커밋 후 반영)
    adjustments: DashMap<FragmentId, f64>,
    query_locks: KeyedLocks,
    cache: Option<Arc<ResponseCache>>,
    query_log: Option<Arc<dyn QueryLog>>,
}

impl FeedbackLearner {
    /// 학습 저장소를 열고 adjustment를 메모리로 읽어옴
    pub fn open(path: &Path, settings: LearnerSettings) -> anyhow::Result<Self> {
        let store = LearningStore::open(path)?;

        let adjustments = DashMap::new();
        for record in store.load_adjustments()? {
            adjustments.insert(record.fragment_id, settings.bounds.clamp(record.adjustment));
        }
        tracing::debug!("Loaded {} fragment adjustments", adjustments.len());

        Ok(Self {
            store,
            settings,
            adjustments,
            query_locks: KeyedLocks::new(),
            cache: None,
            query_log: None,
        })
    }

    /// 부정 피드백 시 무효화할 캐시
    pub fn with_cache(mut self, cache: Arc<ResponseCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// 전체 응답 피드백을 풀기 위한 검색 기록
    pub fn with_query_log(mut self, query_log: Arc<dyn QueryLog>) -> Self {
        self.query_log = Some(query_log);
        self
    }

    pub fn settings(&self) -> &LearnerSettings {
        &self.settings
    }

    /// 피드백 이벤트 적용 (유일한 상태 변경 진입점)
    pub fn apply_feedback(&self, event: &FeedbackEvent) -> Result<FeedbackOutcome> {
        if event.event_id.trim().is_empty() {
            return Err(RetrievalError::InvalidFeedbackEvent("empty event id".into()));
        }
        if event.query_key.trim().is_empty() {
            return Err(RetrievalError::InvalidFeedbackEvent("missing query key".into()));
        }

        self.query_locks
            .with_lock(&event.query_key, || self.apply_locked(event))
    }

    fn apply_locked(&self, event: &FeedbackEvent) -> Result<FeedbackOutcome> {
        if self
            .store
            .is_processed(&event.event_id)
            .map_err(RetrievalError::storage)?
        {
            return Err(duplicate(&event.event_id));
        }

        let (fragment_ids, query_text) = self.resolve_targets(event)?;

        // 쿼리 상태는 쿼리 키 락 안에서만 바뀌므로 트랜잭션 밖에서 계산
        let negative = match event.polarity {
            Polarity::Negative => Some(self.plan_negative(event, &query_text)?),
            Polarity::Positive => None,
        };

        // 검증 끝. 이벤트 기록과 모든 상태 변경은 한 트랜잭션
        let delta = self.settings.weights.delta(event.polarity);
        let adjusted = self
            .store
            .write_transaction(
                |tx| {
                    if !LearningStore::claim_event(tx, &event.event_id, &event.query_key, event.timestamp)? {
                        return Ok(None);
                    }

                    let mut adjusted = Vec::with_capacity(fragment_ids.len());
                    for &fragment_id in &fragment_ids {
                        let next = apply_delta(self.adjustment(fragment_id), delta, self.settings.bounds);
                        LearningStore::save_adjustment(
                            tx,
                            fragment_id,
                            next,
                            event.polarity,
                            event.timestamp,
                        )?;
                        adjusted.push((fragment_id, next));
                    }

                    if event.polarity == Polarity::Positive {
                        for &fragment_id in &fragment_ids {
                            LearningStore::strengthen_mapping(
                                tx,
                                &event.query_key,
                                &query_text,
                                fragment_id,
                                event.timestamp,
                            )?;
                        }
                    }

                    if let Some((state, flag)) = &negative {
                        LearningStore::save_query_state(tx, state)?;
                        if let Some(flag) = flag {
                            LearningStore::insert_flag(tx, flag)?;
                        }
                    }

                    Ok(Some(adjusted))
                },
                |adjusted| {
                    for (fragment_id, value) in adjusted.iter().flatten() {
                        self.adjustments.insert(*fragment_id, *value);
                    }
                },
            )
            .map_err(RetrievalError::storage)?
            .ok_or_else(|| duplicate(&event.event_id))?;

        for (fragment_id, value) in &adjusted {
            tracing::debug!("Fragment {} adjustment -> {:.3}", fragment_id, value);
        }

        let mut outcome = FeedbackOutcome {
            mapping_learned: event.polarity == Polarity::Positive && !adjusted.is_empty(),
            fragments_adjusted: adjusted,
            ..Default::default()
        };

        if let Some((state, flag)) = negative {
            if let Some(flag) = flag {
                tracing::warn!("Query flagged for review: {} ({})", state.query, flag.reason);
                outcome.query_flagged = true;
            }

            if let Some(cache) = &self.cache {
                match cache.invalidate_query(&event.query_key) {
                    Ok(count) => outcome.cache_entries_invalidated = count,
                    Err(e) => {
                        tracing::warn!(
                            "Cache invalidation failed for query {}: {}",
                            event.query_key,
                            e
                        );
                        outcome.cache_error = Some(e.to_string());
                    }
                }
            }
        }

        tracing::info!(
            "Applied {} feedback {} for query {} ({} fragments)",
            event.polarity.as_str(),
            event.event_id,
            event.query_key,
            outcome.fragments_adjusted.len()
        );

        Ok(outcome)
    }

    /// 이벤트가 가리키는 프래그먼트와 쿼리 텍스트
    fn resolve_targets(&self, event: &FeedbackEvent) -> Result<(Vec<FragmentId>, String)> {
        match event.scope {
            FeedbackScope::Fragment(id) => {
                let query = match &event.query {
                    Some(q) => q.clone(),
                    None => self
                        .latest_record(&event.query_key)?
                        .map(|r| r.query)
                        .unwrap_or_default(),
                };
                Ok((vec![id], query))
            }
            FeedbackScope::WholeResponse => {
                let record = self.latest_record(&event.query_key)?.ok_or_else(|| {
                    RetrievalError::InvalidFeedbackEvent(format!(
                        "no query record for {}",
                        event.query_key
                    ))
                })?;

                if record.fragment_ids.is_empty() {
                    return Err(RetrievalError::InvalidFeedbackEvent(format!(
                        "query record for {} has no fragments",
                        event.query_key
                    )));
                }

                let mut ids = record.fragment_ids.clone();
                let mut seen = std::collections::HashSet::new();
                ids.retain(|id| seen.insert(*id));

                Ok((ids, event.query.clone().unwrap_or(record.query)))
            }
        }
    }

    fn latest_record(&self, query_key: &str) -> Result<Option<crate::query_log::QueryRecord>> {
        match &self.query_log {
            Some(log) => log
                .latest_for_query(query_key)
                .map_err(RetrievalError::storage),
            None => Ok(None),
        }
    }

    /// 부정 피드백 한 건 뒤의 쿼리 상태와, 새로 생길 플래그
    fn plan_negative(
        &self,
        event: &FeedbackEvent,
        query_text: &str,
    ) -> Result<(QueryFeedbackState, Option<FlaggedQuery>)> {
        let mut state = self
            .store
            .load_query_state(&event.query_key)
            .map_err(RetrievalError::storage)?
            .unwrap_or_else(|| QueryFeedbackState::new(&event.query_key, query_text));

        if state.query.is_empty() {
            state.query = query_text.to_string();
        }
        state.record_negative(event.timestamp, self.settings.retention);

        if state.state == FlagState::Flagged || state.negative_count < self.settings.flag_threshold {
            return Ok((state, None));
        }

        let flag = FlaggedQuery {
            id: 0,
            query_key: event.query_key.clone(),
            query: state.query.clone(),
            negative_count: state.negative_count,
            flagged_at: event.timestamp,
            reason: format!(
                "{} negative feedback signals within {} days",
                state.negative_count,
                self.settings.retention.num_days()
            ),
            resolved_at: None,
        };
        state.state = FlagState::Flagged;

        Ok((state, Some(flag)))
    }

    /// 운영자 조치: 플래그 해결 (기록은 유지)
    pub fn resolve_flag(&self, query_key: &str) -> Result<bool> {
        self.query_locks.with_lock(query_key, || {
            let state = self
                .store
                .load_query_state(query_key)
                .map_err(RetrievalError::storage)?;

            let resolved = self
                .store
                .write_transaction(
                    |tx| {
                        let resolved = LearningStore::resolve_flags(tx, query_key, Utc::now())?;
                        if let Some(mut state) = state {
                            state.state = FlagState::Unflagged;
                            state.negative_count = 0;
                            state.window_start = None;
                            LearningStore::save_query_state(tx, &state)?;
                        }
                        Ok(resolved)
                    },
                    |_| {},
                )
                .map_err(RetrievalError::storage)?;

            if resolved > 0 {
                tracing::info!("Resolved flag for query {}", query_key);
            }
            Ok(resolved > 0)
        })
    }

    // ------------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------------

    pub fn adjustment(&self, fragment_id: FragmentId) -> f64 {
        self.adjustments
            .get(&fragment_id)
            .map(|v| *v)
            .unwrap_or(0.0)
    }

    /// 0이 아닌 adjustment만 반환
    pub fn adjustments_for(&self, ids: &[FragmentId]) -> HashMap<FragmentId, f64> {
        ids.iter()
            .filter_map(|id| {
                self.adjustments
                    .get(id)
                    .map(|v| (*id, *v))
                    .filter(|(_, v)| *v != 0.0)
            })
            .collect()
    }

    pub fn flag_state(&self, query_key: &str) -> Result<FlagState> {
        Ok(self
            .store
            .load_query_state(query_key)
            .map_err(RetrievalError::storage)?
            .map(|s| s.state)
            .unwrap_or(FlagState::Unflagged))
    }

    pub fn flagged_queries(&self, include_resolved: bool) -> Result<Vec<FlaggedQuery>> {
        self.store
            .flagged_queries(include_resolved)
            .map_err(RetrievalError::storage)
    }

    pub fn mappings_for(&self, query_key: &str) -> Result<Vec<QueryChunkMapping>> {
        self.store
            .mappings_for(query_key)
            .map_err(RetrievalError::storage)
    }

    /// 학습된 매핑에서 프래그먼트 가중치 계산 (내림차순)
    ///
    /// 같은 쿼리 키의 매핑은 가중치 그대로, 4자 이상 단어를 공유하는
    /// 다른 쿼리의 매핑은 절반으로 합산합니다.
    pub fn learned_boosts(&self, query_key: &str, query: &str) -> Result<Vec<(FragmentId, f64)>> {
        let words: std::collections::HashSet<String> = tokenize(query)
            .into_iter()
            .filter(|w| w.chars().count() > MIN_SHARED_WORD_LEN)
            .collect();

        let mappings = self.store.all_mappings().map_err(RetrievalError::storage)?;

        let mut boosts: HashMap<FragmentId, f64> = HashMap::new();
        for mapping in mappings {
            let factor = if mapping.query_key == query_key {
                1.0
            } else if !words.is_empty()
                && tokenize(&mapping.query).iter().any(|w| words.contains(w))
            {
                SIMILAR_QUERY_FACTOR
            } else {
                continue;
            };
            *boosts.entry(mapping.fragment_id).or_default() += factor * mapping.weight as f64;
        }

        let mut ranked: Vec<_> = boosts.into_iter().collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        Ok(ranked)
    }

    pub fn stats(&self) -> Result<LearnerStats> {
        self.store.stats().map_err(RetrievalError::storage)
    }
}

fn duplicate(event_id: &str) -> RetrievalError {
    RetrievalError::InvalidFeedbackEvent(format!("duplicate event id: {}", event_id))
}

// ============================================================================
// Tests
// ============================================================================
