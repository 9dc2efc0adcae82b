//! Ranking 모듈 - 순위 소스 공통 인터페이스
//!
//! 각 랭커(렉시컬, 시맨틱, 히스토리)는 같은 [`RankingQuery`]를 받아
//! 프래그먼트 순위를 만듭니다. 퓨전 엔진은 랭커 종류를 모릅니다.

mod history;
mod lexical;
mod semantic;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::Result;
use crate::scoring::FragmentId;

pub use history::HistoryRanker;
pub use lexical::{tokenize, Bm25Params, LexicalRanker, WeightedTerm};
pub use semantic::SemanticRanker;

// ============================================================================
// Types
// ============================================================================

/// 순위를 만든 랭커
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RankerTag {
    Lexical,
    Semantic,
    History,
}

impl RankerTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            RankerTag::Lexical => "lexical",
            RankerTag::Semantic => "semantic",
            RankerTag::History => "history",
        }
    }
}

impl std::fmt::Display for RankerTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 랭커 하나의 결과 항목
#[derive(Debug, Clone, PartialEq)]
pub struct RankedResult {
    pub fragment_id: FragmentId,
    /// 1부터 시작하는 순위
    pub rank: usize,
    /// 랭커 고유 스코어 (BM25, 유사도, 매핑 가중치)
    pub score: f64,
    pub source: RankerTag,
}

/// 모든 랭커에 전달되는 쿼리
#[derive(Debug, Clone, Default)]
pub struct RankingQuery {
    /// 원본 쿼리 텍스트
    pub text: String,
    pub query_key: String,
    /// 렉시컬 검색 용어 (원본 + 확장)
    pub terms: Vec<WeightedTerm>,
    /// 시맨틱 검색 벡터 (임베딩 실패 시 None)
    pub embedding: Option<Vec<f32>>,
    /// 랭커별 최대 후보 수
    pub limit: usize,
}

// ============================================================================
// RankingSource Trait
// ============================================================================

/// 순위 소스
#[async_trait]
pub trait RankingSource: Send + Sync {
    fn tag(&self) -> RankerTag;

    /// 관련도 내림차순 순위 생성
    async fn produce_ranking(&self, query: &RankingQuery) -> Result<Vec<RankedResult>>;
}

/// (id, score) 목록을 1부터 시작하는 순위로 변환
///
/// 입력은 이미 정렬되어 있어야 하며, 중복 id는 첫 항목만 남깁니다.
pub fn into_ranked(tag: RankerTag, scored: impl IntoIterator<Item = (FragmentId, f64)>) -> Vec<RankedResult> {
    let mut seen = std::collections::HashSet::new();
    scored
        .into_iter()
        .filter(|(id, _)| seen.insert(*id))
        .enumerate()
        .map(|(i, (fragment_id, score))| RankedResult {
            fragment_id,
            rank: i + 1,
            score,
            source: tag,
        })
        .collect()
}
