//! Fusion Engine - RRF (Reciprocal Rank Fusion) 통합
//!
//! 여러 랭커의 순위를 하나로 합칩니다. 각 목록에서의 기여는
//! `1 / (k + rank)` (rank는 1부터)이고, 목록에 없으면 0입니다.
//! 여기에 프래그먼트의 피드백 adjustment를 더해 최종 스코어를 만듭니다.
//!
//! ref: https://www.elastic.co/blog/hybrid-search-rrf
//! ref: Cormack et al. (2009), "Reciprocal Rank Fusion outperforms Condorcet"

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use crate::ranking::{RankedResult, RankerTag};
use crate::scoring::{AdjustmentBounds, FragmentId};

/// RRF 상수 기본값
pub const DEFAULT_RRF_CONSTANT: f64 = 60.0;

/// 퓨전 결과 항목
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FusedResult {
    pub fragment_id: FragmentId,
    /// rrf_score + adjustment
    pub score: f64,
    pub rrf_score: f64,
    /// 적용된 (클램핑된) adjustment
    pub adjustment: f64,
    /// 랭커별 순위
    pub ranks: Vec<(RankerTag, usize)>,
    /// 모든 목록 중 가장 좋은 순위
    pub best_rank: usize,
}

impl FusedResult {
    pub fn rank_in(&self, tag: RankerTag) -> Option<usize> {
        self.ranks.iter().find(|(t, _)| *t == tag).map(|(_, r)| *r)
    }
}

/// RRF 퓨전 엔진
///
/// 순위 목록 수와 출처에 무관하게 동작합니다.
#[derive(Debug, Clone, Copy)]
pub struct FusionEngine {
    constant: f64,
    bounds: AdjustmentBounds,
}

impl Default for FusionEngine {
    fn default() -> Self {
        Self::new(DEFAULT_RRF_CONSTANT, AdjustmentBounds::default())
    }
}

impl FusionEngine {
    pub fn new(constant: f64, bounds: AdjustmentBounds) -> Self {
        Self { constant, bounds }
    }

    pub fn constant(&self) -> f64 {
        self.constant
    }

    /// 순위 목록들을 합쳐 상위 `top_k` 반환
    ///
    /// 정렬: 최종 스코어 내림차순, 같으면 최고 순위 오름차순, 그 다음 id 오름차순.
    /// 한 목록에 같은 id가 여러 번 있으면 첫 항목만 셉니다.
    pub fn fuse(
        &self,
        rankings: &[Vec<RankedResult>],
        adjustments: &HashMap<FragmentId, f64>,
        top_k: usize,
    ) -> Vec<FusedResult> {
        // fragment_id -> (rrf, ranks)
        let mut merged: HashMap<FragmentId, (f64, Vec<(RankerTag, usize)>)> = HashMap::new();

        for list in rankings {
            let mut seen = HashSet::new();
            for (position, result) in list.iter().enumerate() {
                if !seen.insert(result.fragment_id) {
                    continue;
                }
                // 목록 내 위치로 순위를 다시 매기지 않고, 랭커가 준 순위를 믿음
                let rank = if result.rank == 0 { position + 1 } else { result.rank };
                let entry = merged.entry(result.fragment_id).or_insert((0.0, Vec::new()));
                entry.0 += 1.0 / (self.constant + rank as f64);
                entry.1.push((result.source, rank));
            }
        }

        let mut fused: Vec<FusedResult> = merged
            .into_iter()
            .map(|(fragment_id, (rrf_score, ranks))| {
                let adjustment = adjustments
                    .get(&fragment_id)
                    .map(|a| self.bounds.clamp(*a))
                    .unwrap_or(0.0);
                let best_rank = ranks.iter().map(|(_, r)| *r).min().unwrap_or(usize::MAX);
                FusedResult {
                    fragment_id,
                    score: rrf_score + adjustment,
                    rrf_score,
                    adjustment,
                    ranks,
                    best_rank,
                }
            })
            .collect();

        fused.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then(a.best_rank.cmp(&b.best_rank))
                .then(a.fragment_id.cmp(&b.fragment_id))
        });
        fused.truncate(top_k);

        tracing::debug!(
            "Fused {} rankings into {} results",
            rankings.len(),
            fused.len()
        );

        fused
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ranking::into_ranked;
    use proptest::prelude::*;

    fn ranking(tag: RankerTag, ids: &[FragmentId]) -> Vec<RankedResult> {
        into_ranked(tag, ids.iter().map(|id| (*id, 1.0)))
    }

    fn ids(results: &[FusedResult]) -> Vec<FragmentId> {
        results.iter().map(|r| r.fragment_id).collect()
    }

    #[test]
    fn test_two_list_fusion() {
        let engine = FusionEngine::default();
        let lexical = ranking(RankerTag::Lexical, &[7, 2, 9]);
        let semantic = ranking(RankerTag::Semantic, &[2, 7, 15]);

        let results = engine.fuse(&[lexical, semantic], &HashMap::new(), 10);

        // F2와 F7은 1/61 + 1/62로 같고, 최고 순위도 같아 id로 결정
        assert_eq!(ids(&results), vec![2, 7, 9, 15]);
        assert!((results[0].score - (1.0 / 61.0 + 1.0 / 62.0)).abs() < 1e-12);
        assert_eq!(results[0].score, results[1].score);
        assert_eq!(results[0].rank_in(RankerTag::Lexical), Some(2));
        assert_eq!(results[0].rank_in(RankerTag::Semantic), Some(1));
        assert_eq!(results[2].rank_in(RankerTag::Semantic), None);
    }

    #[test]
    fn test_negative_adjustment_drops_fragment() {
        let engine = FusionEngine::default();
        let lexical = ranking(RankerTag::Lexical, &[7, 2, 9]);
        let semantic = ranking(RankerTag::Semantic, &[2, 7, 15]);
        let adjustments = HashMap::from([(9, -0.15)]);

        let results = engine.fuse(&[lexical, semantic], &adjustments, 10);

        assert_eq!(ids(&results), vec![2, 7, 15, 9]);
        let f9 = &results[3];
        assert_eq!(f9.adjustment, -0.15);
        assert!((f9.score - (1.0 / 63.0 - 0.15)).abs() < 1e-12);
    }

    #[test]
    fn test_adjustment_is_clamped() {
        let engine = FusionEngine::default();
        let list = ranking(RankerTag::Lexical, &[1, 2]);
        let adjustments = HashMap::from([(2, 3.0)]);

        let results = engine.fuse(&[list], &adjustments, 10);
        assert_eq!(results[0].fragment_id, 2);
        assert_eq!(results[0].adjustment, 0.5);
    }

    #[test]
    fn test_single_list_is_verbatim() {
        let engine = FusionEngine::default();
        let list = ranking(RankerTag::Lexical, &[42, 3, 17, 8]);

        let results = engine.fuse(&[list], &HashMap::new(), 10);
        assert_eq!(ids(&results), vec![42, 3, 17, 8]);
    }

    #[test]
    fn test_empty_and_truncated() {
        let engine = FusionEngine::default();
        assert!(engine.fuse(&[], &HashMap::new(), 5).is_empty());
        assert!(engine.fuse(&[vec![], vec![]], &HashMap::new(), 5).is_empty());

        let list = ranking(RankerTag::Lexical, &[1, 2, 3, 4]);
        assert_eq!(engine.fuse(&[list], &HashMap::new(), 2).len(), 2);
    }

    #[test]
    fn test_ties_prefer_best_rank() {
        // 상수 0이면 1/1 == 1/2 + 1/2 로 정확한 동점
        let engine = FusionEngine::new(0.0, AdjustmentBounds::default());
        let a = ranking(RankerTag::Lexical, &[50, 3]);
        let b = ranking(RankerTag::Semantic, &[60, 3]);

        let results = engine.fuse(&[a, b], &HashMap::new(), 10);
        assert_eq!(ids(&results), vec![50, 60, 3]);
        assert_eq!(results[2].score, results[0].score);
        assert_eq!(results[2].best_rank, 2);
    }

    proptest! {
        #[test]
        fn prop_no_duplicates_and_bounded(
            lists in proptest::collection::vec(proptest::collection::vec(0i64..30, 0..15), 0..4),
            top_k in 0usize..20,
        ) {
            let engine = FusionEngine::default();
            let rankings: Vec<_> = lists
                .iter()
                .map(|ids| ids.iter().enumerate().map(|(i, id)| RankedResult {
                    fragment_id: *id,
                    rank: i + 1,
                    score: 1.0,
                    source: RankerTag::Lexical,
                }).collect::<Vec<_>>())
                .collect();

            let results = engine.fuse(&rankings, &HashMap::new(), top_k);
            prop_assert!(results.len() <= top_k);

            let unique: HashSet<_> = results.iter().map(|r| r.fragment_id).collect();
            prop_assert_eq!(unique.len(), results.len());

            for pair in results.windows(2) {
                prop_assert!(pair[0].score >= pair[1].score);
            }
        }
    }
}
