//! 렉시컬 랭커 - 인메모리 BM25
//!
//! 인덱스는 통째로 재구축된 뒤 원자적으로 교체됩니다. 읽는 쪽은 항상
//! 완성된 인덱스의 `Arc`를 복제해 사용하므로 재구축 중에도 막히지 않습니다.
//!
//! 코퍼스 변경은 자동 감지하지 않습니다. 수집 후 호출자가 `mark_stale()`을
//! 호출하면, `rebuild`가 끝날 때까지 `rank`는 `IndexStale`을 반환합니다.
//!
//! ref: Robertson & Zaragoza (2009), "The Probabilistic Relevance Framework: BM25 and Beyond"

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, RwLock};

use async_trait::async_trait;
use regex::Regex;

use super::{into_ranked, RankedResult, RankerTag, RankingQuery, RankingSource};
use crate::error::{RetrievalError, Result};
use crate::knowledge::{Fragment, FragmentSource};
use crate::scoring::FragmentId;

// ============================================================================
// Tokenization
// ============================================================================

fn word_regex() -> &'static Regex {
    static WORD: OnceLock<Regex> = OnceLock::new();
    WORD.get_or_init(|| Regex::new(r"\w+").expect("valid word regex"))
}

/// 소문자 단어 토큰 추출
pub fn tokenize(text: &str) -> Vec<String> {
    let lowered = text.to_lowercase();
    word_regex()
        .find_iter(&lowered)
        .map(|m| m.as_str().to_string())
        .collect()
}

/// 가중치가 있는 검색 용어
#[derive(Debug, Clone, PartialEq)]
pub struct WeightedTerm {
    pub term: String,
    pub weight: f64,
}

impl WeightedTerm {
    pub fn new(term: impl Into<String>, weight: f64) -> Self {
        Self {
            term: term.into(),
            weight,
        }
    }

    /// 쿼리 텍스트의 모든 토큰을 가중치 1.0으로
    pub fn from_query(query: &str) -> Vec<WeightedTerm> {
        tokenize(query)
            .into_iter()
            .map(|t| WeightedTerm::new(t, 1.0))
            .collect()
    }
}

// ============================================================================
// BM25 Index
// ============================================================================

/// BM25 파라미터
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bm25Params {
    pub k1: f64,
    pub b: f64,
}

impl Default for Bm25Params {
    fn default() -> Self {
        Self { k1: 1.5, b: 0.75 }
    }
}

/// 불변 BM25 인덱스 스냅샷
#[derive(Debug, Default)]
struct Bm25Index {
    doc_ids: Vec<FragmentId>,
    doc_lens: Vec<usize>,
    avg_doc_len: f64,
    /// term -> [(doc index, term frequency)]
    postings: HashMap<String, Vec<(usize, u32)>>,
    /// 이 스냅샷을 만든 시점의 코퍼스 세대
    generation: u64,
}

impl Bm25Index {
    fn build(fragments: &[Fragment], generation: u64) -> Self {
        let mut doc_ids = Vec::with_capacity(fragments.len());
        let mut doc_lens = Vec::with_capacity(fragments.len());
        let mut postings: HashMap<String, Vec<(usize, u32)>> = HashMap::new();

        for (doc_idx, fragment) in fragments.iter().enumerate() {
            let mut text = fragment.content.clone();
            if let Some(title) = &fragment.title {
                text.push(' ');
                text.push_str(title);
            }
            let tokens = tokenize(&text);

            let mut tf: HashMap<String, u32> = HashMap::new();
            for token in &tokens {
                *tf.entry(token.clone()).or_default() += 1;
            }
            for (term, freq) in tf {
                postings.entry(term).or_default().push((doc_idx, freq));
            }

            doc_ids.push(fragment.id);
            doc_lens.push(tokens.len());
        }

        let avg_doc_len = if doc_lens.is_empty() {
            0.0
        } else {
            doc_lens.iter().sum::<usize>() as f64 / doc_lens.len() as f64
        };

        Self {
            doc_ids,
            doc_lens,
            avg_doc_len,
            postings,
            generation,
        }
    }

    /// 항상 양수인 IDF: ln(1 + (N - n + 0.5) / (n + 0.5))
    fn idf(&self, doc_freq: usize) -> f64 {
        let n = self.doc_ids.len() as f64;
        let df = doc_freq as f64;
        (1.0 + (n - df + 0.5) / (df + 0.5)).ln()
    }

    fn score(&self, terms: &[WeightedTerm], params: Bm25Params) -> Vec<(FragmentId, f64)> {
        // 같은 용어는 가장 높은 가중치 하나만. 합산 순서가 고정되도록 정렬된 맵
        let mut unique: BTreeMap<&str, f64> = BTreeMap::new();
        for t in terms {
            if t.term.is_empty() || t.weight <= 0.0 {
                continue;
            }
            let w = unique.entry(t.term.as_str()).or_insert(0.0);
            *w = w.max(t.weight);
        }

        let mut scores: HashMap<usize, f64> = HashMap::new();
        for (term, weight) in unique {
            let Some(postings) = self.postings.get(term) else {
                continue;
            };
            let idf = self.idf(postings.len());

            for &(doc_idx, tf) in postings {
                let tf = tf as f64;
                let len_norm = if self.avg_doc_len > 0.0 {
                    self.doc_lens[doc_idx] as f64 / self.avg_doc_len
                } else {
                    1.0
                };
                let denom = tf + params.k1 * (1.0 - params.b + params.b * len_norm);
                *scores.entry(doc_idx).or_default() += weight * idf * tf * (params.k1 + 1.0) / denom;
            }
        }

        let mut results: Vec<(FragmentId, f64)> = scores
            .into_iter()
            .filter(|(_, s)| *s > 0.0)
            .map(|(idx, s)| (self.doc_ids[idx], s))
            .collect();

        results.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        results
    }
}

// ============================================================================
// LexicalRanker
// ============================================================================

/// BM25 렉시컬 랭커
pub struct LexicalRanker {
    index: RwLock<Arc<Bm25Index>>,
    /// 코퍼스 세대 (mark_stale마다 증가)
    generation: AtomicU64,
    params: Bm25Params,
}

impl Default for LexicalRanker {
    fn default() -> Self {
        Self::new(Bm25Params::default())
    }
}

impl LexicalRanker {
    /// 빈 (아직 빌드되지 않은 = stale) 랭커
    pub fn new(params: Bm25Params) -> Self {
        Self {
            index: RwLock::new(Arc::new(Bm25Index::default())),
            generation: AtomicU64::new(1),
            params,
        }
    }

    fn snapshot(&self) -> Arc<Bm25Index> {
        match self.index.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// 코퍼스가 바뀌었음을 알림
    pub fn mark_stale(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    pub fn is_stale(&self) -> bool {
        self.snapshot().generation != self.generation.load(Ordering::SeqCst)
    }

    /// 인덱스된 프래그먼트 수
    pub fn len(&self) -> usize {
        self.snapshot().doc_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 주어진 프래그먼트로 인덱스를 새로 만들어 교체
    ///
    /// 호출 시점의 세대로 기록되므로, 빌드 도중 `mark_stale()`이 호출되면
    /// 교체 후에도 stale 상태가 유지됩니다.
    pub fn rebuild(&self, fragments: &[Fragment]) -> usize {
        let generation = self.generation.load(Ordering::SeqCst);
        self.install(Bm25Index::build(fragments, generation))
    }

    /// 지식 저장소에서 전체 프래그먼트를 읽어 재구축
    pub fn rebuild_from(&self, source: &dyn FragmentSource) -> anyhow::Result<usize> {
        let generation = self.generation.load(Ordering::SeqCst);
        let fragments = source.list_fragments()?;
        Ok(self.install(Bm25Index::build(&fragments, generation)))
    }

    fn install(&self, index: Bm25Index) -> usize {
        let count = index.doc_ids.len();
        let generation = index.generation;
        let fresh = Arc::new(index);

        match self.index.write() {
            Ok(mut guard) => *guard = fresh,
            Err(poisoned) => *poisoned.into_inner() = fresh,
        }

        tracing::info!(
            "Rebuilt lexical index with {} fragments (generation {})",
            count,
            generation
        );
        count
    }

    /// 가중치 용어로 검색
    ///
    /// 빈 쿼리는 에러가 아니라 빈 결과입니다.
    pub fn rank(&self, terms: &[WeightedTerm], limit: usize) -> Result<Vec<RankedResult>> {
        let index = self.snapshot();
        if index.generation != self.generation.load(Ordering::SeqCst) {
            return Err(RetrievalError::IndexStale);
        }

        if terms.is_empty() || limit == 0 {
            return Ok(vec![]);
        }

        let mut scored = index.score(terms, self.params);
        scored.truncate(limit);

        Ok(into_ranked(RankerTag::Lexical, scored))
    }
}

#[async_trait]
impl RankingSource for LexicalRanker {
    fn tag(&self) -> RankerTag {
        RankerTag::Lexical
    }

    async fn produce_ranking(&self, query: &RankingQuery) -> Result<Vec<RankedResult>> {
        self.rank(&query.terms, query.limit)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn fragment(id: FragmentId, content: &str) -> Fragment {
        Fragment {
            id,
            source: format!("doc-{}", id),
            title: None,
            content: content.to_string(),
            created_at: Utc::now(),
        }
    }

    fn corpus() -> Vec<Fragment> {
        vec![
            fragment(1, "We offer cloud migration and consulting services"),
            fragment(2, "Our pricing model is transparent"),
            fragment(3, "Salesforce consulting and low code platform delivery"),
            fragment(4, "The office is located in Lisbon"),
        ]
    }

    fn built() -> LexicalRanker {
        let ranker = LexicalRanker::default();
        ranker.rebuild(&corpus());
        ranker
    }

    #[test]
    fn test_tokenize() {
        assert_eq!(tokenize("What's X's Low-Code offer?"), vec!["what", "s", "x", "s", "low", "code", "offer"]);
        assert!(tokenize("  ").is_empty());
    }

    #[test]
    fn test_never_built_index_is_stale() {
        let ranker = LexicalRanker::default();
        assert!(ranker.is_stale());
        assert!(matches!(
            ranker.rank(&WeightedTerm::from_query("pricing"), 5),
            Err(RetrievalError::IndexStale)
        ));
    }

    #[test]
    fn test_rank_orders_by_relevance() {
        let ranker = built();
        let results = ranker.rank(&WeightedTerm::from_query("consulting services"), 10).unwrap();

        assert_eq!(results[0].fragment_id, 1);
        assert_eq!(results[1].fragment_id, 3);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].rank, 1);
        assert!(results[0].score > results[1].score);
    }

    #[test]
    fn test_empty_query_returns_empty() {
        let ranker = built();
        assert!(ranker.rank(&[], 10).unwrap().is_empty());
        assert!(ranker.rank(&WeightedTerm::from_query("   "), 10).unwrap().is_empty());
    }

    #[test]
    fn test_deterministic_for_same_corpus() {
        let a = built();
        let b = built();
        let terms = WeightedTerm::from_query("consulting pricing lisbon");
        assert_eq!(a.rank(&terms, 10).unwrap(), b.rank(&terms, 10).unwrap());
    }

    #[test]
    fn test_term_order_does_not_change_scores() {
        let ranker = LexicalRanker::default();
        ranker.rebuild(&[
            fragment(1, "cloud consulting delivery pricing"),
            fragment(2, "delivery pricing cloud consulting"),
            fragment(3, "consulting cloud pricing platform delivery model"),
        ]);

        let forward = WeightedTerm::from_query("cloud consulting delivery pricing");
        let mut backward = forward.clone();
        backward.reverse();

        let a = ranker.rank(&forward, 10).unwrap();
        let b = ranker.rank(&backward, 10).unwrap();
        assert_eq!(a, b);
        // 같은 용어 구성의 두 문서는 비트 단위로 같은 점수
        assert_eq!(a[0].score, a[1].score);
        assert_eq!((a[0].fragment_id, a[1].fragment_id), (1, 2));
    }

    #[test]
    fn test_ties_break_by_fragment_id() {
        let ranker = LexicalRanker::default();
        ranker.rebuild(&[fragment(9, "alpha beta"), fragment(4, "alpha beta"), fragment(6, "gamma")]);

        let ids: Vec<_> = ranker
            .rank(&WeightedTerm::from_query("alpha"), 10)
            .unwrap()
            .iter()
            .map(|r| r.fragment_id)
            .collect();
        assert_eq!(ids, vec![4, 9]);
    }

    #[test]
    fn test_expanded_terms_weigh_less() {
        let ranker = built();
        let terms = vec![
            WeightedTerm::new("pricing", 0.5),
            WeightedTerm::new("lisbon", 1.0),
        ];
        let results = ranker.rank(&terms, 10).unwrap();
        assert_eq!(results[0].fragment_id, 4);
        assert_eq!(results[1].fragment_id, 2);
    }

    #[test]
    fn test_mark_stale_until_rebuild() {
        let ranker = built();
        assert!(!ranker.is_stale());

        ranker.mark_stale();
        assert!(matches!(
            ranker.rank(&WeightedTerm::from_query("pricing"), 5),
            Err(RetrievalError::IndexStale)
        ));

        let mut fragments = corpus();
        fragments.push(fragment(5, "New pricing tiers announced"));
        assert_eq!(ranker.rebuild(&fragments), 5);

        let results = ranker.rank(&WeightedTerm::from_query("pricing"), 5).unwrap();
        assert_eq!(results.len(), 2);
    }

    #[test]
    fn test_limit_truncates() {
        let ranker = built();
        let results = ranker
            .rank(&WeightedTerm::from_query("consulting services pricing lisbon"), 2)
            .unwrap();
        assert_eq!(results.len(), 2);
    }

    #[tokio::test]
    async fn test_produce_ranking_uses_query_terms() {
        let ranker = built();
        let query = RankingQuery {
            text: "pricing".into(),
            terms: WeightedTerm::from_query("pricing"),
            limit: 5,
            ..Default::default()
        };
        let results = ranker.produce_ranking(&query).await.unwrap();
        assert_eq!(results[0].fragment_id, 2);
    }
}
