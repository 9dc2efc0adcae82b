//! 시맨틱 랭커 - 벡터 최근접 검색 어댑터

use std::sync::Arc;

use async_trait::async_trait;

use super::{into_ranked, RankedResult, RankerTag, RankingQuery, RankingSource};
use crate::error::{RetrievalError, Result};
use crate::knowledge::VectorStore;

/// 벡터 저장소 기반 랭커
///
/// 임베딩이 없거나 벡터 검색이 실패하면 `EmbeddingUnavailable`을 반환합니다.
/// 엔진은 이 경우 렉시컬 순위만으로 퓨전합니다.
pub struct SemanticRanker {
    store: Arc<dyn VectorStore>,
}

impl SemanticRanker {
    pub fn new(store: Arc<dyn VectorStore>) -> Self {
        Self { store }
    }

    /// 임베딩으로 k개 최근접 프래그먼트 검색
    pub async fn rank(&self, embedding: &[f32], k: usize) -> Result<Vec<RankedResult>> {
        if k == 0 {
            return Ok(vec![]);
        }

        let hits = self
            .store
            .search(embedding, k)
            .await
            .map_err(|e| RetrievalError::EmbeddingUnavailable(format!("vector search failed: {:#}", e)))?;

        tracing::debug!("Semantic search returned {} hits", hits.len());

        let mut scored: Vec<_> = hits
            .into_iter()
            .map(|hit| (hit.fragment_id, hit.similarity as f64))
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        scored.truncate(k);

        Ok(into_ranked(RankerTag::Semantic, scored))
    }
}

#[async_trait]
impl RankingSource for SemanticRanker {
    fn tag(&self) -> RankerTag {
        RankerTag::Semantic
    }

    async fn produce_ranking(&self, query: &RankingQuery) -> Result<Vec<RankedResult>> {
        let embedding = query.embedding.as_deref().ok_or_else(|| {
            RetrievalError::EmbeddingUnavailable("no query embedding".to_string())
        })?;
        self.rank(embedding, query.limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::{cosine_similarity, VectorEntry, VectorHit};
    use crate::scoring::FragmentId;
    use anyhow::bail;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemoryVectors {
        entries: Mutex<Vec<VectorEntry>>,
    }

    #[async_trait]
    impl VectorStore for MemoryVectors {
        async fn insert_batch(&self, entries: &[VectorEntry]) -> anyhow::Result<usize> {
            self.entries.lock().unwrap().extend_from_slice(entries);
            Ok(entries.len())
        }

        async fn search(&self, query: &[f32], limit: usize) -> anyhow::Result<Vec<VectorHit>> {
            let entries = self.entries.lock().unwrap();
            let mut hits: Vec<_> = entries
                .iter()
                .map(|e| VectorHit {
                    fragment_id: e.fragment_id,
                    similarity: cosine_similarity(query, &e.embedding),
                })
                .collect();
            hits.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
            hits.truncate(limit);
            Ok(hits)
        }

        async fn delete_by_fragment(&self, fragment_id: FragmentId) -> anyhow::Result<usize> {
            let mut entries = self.entries.lock().unwrap();
            let before = entries.len();
            entries.retain(|e| e.fragment_id != fragment_id);
            Ok(before - entries.len())
        }

        async fn count(&self) -> anyhow::Result<usize> {
            Ok(self.entries.lock().unwrap().len())
        }
    }

    struct BrokenVectors;

    #[async_trait]
    impl VectorStore for BrokenVectors {
        async fn insert_batch(&self, _: &[VectorEntry]) -> anyhow::Result<usize> {
            bail!("offline")
        }
        async fn search(&self, _: &[f32], _: usize) -> anyhow::Result<Vec<VectorHit>> {
            bail!("offline")
        }
        async fn delete_by_fragment(&self, _: FragmentId) -> anyhow::Result<usize> {
            bail!("offline")
        }
        async fn count(&self) -> anyhow::Result<usize> {
            bail!("offline")
        }
    }

    async fn seeded() -> SemanticRanker {
        let store = MemoryVectors::default();
        store
            .insert_batch(&[
                VectorEntry { fragment_id: 1, embedding: vec![1.0, 0.0] },
                VectorEntry { fragment_id: 2, embedding: vec![0.7, 0.7] },
                VectorEntry { fragment_id: 3, embedding: vec![0.0, 1.0] },
            ])
            .await
            .unwrap();
        SemanticRanker::new(Arc::new(store))
    }

    #[tokio::test]
    async fn test_rank_nearest_first() {
        let ranker = seeded().await;
        let results = ranker.rank(&[1.0, 0.1], 2).await.unwrap();

        let ids: Vec<_> = results.iter().map(|r| r.fragment_id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(results[0].source, RankerTag::Semantic);
        assert_eq!(results[1].rank, 2);
    }

    #[tokio::test]
    async fn test_missing_embedding_is_unavailable() {
        let ranker = seeded().await;
        let query = RankingQuery {
            limit: 5,
            ..Default::default()
        };
        let err = ranker.produce_ranking(&query).await.unwrap_err();
        assert!(matches!(err, RetrievalError::EmbeddingUnavailable(_)));
    }

    #[tokio::test]
    async fn test_backend_failure_is_unavailable() {
        let ranker = SemanticRanker::new(Arc::new(BrokenVectors));
        let err = ranker.rank(&[1.0, 0.0], 3).await.unwrap_err();
        assert!(matches!(err, RetrievalError::EmbeddingUnavailable(_)));
    }
}
