//! LanceDB Vector Store - 프래그먼트 임베딩 ANN 검색
//!
//! ref: https://lancedb.github.io/lancedb/

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{
    Array, FixedSizeListArray, Float32Array, Int64Array, RecordBatch, RecordBatchIterator,
};
use arrow_schema::{DataType, Field, Schema};
use async_trait::async_trait;
use futures::TryStreamExt;
use lancedb::connection::Connection;
use lancedb::query::{ExecutableQuery, QueryBase};

use super::vector::{distance_to_similarity, VectorEntry, VectorHit, VectorStore, EMBEDDING_DIMENSION};
use crate::scoring::FragmentId;

/// 벡터 테이블 이름
const TABLE_NAME: &str = "fragment_vectors";

// ============================================================================
// LanceVectorStore
// ============================================================================

/// LanceDB 벡터 저장소 구현
pub struct LanceVectorStore {
    db: Connection,
}

impl LanceVectorStore {
    /// LanceDB 저장소 열기
    ///
    /// # Arguments
    /// * `path` - .lance 디렉토리 경로
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .context("Failed to create LanceDB directory")?;
            }
        }

        let path_str = path
            .to_str()
            .ok_or_else(|| anyhow::anyhow!("Invalid path encoding"))?;

        let db = lancedb::connect(path_str)
            .execute()
            .await
            .context("Failed to connect to LanceDB")?;

        Ok(Self { db })
    }

    fn create_schema() -> Schema {
        Schema::new(vec![
            Field::new("fragment_id", DataType::Int64, false),
            Field::new(
                "embedding",
                DataType::FixedSizeList(
                    Arc::new(Field::new("item", DataType::Float32, true)),
                    EMBEDDING_DIMENSION,
                ),
                false,
            ),
        ])
    }

    /// 엔트리들을 Arrow RecordBatch로 변환
    fn entries_to_batch(entries: &[VectorEntry]) -> Result<RecordBatch> {
        if entries.is_empty() {
            anyhow::bail!("Cannot create batch from empty entries");
        }

        if let Some(bad) = entries
            .iter()
            .find(|e| e.embedding.len() != EMBEDDING_DIMENSION as usize)
        {
            anyhow::bail!(
                "Embedding for fragment {} has dimension {}, expected {}",
                bad.fragment_id,
                bad.embedding.len(),
                EMBEDDING_DIMENSION
            );
        }

        let ids: Vec<i64> = entries.iter().map(|e| e.fragment_id).collect();
        let embeddings_flat: Vec<f32> = entries
            .iter()
            .flat_map(|e| e.embedding.iter().copied())
            .collect();

        let values = Float32Array::from(embeddings_flat);
        let field = Arc::new(Field::new("item", DataType::Float32, true));
        let embeddings_list = FixedSizeListArray::try_new(
            field,
            EMBEDDING_DIMENSION,
            Arc::new(values) as Arc<dyn Array>,
            None,
        )
        .context("Failed to create embedding array")?;

        RecordBatch::try_new(
            Arc::new(Self::create_schema()),
            vec![Arc::new(Int64Array::from(ids)), Arc::new(embeddings_list)],
        )
        .context("Failed to create RecordBatch")
    }

    async fn table_exists(&self) -> bool {
        self.db
            .table_names()
            .execute()
            .await
            .map(|names| names.iter().any(|n| n == TABLE_NAME))
            .unwrap_or(false)
    }

    async fn open_table(&self) -> Result<Option<lancedb::table::Table>> {
        if !self.table_exists().await {
            return Ok(None);
        }
        let table = self
            .db
            .open_table(TABLE_NAME)
            .execute()
            .await
            .context("Failed to open vector table")?;
        Ok(Some(table))
    }
}

#[async_trait]
impl VectorStore for LanceVectorStore {
    async fn insert_batch(&self, entries: &[VectorEntry]) -> Result<usize> {
        if entries.is_empty() {
            return Ok(0);
        }

        let batch = Self::entries_to_batch(entries)?;
        let schema = batch.schema();
        let batches = RecordBatchIterator::new(vec![Ok(batch)], schema);

        match self.open_table().await? {
            Some(table) => {
                table
                    .add(batches)
                    .execute()
                    .await
                    .context("Failed to add vectors to table")?;
            }
            None => {
                self.db
                    .create_table(TABLE_NAME, batches)
                    .execute()
                    .await
                    .context("Failed to create table")?;
            }
        }

        Ok(entries.len())
    }

    async fn search(&self, query_embedding: &[f32], limit: usize) -> Result<Vec<VectorHit>> {
        let Some(table) = self.open_table().await? else {
            return Ok(vec![]);
        };

        let results = table
            .vector_search(query_embedding.to_vec())
            .context("Failed to create vector search")?
            .limit(limit)
            .execute()
            .await
            .context("Failed to execute vector search")?;

        let batches: Vec<RecordBatch> = results.try_collect().await?;
        let mut hits = Vec::new();

        for batch in batches {
            let ids = batch
                .column_by_name("fragment_id")
                .and_then(|c| c.as_any().downcast_ref::<Int64Array>())
                .ok_or_else(|| anyhow::anyhow!("Missing fragment_id column"))?;

            // _distance 컬럼 (LanceDB가 자동 추가)
            let distances = batch
                .column_by_name("_distance")
                .and_then(|c| c.as_any().downcast_ref::<Float32Array>())
                .ok_or_else(|| anyhow::anyhow!("Missing _distance column"))?;

            for i in 0..batch.num_rows() {
                hits.push(VectorHit {
                    fragment_id: ids.value(i),
                    similarity: distance_to_similarity(distances.value(i)),
                });
            }
        }

        hits.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.fragment_id.cmp(&b.fragment_id))
        });
        Ok(hits)
    }

    async fn delete_by_fragment(&self, fragment_id: FragmentId) -> Result<usize> {
        let Some(table) = self.open_table().await? else {
            return Ok(0);
        };

        let before_count = table.count_rows(None).await.context("Failed to count rows")?;

        // fragment_id는 i64로 검증됨 - 필터 인젝션 방지
        let filter = format!("fragment_id = {}", fragment_id);
        table
            .delete(&filter)
            .await
            .context("Failed to delete vectors")?;

        let after_count = table.count_rows(None).await.context("Failed to count rows")?;
        Ok(before_count.saturating_sub(after_count))
    }

    async fn count(&self) -> Result<usize> {
        match self.open_table().await? {
            Some(table) => table.count_rows(None).await.context("Failed to count rows"),
            None => Ok(0),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(fragment_id: i64, value: f32) -> VectorEntry {
        VectorEntry {
            fragment_id,
            embedding: vec![value; EMBEDDING_DIMENSION as usize],
        }
    }

    #[tokio::test]
    async fn test_lance_insert_and_count() {
        let temp_dir = TempDir::new().unwrap();
        let store = LanceVectorStore::open(&temp_dir.path().join("test.lance"))
            .await
            .unwrap();

        assert_eq!(store.count().await.unwrap(), 0);

        let inserted = store.insert_batch(&[entry(1, 0.1), entry(2, 0.2)]).await.unwrap();
        assert_eq!(inserted, 2);
        assert_eq!(store.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_lance_search_orders_by_similarity() {
        let temp_dir = TempDir::new().unwrap();
        let store = LanceVectorStore::open(&temp_dir.path().join("search.lance"))
            .await
            .unwrap();

        store
            .insert_batch(&[entry(1, 0.1), entry(2, 0.5), entry(3, 0.9)])
            .await
            .unwrap();

        let query = vec![0.1; EMBEDDING_DIMENSION as usize];
        let hits = store.search(&query, 2).await.unwrap();

        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].fragment_id, 1);
        assert!(hits[0].similarity >= hits[1].similarity);
    }

    #[tokio::test]
    async fn test_lance_delete() {
        let temp_dir = TempDir::new().unwrap();
        let store = LanceVectorStore::open(&temp_dir.path().join("delete.lance"))
            .await
            .unwrap();

        store
            .insert_batch(&[entry(1, 0.1), entry(2, 0.2)])
            .await
            .unwrap();

        assert_eq!(store.delete_by_fragment(1).await.unwrap(), 1);
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[test]
    fn test_rejects_wrong_dimension() {
        let bad = VectorEntry {
            fragment_id: 7,
            embedding: vec![0.1; 3],
        };
        assert!(LanceVectorStore::entries_to_batch(&[bad]).is_err());
    }

    #[tokio::test]
    async fn test_search_on_empty_store() {
        let temp_dir = TempDir::new().unwrap();
        let store = LanceVectorStore::open(&temp_dir.path().join("empty.lance"))
            .await
            .unwrap();
        let hits = store
            .search(&vec![0.1; EMBEDDING_DIMENSION as usize], 5)
            .await
            .unwrap();
        assert!(hits.is_empty());
    }
}
