//! feedrank - 피드백 학습 하이브리드 검색 엔진
//!
//! BM25 렉시컬 검색 + LanceDB 벡터 검색 + 학습된 쿼리 매핑을
//! RRF로 합치고, 사용자 피드백으로 프래그먼트 스코어를 조정합니다.

pub mod augment;
pub mod cache;
pub mod cli;
pub mod config;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod feedback;
pub mod fusion;
pub mod knowledge;
pub mod llm;
pub mod locks;
pub mod query;
pub mod query_log;
pub mod ranking;
pub mod retry;
pub mod scoring;

// Re-exports
pub use augment::{EmbeddingOutcome, Expansion, QueryAugmenter};
pub use cache::{CacheBackend, CacheEntry, CacheKey, CachedAnswer, ResponseCache, SqliteCacheBackend};
pub use config::FeedrankConfig;
pub use embedding::{get_api_key, has_api_key, EmbeddingProvider, GeminiEmbedding};
pub use engine::{CacheLookup, DataPaths, Evidence, EvidenceItem, RetrievalEngine};
pub use error::{Degradation, Result, RetrievalError};
pub use feedback::{
    FeedbackEvent, FeedbackLearner, FeedbackOutcome, FeedbackScope, FlagState, LearnerSettings,
};
pub use fusion::{FusedResult, FusionEngine};
pub use knowledge::{
    get_data_dir, Fragment, FragmentSource, KnowledgeStore, LanceVectorStore, NewFragment,
    VectorEntry, VectorStore,
};
pub use llm::{GeminiLlm, LlmProvider};
pub use query::{normalize_query, query_key, RetrievalFlags, RetrievalRequest};
pub use query_log::{CommonQuery, QueryLog, QueryRecord, SqliteQueryLog};
pub use ranking::{LexicalRanker, RankedResult, RankerTag, RankingSource};
pub use scoring::{FragmentId, Polarity};
