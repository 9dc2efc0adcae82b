//! Knowledge 모듈 - 외부 지식 저장소 어댑터
//!
//! - SQLite: 프래그먼트 텍스트 저장 (`FragmentSource`)
//! - LanceDB: 프래그먼트 임베딩 벡터 검색 (`VectorStore`)

mod lance;
mod store;
mod vector;

pub use lance::LanceVectorStore;
pub(crate) use store::{open_connection, parse_datetime};
pub use store::{get_data_dir, Fragment, FragmentSource, KnowledgeStore, NewFragment, StoreStats};
pub use vector::{
    cosine_similarity, distance_to_similarity, VectorEntry, VectorHit, VectorStore,
    EMBEDDING_DIMENSION,
};
