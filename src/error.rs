//! 검색 엔진 에러 분류
//!
//! 랭커 단계의 실패(임베딩/LLM)는 엔진 내부에서 복구되고,
//! 피드백 검증 실패는 상태 변경 없이 호출자에게 보고됩니다.

use thiserror::Error;

/// 검색 결정 엔진의 에러 타입
#[derive(Error, Debug)]
pub enum RetrievalError {
    /// 외부 임베딩 호출 실패 (렉시컬 전용 검색으로 폴백)
    #[error("Embedding unavailable: {0}")]
    EmbeddingUnavailable(String),

    /// 외부 LLM 호출 실패 (확장 없는 쿼리로 폴백)
    #[error("LLM unavailable: {0}")]
    LlmUnavailable(String),

    /// 렉시컬 인덱스 재구축 필요
    #[error("Lexical index is stale; rebuild required")]
    IndexStale,

    /// 잘못된 피드백 이벤트 (쿼리 키 누락, 중복 이벤트 ID 등)
    #[error("Invalid feedback event: {0}")]
    InvalidFeedbackEvent(String),

    /// 캐시 저장소 접근 실패 (캐시 우회 모드로 동작)
    #[error("Cache backend unavailable: {0}")]
    CacheBackendUnavailable(String),

    /// 호출자가 포기한 요청 (대기 중인 외부 호출은 취소됨)
    #[error("Retrieval timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// 학습 상태 저장 실패
    #[error("Storage error: {0}")]
    Storage(String),
}

/// 검색 엔진 Result 별칭
pub type Result<T> = std::result::Result<T, RetrievalError>;

impl RetrievalError {
    pub(crate) fn storage(err: impl std::fmt::Display) -> Self {
        RetrievalError::Storage(err.to_string())
    }

    pub(crate) fn cache_backend(err: impl std::fmt::Display) -> Self {
        RetrievalError::CacheBackendUnavailable(err.to_string())
    }
}

// ============================================================================
// Degradation
// ============================================================================

/// 요청 처리 중 로컬에서 복구된 실패 기록
///
/// 사용자는 여전히 결과를 받지만, 어떤 경로가 빠졌는지 여기에 남습니다.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Degradation {
    /// 확장 전략 실패 (다음 전략으로 넘어감)
    ExpansionFailed { strategy: String, reason: String },
    /// 임베딩 전략 실패 (다음 전략으로 넘어감)
    EmbeddingFailed { strategy: String, reason: String },
    /// 랭커 하나가 빠짐
    RankerSkipped { ranker: String, reason: String },
    /// 렉시컬 인덱스가 오래되어 재구축함
    IndexRebuilt { fragments: usize },
    /// 캐시 우회
    CacheBypassed { reason: String },
}

impl std::fmt::Display for Degradation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Degradation::ExpansionFailed { strategy, reason } => {
                write!(f, "expansion '{}' failed: {}", strategy, reason)
            }
            Degradation::EmbeddingFailed { strategy, reason } => {
                write!(f, "embedding '{}' failed: {}", strategy, reason)
            }
            Degradation::RankerSkipped { ranker, reason } => {
                write!(f, "{} ranking skipped: {}", ranker, reason)
            }
            Degradation::IndexRebuilt { fragments } => {
                write!(f, "lexical index rebuilt ({} fragments)", fragments)
            }
            Degradation::CacheBypassed { reason } => write!(f, "cache bypassed: {}", reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = RetrievalError::InvalidFeedbackEvent("duplicate event id: e1".into());
        assert_eq!(
            err.to_string(),
            "Invalid feedback event: duplicate event id: e1"
        );
    }
}
