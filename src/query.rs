//! 쿼리 정규화와 검색 요청
//!
//! 쿼리 키는 정규화된 쿼리 텍스트의 SHA-256 (앞 32자리 hex) 입니다.
//! 피드백, 쿼리 로그, 캐시 무효화가 모두 이 키로 쿼리를 식별합니다.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::FeedrankConfig;

/// 소문자화 + 공백 정리
pub fn normalize_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

/// 정규화된 쿼리의 안정적인 키
pub fn query_key(query: &str) -> String {
    sha256_prefix(&normalize_query(query), 32)
}

pub(crate) fn sha256_prefix(input: &str, len: usize) -> String {
    let digest = Sha256::digest(input.as_bytes());
    let hex = format!("{:x}", digest);
    hex[..len.min(hex.len())].to_string()
}

/// 검색 동작을 바꾸는 기능 플래그
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RetrievalFlags {
    pub use_expansion: bool,
    pub use_hyde: bool,
    /// 시맨틱 랭커 사용 (끄면 렉시컬 전용)
    pub use_hybrid: bool,
    pub use_history: bool,
}

impl Default for RetrievalFlags {
    fn default() -> Self {
        Self {
            use_expansion: true,
            use_hyde: false,
            use_hybrid: true,
            use_history: true,
        }
    }
}

/// 검색 요청
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalRequest {
    pub query: String,
    pub top_k: usize,
    /// 답변 생성 온도 (캐시 키에만 영향)
    pub temperature: f32,
    pub flags: RetrievalFlags,
}

impl RetrievalRequest {
    pub fn new(query: impl Into<String>, top_k: usize) -> Self {
        Self {
            query: query.into(),
            top_k,
            temperature: 0.7,
            flags: RetrievalFlags::default(),
        }
    }

    /// 설정 기본값으로 요청 생성
    pub fn from_config(query: impl Into<String>, config: &FeedrankConfig) -> Self {
        Self {
            query: query.into(),
            top_k: config.retrieval.top_k,
            temperature: 0.7,
            flags: RetrievalFlags {
                use_expansion: config.augment.use_expansion,
                use_hyde: config.augment.use_hyde,
                use_hybrid: true,
                use_history: config.retrieval.use_history,
            },
        }
    }

    pub fn with_flags(mut self, flags: RetrievalFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn normalized_query(&self) -> String {
        normalize_query(&self.query)
    }

    pub fn query_key(&self) -> String {
        query_key(&self.query)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_query() {
        assert_eq!(
            normalize_query("  What Services   does X\toffer? "),
            "what services does x offer?"
        );
    }

    #[test]
    fn test_query_key_is_case_and_space_insensitive() {
        assert_eq!(query_key("What is X"), query_key("  what   is x "));
        assert_ne!(query_key("what is x"), query_key("what is y"));
        assert_eq!(query_key("anything").len(), 32);
    }

    #[test]
    fn test_request_defaults() {
        let request = RetrievalRequest::new("pricing", 3);
        assert_eq!(request.top_k, 3);
        assert!(request.flags.use_hybrid);
        assert!(!request.flags.use_hyde);
    }
}
