//! Query Augmenter - 쿼리 확장과 HyDE 임베딩
//!
//! 두 기능 모두 순서가 있는 전략 체인입니다. 앞 전략부터 시도하고
//! 처음 성공한 결과를 씁니다. 실패는 `Degradation`으로 남기고 다음 전략으로 넘어갑니다.
//!
//! - 확장: LLM 확장 → 정적 동의어 → 확장 없음
//! - 임베딩: HyDE (요청 시) → 쿼리 직접 임베딩
//!
//! 2단어 이하 쿼리(인사말 등)는 LLM 전략을 건너뜁니다.
//!
//! ref: Gao et al. (2022), "Precise Zero-Shot Dense Retrieval without Relevance Labels" (HyDE)

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;

use crate::embedding::EmbeddingProvider;
use crate::error::{Degradation, RetrievalError, Result};
use crate::llm::{CompletionOptions, LlmProvider};
use crate::ranking::{tokenize, WeightedTerm};

/// 확장 용어 최대 개수
const MAX_EXPANDED_TERMS: usize = 20;

/// 이 단어 수 이하면 LLM 전략 생략
const SHORT_QUERY_WORDS: usize = 2;

const EXPANSION_PROMPT: &str = "You are a search query optimizer. Given a user's question, \
list related keywords, synonyms and alternative phrasings that would help find relevant \
documents. Keep it under 100 words. Output ONLY the keywords and phrasings, nothing else.\n\n\
User question: {query}\n\nExpanded query:";

const HYDE_PROMPT: &str = "Given this question, write a short paragraph (50-100 words) that \
would be a good answer. It will be used to find similar content.\n\n\
Question: {query}\n\nAnswer:";

fn is_short_query(query: &str) -> bool {
    query.split_whitespace().count() <= SHORT_QUERY_WORDS
}

// ============================================================================
// Strategies
// ============================================================================

/// 쿼리 확장 전략
///
/// `Ok(None)`은 "적용할 것 없음"이며 다음 전략으로 넘어갑니다.
#[async_trait]
pub trait ExpansionStrategy: Send + Sync {
    fn name(&self) -> &str;

    fn uses_llm(&self) -> bool {
        false
    }

    async fn expand(&self, query: &str) -> Result<Option<Vec<String>>>;
}

/// 임베딩 전략
#[async_trait]
pub trait EmbeddingStrategy: Send + Sync {
    fn name(&self) -> &str;

    fn uses_llm(&self) -> bool {
        false
    }

    /// HyDE 플래그가 켜졌을 때만 사용
    fn requires_hyde(&self) -> bool {
        false
    }

    async fn embed(&self, query: &str) -> Result<Option<Vec<f32>>>;
}

/// 원본 쿼리에 없는 새 용어만 남김 (순서 유지, 중복 제거)
fn novel_terms(query: &str, candidates: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut seen: HashSet<String> = tokenize(query).into_iter().collect();
    candidates
        .into_iter()
        .filter(|t| seen.insert(t.clone()))
        .take(MAX_EXPANDED_TERMS)
        .collect()
}

/// LLM으로 관련 용어 생성
pub struct LlmExpansion {
    llm: Arc<dyn LlmProvider>,
}

impl LlmExpansion {
    pub fn new(llm: Arc<dyn LlmProvider>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl ExpansionStrategy for LlmExpansion {
    fn name(&self) -> &str {
        "llm"
    }

    fn uses_llm(&self) -> bool {
        true
    }

    async fn expand(&self, query: &str) -> Result<Option<Vec<String>>> {
        let prompt = EXPANSION_PROMPT.replace("{query}", query);
        let options = CompletionOptions {
            temperature: 0.3,
            max_output_tokens: 150,
        };

        let text = self
            .llm
            .complete(&prompt, options)
            .await
            .map_err(|e| RetrievalError::LlmUnavailable(format!("{:#}", e)))?;

        let terms = novel_terms(query, tokenize(&text));
        Ok(if terms.is_empty() { None } else { Some(terms) })
    }
}

/// 설정의 정적 동의어 테이블
pub struct StaticSynonyms {
    table: BTreeMap<String, Vec<String>>,
}

impl StaticSynonyms {
    pub fn new(table: BTreeMap<String, Vec<String>>) -> Self {
        // 키는 소문자로 맞춤
        let table = table
            .into_iter()
            .map(|(k, v)| (k.to_lowercase(), v))
            .collect();
        Self { table }
    }
}

#[async_trait]
impl ExpansionStrategy for StaticSynonyms {
    fn name(&self) -> &str {
        "synonyms"
    }

    async fn expand(&self, query: &str) -> Result<Option<Vec<String>>> {
        let candidates = tokenize(query)
            .into_iter()
            .filter_map(|token| self.table.get(&token))
            .flatten()
            .flat_map(|synonym| tokenize(synonym))
            .collect::<Vec<_>>();

        let terms = novel_terms(query, candidates);
        Ok(if terms.is_empty() { None } else { Some(terms) })
    }
}

/// HyDE: 가상 답변을 생성해 그 답변을 임베딩
pub struct HydeEmbedding {
    llm: Arc<dyn LlmProvider>,
    embedder: Arc<dyn EmbeddingProvider>,
}

impl HydeEmbedding {
    pub fn new(llm: Arc<dyn LlmProvider>, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self { llm, embedder }
    }
}

#[async_trait]
impl EmbeddingStrategy for HydeEmbedding {
    fn name(&self) -> &str {
        "hyde"
    }

    fn uses_llm(&self) -> bool {
        true
    }

    fn requires_hyde(&self) -> bool {
        true
    }

    async fn embed(&self, query: &str) -> Result<Option<Vec<f32>>> {
        let prompt = HYDE_PROMPT.replace("{query}", query);
        let options = CompletionOptions {
            temperature: 0.5,
            max_output_tokens: 200,
        };

        let passage = self
            .llm
            .complete(&prompt, options)
            .await
            .map_err(|e| RetrievalError::LlmUnavailable(format!("{:#}", e)))?;

        if passage.trim().is_empty() {
            return Ok(None);
        }
        tracing::debug!("HyDE passage: {} chars", passage.len());

        let embedding = self
            .embedder
            .embed(passage.trim())
            .await
            .map_err(|e| RetrievalError::EmbeddingUnavailable(format!("{:#}", e)))?;
        Ok(Some(embedding))
    }
}

/// 쿼리 텍스트 직접 임베딩
pub struct DirectEmbedding {
    embedder: Arc<dyn EmbeddingProvider>,
}

impl DirectEmbedding {
    pub fn new(embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self { embedder }
    }
}

#[async_trait]
impl EmbeddingStrategy for DirectEmbedding {
    fn name(&self) -> &str {
        "direct"
    }

    async fn embed(&self, query: &str) -> Result<Option<Vec<f32>>> {
        let embedding = self
            .embedder
            .embed(query)
            .await
            .map_err(|e| RetrievalError::EmbeddingUnavailable(format!("{:#}", e)))?;
        Ok(Some(embedding))
    }
}

// ============================================================================
// QueryAugmenter
// ============================================================================

/// 확장 결과
#[derive(Debug, Clone, Default)]
pub struct Expansion {
    /// 렉시컬 검색 용어 (원본 1.0 + 확장 가중치)
    pub terms: Vec<WeightedTerm>,
    pub expanded_terms: Vec<String>,
    /// 원본 + 확장 용어 (확장이 있을 때만)
    pub expanded_text: Option<String>,
    /// 성공한 전략 이름
    pub strategy: Option<String>,
    pub degradations: Vec<Degradation>,
}

/// 임베딩 결과
#[derive(Debug)]
pub struct EmbeddingOutcome {
    pub embedding: Result<Vec<f32>>,
    pub strategy: Option<String>,
    pub degradations: Vec<Degradation>,
}

/// 쿼리 확장/임베딩 체인 실행기
pub struct QueryAugmenter {
    expansion: Vec<Box<dyn ExpansionStrategy>>,
    embedding: Vec<Box<dyn EmbeddingStrategy>>,
    expanded_weight: f64,
}

impl Default for QueryAugmenter {
    fn default() -> Self {
        Self::new(0.5)
    }
}

impl QueryAugmenter {
    /// 빈 체인
    pub fn new(expanded_weight: f64) -> Self {
        Self {
            expansion: Vec::new(),
            embedding: Vec::new(),
            expanded_weight,
        }
    }

    /// 기본 체인 구성
    ///
    /// LLM이 없으면 LLM 전략을, 임베더가 없으면 임베딩 전략을 뺍니다.
    pub fn standard(
        llm: Option<Arc<dyn LlmProvider>>,
        embedder: Option<Arc<dyn EmbeddingProvider>>,
        synonyms: BTreeMap<String, Vec<String>>,
        expanded_weight: f64,
    ) -> Self {
        let mut augmenter = Self::new(expanded_weight);

        if let Some(llm) = &llm {
            augmenter = augmenter.with_expansion(LlmExpansion::new(Arc::clone(llm)));
        }
        if !synonyms.is_empty() {
            augmenter = augmenter.with_expansion(StaticSynonyms::new(synonyms));
        }

        if let Some(embedder) = embedder {
            if let Some(llm) = llm {
                augmenter =
                    augmenter.with_embedding(HydeEmbedding::new(llm, Arc::clone(&embedder)));
            }
            augmenter = augmenter.with_embedding(DirectEmbedding::new(embedder));
        }

        augmenter
    }

    pub fn with_expansion(mut self, strategy: impl ExpansionStrategy + 'static) -> Self {
        self.expansion.push(Box::new(strategy));
        self
    }

    pub fn with_embedding(mut self, strategy: impl EmbeddingStrategy + 'static) -> Self {
        self.embedding.push(Box::new(strategy));
        self
    }

    /// 확장 체인 실행. 실패해도 원본 용어는 항상 반환
    pub async fn expand(&self, query: &str, enabled: bool) -> Expansion {
        let mut expansion = Expansion {
            terms: WeightedTerm::from_query(query),
            ..Default::default()
        };

        if !enabled {
            return expansion;
        }

        let short = is_short_query(query);

        for strategy in &self.expansion {
            if short && strategy.uses_llm() {
                tracing::debug!("Skipping {} expansion for short query", strategy.name());
                continue;
            }

            match strategy.expand(query).await {
                Ok(Some(terms)) => {
                    tracing::debug!("{} expansion added {} terms", strategy.name(), terms.len());
                    expansion.strategy = Some(strategy.name().to_string());
                    expansion.expanded_text = Some(format!("{} {}", query, terms.join(" ")));
                    expansion.terms.extend(
                        terms
                            .iter()
                            .map(|t| WeightedTerm::new(t.clone(), self.expanded_weight)),
                    );
                    expansion.expanded_terms = terms;
                    break;
                }
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!("Query expansion '{}' failed: {}", strategy.name(), e);
                    expansion.degradations.push(Degradation::ExpansionFailed {
                        strategy: strategy.name().to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        expansion
    }

    /// 임베딩 체인 실행. 모든 전략이 실패하면 `EmbeddingUnavailable`
    pub async fn embed(&self, query: &str, use_hyde: bool) -> EmbeddingOutcome {
        let short = is_short_query(query);
        let mut degradations = Vec::new();
        let mut last_error = None;

        for strategy in &self.embedding {
            if strategy.requires_hyde() && !use_hyde {
                continue;
            }
            if short && strategy.uses_llm() {
                continue;
            }

            match strategy.embed(query).await {
                Ok(Some(vector)) => {
                    return EmbeddingOutcome {
                        embedding: Ok(vector),
                        strategy: Some(strategy.name().to_string()),
                        degradations,
                    };
                }
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!("Embedding strategy '{}' failed: {}", strategy.name(), e);
                    degradations.push(Degradation::EmbeddingFailed {
                        strategy: strategy.name().to_string(),
                        reason: e.to_string(),
                    });
                    last_error = Some(e);
                }
            }
        }

        let reason = match last_error {
            Some(RetrievalError::EmbeddingUnavailable(reason)) => reason,
            Some(other) => other.to_string(),
            None => "no embedding strategy available".to_string(),
        };

        EmbeddingOutcome {
            embedding: Err(RetrievalError::EmbeddingUnavailable(reason)),
            strategy: None,
            degradations,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedLlm {
        reply: Option<String>,
        calls: AtomicUsize,
    }

    impl FixedLlm {
        fn replying(text: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: Some(text.to_string()),
                calls: AtomicUsize::new(0),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                reply: None,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl LlmProvider for FixedLlm {
        async fn complete(&self, _prompt: &str, _options: CompletionOptions) -> anyhow::Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.reply {
                Some(text) => Ok(text.clone()),
                None => bail!("429 rate limited"),
            }
        }

        fn name(&self) -> &str {
            "fixed"
        }
    }

    struct LengthEmbedder {
        fail: bool,
    }

    #[async_trait]
    impl EmbeddingProvider for LengthEmbedder {
        async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
            if self.fail {
                bail!("embedding service down");
            }
            Ok(vec![text.len() as f32, 1.0])
        }

        fn dimension(&self) -> usize {
            2
        }

        fn name(&self) -> &str {
            "length"
        }
    }

    fn synonyms() -> BTreeMap<String, Vec<String>> {
        BTreeMap::from([(
            "pricing".to_string(),
            vec!["cost".to_string(), "rates".to_string()],
        )])
    }

    #[tokio::test]
    async fn test_llm_expansion_adds_weighted_terms() {
        let llm = FixedLlm::replying("consulting, advisory services; Consulting");
        let augmenter = QueryAugmenter::new(0.5).with_expansion(LlmExpansion::new(llm));

        let expansion = augmenter.expand("what services does x offer", true).await;

        assert_eq!(expansion.strategy.as_deref(), Some("llm"));
        assert_eq!(expansion.expanded_terms, vec!["consulting", "advisory"]);
        let consulting = expansion.terms.iter().find(|t| t.term == "consulting").unwrap();
        assert_eq!(consulting.weight, 0.5);
        let services: Vec<_> = expansion.terms.iter().filter(|t| t.term == "services").collect();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].weight, 1.0);
    }

    #[tokio::test]
    async fn test_llm_failure_falls_back_to_synonyms() {
        let augmenter = QueryAugmenter::new(0.5)
            .with_expansion(LlmExpansion::new(FixedLlm::failing()))
            .with_expansion(StaticSynonyms::new(synonyms()));

        let expansion = augmenter.expand("what is the pricing model", true).await;

        assert_eq!(expansion.strategy.as_deref(), Some("synonyms"));
        assert_eq!(expansion.expanded_terms, vec!["cost", "rates"]);
        assert!(matches!(
            expansion.degradations.as_slice(),
            [Degradation::ExpansionFailed { strategy, .. }] if strategy == "llm"
        ));
    }

    #[tokio::test]
    async fn test_all_expansion_fails_keeps_original() {
        let augmenter =
            QueryAugmenter::new(0.5).with_expansion(LlmExpansion::new(FixedLlm::failing()));

        let expansion = augmenter.expand("tell me about the office", true).await;
        assert!(expansion.expanded_terms.is_empty());
        assert!(expansion.expanded_text.is_none());
        assert_eq!(expansion.terms.len(), 5);
    }

    #[tokio::test]
    async fn test_short_query_skips_llm() {
        let llm = FixedLlm::replying("greeting salutation");
        let augmenter = QueryAugmenter::new(0.5).with_expansion(LlmExpansion::new(llm.clone()));

        let expansion = augmenter.expand("hello there", true).await;
        assert!(expansion.expanded_terms.is_empty());
        assert_eq!(llm.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_disabled_expansion() {
        let augmenter = QueryAugmenter::new(0.5).with_expansion(StaticSynonyms::new(synonyms()));
        let expansion = augmenter.expand("pricing", false).await;
        assert!(expansion.expanded_terms.is_empty());
        assert_eq!(expansion.terms, vec![WeightedTerm::new("pricing", 1.0)]);
    }

    #[tokio::test]
    async fn test_hyde_used_only_when_requested() {
        let llm = FixedLlm::replying("X offers cloud migration services to enterprises.");
        let embedder: Arc<dyn EmbeddingProvider> = Arc::new(LengthEmbedder { fail: false });
        let augmenter = QueryAugmenter::standard(
            Some(llm.clone() as Arc<dyn LlmProvider>),
            Some(embedder),
            BTreeMap::new(),
            0.5,
        );

        let query = "what does x offer";
        let direct = augmenter.embed(query, false).await;
        assert_eq!(direct.strategy.as_deref(), Some("direct"));
        assert_eq!(direct.embedding.unwrap()[0], query.len() as f32);

        let hyde = augmenter.embed(query, true).await;
        assert_eq!(hyde.strategy.as_deref(), Some("hyde"));
        assert_eq!(
            hyde.embedding.unwrap()[0],
            "X offers cloud migration services to enterprises.".len() as f32
        );
    }

    #[tokio::test]
    async fn test_hyde_failure_falls_back_to_direct() {
        let embedder: Arc<dyn EmbeddingProvider> = Arc::new(LengthEmbedder { fail: false });
        let augmenter = QueryAugmenter::standard(
            Some(FixedLlm::failing() as Arc<dyn LlmProvider>),
            Some(embedder),
            BTreeMap::new(),
            0.5,
        );

        let outcome = augmenter.embed("what does x offer", true).await;
        assert_eq!(outcome.strategy.as_deref(), Some("direct"));
        assert!(outcome.embedding.is_ok());
        assert_eq!(outcome.degradations.len(), 1);
    }

    #[tokio::test]
    async fn test_all_embedding_fails_is_unavailable() {
        let embedder: Arc<dyn EmbeddingProvider> = Arc::new(LengthEmbedder { fail: true });
        let augmenter = QueryAugmenter::standard(None, Some(embedder), BTreeMap::new(), 0.5);

        let outcome = augmenter.embed("what does x offer", true).await;
        assert!(matches!(
            outcome.embedding,
            Err(RetrievalError::EmbeddingUnavailable(_))
        ));

        let empty = QueryAugmenter::default().embed("anything at all", false).await;
        assert!(matches!(
            empty.embedding,
            Err(RetrievalError::EmbeddingUnavailable(_))
        ));
    }
}
