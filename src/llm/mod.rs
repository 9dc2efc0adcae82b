//! LLM 모듈 - Gemini generateContent를 통한 텍스트 생성
//!
//! 쿼리 확장과 HyDE 가상 답변 생성에 쓰이는 외부 함수(`prompt → text`)입니다.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::embedding::{classify_gemini_failure, get_api_key};
use crate::retry::{with_backoff, Attempt, RateLimiter, RetryPolicy};

/// 기본 생성 모델
pub const DEFAULT_MODEL: &str = "gemini-2.0-flash";

const GEMINI_GENERATE_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models";

const RATE_LIMIT_RPM: u32 = 15;
const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);

// ============================================================================
// LlmProvider Trait
// ============================================================================

/// 텍스트 생성 옵션
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompletionOptions {
    pub temperature: f32,
    pub max_output_tokens: u32,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            temperature: 0.3,
            max_output_tokens: 150,
        }
    }
}

/// LLM 프로바이더 트레이트
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// 프롬프트 완성
    async fn complete(&self, prompt: &str, options: CompletionOptions) -> Result<String>;

    /// 모델 이름
    fn name(&self) -> &str;
}

// ============================================================================
// Gemini
// ============================================================================

/// Gemini 텍스트 생성 구현체
#[derive(Debug)]
pub struct GeminiLlm {
    api_key: String,
    model: String,
    client: reqwest::Client,
    retry: RetryPolicy,
    rate_limiter: Arc<Mutex<RateLimiter>>,
}

impl GeminiLlm {
    pub fn new(api_key: String, model: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            api_key,
            model: model.into(),
            client,
            retry: RetryPolicy::default(),
            rate_limiter: Arc::new(Mutex::new(RateLimiter::new(
                RATE_LIMIT_RPM,
                RATE_LIMIT_WINDOW,
            ))),
        })
    }

    /// 환경변수의 API 키로 생성
    pub fn from_env(model: impl Into<String>) -> Result<Self> {
        Self::new(get_api_key()?, model)
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/{}:generateContent", GEMINI_GENERATE_BASE, self.model)
    }
}

#[derive(Debug, Serialize)]
struct GenerateRequest {
    contents: Vec<GenerateContent>,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize, Deserialize)]
struct GenerateContent {
    #[serde(default)]
    parts: Vec<GeneratePart>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeneratePart {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Serialize)]
struct GenerationConfig {
    temperature: f32,
    #[serde(rename = "maxOutputTokens")]
    max_output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: GenerateContent,
}

/// 응답 후보에서 텍스트 추출
fn extract_text(response: GenerateResponse) -> Option<String> {
    let text: String = response
        .candidates
        .into_iter()
        .next()?
        .content
        .parts
        .into_iter()
        .map(|p| p.text)
        .collect::<Vec<_>>()
        .join("");

    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[async_trait]
impl LlmProvider for GeminiLlm {
    async fn complete(&self, prompt: &str, options: CompletionOptions) -> Result<String> {
        let request = GenerateRequest {
            contents: vec![GenerateContent {
                parts: vec![GeneratePart {
                    text: prompt.to_string(),
                }],
            }],
            generation_config: GenerationConfig {
                temperature: options.temperature,
                max_output_tokens: options.max_output_tokens,
            },
        };
        let url = self.endpoint();

        with_backoff(self.retry, "Gemini completion", || async {
            {
                let mut limiter = self.rate_limiter.lock().await;
                limiter.acquire().await;
            }

            let response = match self
                .client
                .post(&url)
                .header("x-goog-api-key", &self.api_key)
                .json(&request)
                .send()
                .await
            {
                Ok(resp) => resp,
                Err(e) => return Attempt::Retry(anyhow::anyhow!("Failed to send completion request: {}", e)),
            };

            let status = response.status();
            let body = match response.text().await {
                Ok(body) => body,
                Err(e) => return Attempt::Retry(anyhow::anyhow!("Failed to read response body: {}", e)),
            };

            if status.is_success() {
                return match serde_json::from_str::<GenerateResponse>(&body) {
                    Ok(parsed) => match extract_text(parsed) {
                        Some(text) => Attempt::Done(text),
                        None => Attempt::Fail(anyhow::anyhow!("Gemini returned no text")),
                    },
                    Err(e) => Attempt::Fail(anyhow::anyhow!("Failed to parse completion response: {}", e)),
                };
            }

            if status.as_u16() == 429 || status.is_server_error() {
                return Attempt::Retry(anyhow::anyhow!("Gemini completion returned {}", status));
            }

            Attempt::Fail(classify_gemini_failure(status, &body))
        })
        .await
    }

    fn name(&self) -> &str {
        &self.model
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_uses_model() {
        let llm = GeminiLlm::new("fake_key".to_string(), "gemini-2.0-flash").unwrap();
        assert!(llm.endpoint().ends_with("/gemini-2.0-flash:generateContent"));
        assert_eq!(llm.name(), "gemini-2.0-flash");
    }

    #[test]
    fn test_extract_text_joins_parts() {
        let body = r#"{"candidates":[{"content":{"parts":[{"text":"pricing "},{"text":"cost fees"}]}}]}"#;
        let parsed: GenerateResponse = serde_json::from_str(body).unwrap();
        assert_eq!(extract_text(parsed), Some("pricing cost fees".to_string()));
    }

    #[test]
    fn test_extract_text_empty() {
        let parsed: GenerateResponse = serde_json::from_str(r#"{"candidates":[]}"#).unwrap();
        assert_eq!(extract_text(parsed), None);
    }
}
