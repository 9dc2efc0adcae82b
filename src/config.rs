//! 설정 - ~/.feedrank/config.toml
//!
//! 튜닝 상수(부스트, 페널티, 플래그 임계값, RRF 상수 등)는 모두 설정값입니다.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::knowledge::get_data_dir;
use crate::retry::RetryPolicy;
use crate::scoring::{AdjustmentBounds, FeedbackWeights};

/// 전체 설정
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeedrankConfig {
    /// 데이터 디렉토리 (기본: ~/.feedrank)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub feedback: FeedbackConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub augment: AugmentConfig,
    #[serde(default)]
    pub providers: ProviderConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub top_k: usize,
    /// RRF 감쇠 상수
    pub rrf_constant: f64,
    /// 랭커별 후보 수 = top_k * multiplier
    pub candidate_multiplier: usize,
    /// 확장 용어 가중치 (원본 용어 = 1.0)
    pub expanded_term_weight: f64,
    /// 학습된 쿼리→프래그먼트 매핑을 랭킹으로 사용
    pub use_history: bool,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            rrf_constant: 60.0,
            candidate_multiplier: 2,
            expanded_term_weight: 0.5,
            use_history: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedbackConfig {
    pub boost: f64,
    pub penalty: f64,
    pub adjustment_floor: f64,
    pub adjustment_cap: f64,
    /// 플래그 생성 임계 부정 피드백 수
    pub flag_threshold: u32,
    /// 부정 피드백 카운터 보존 기간 (일)
    pub retention_days: i64,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        let weights = FeedbackWeights::default();
        let bounds = AdjustmentBounds::default();
        Self {
            boost: weights.boost,
            penalty: weights.penalty,
            adjustment_floor: bounds.floor,
            adjustment_cap: bounds.cap,
            flag_threshold: 2,
            retention_days: 30,
        }
    }
}

impl FeedbackConfig {
    pub fn weights(&self) -> FeedbackWeights {
        FeedbackWeights {
            boost: self.boost,
            penalty: self.penalty,
        }
    }

    pub fn bounds(&self) -> AdjustmentBounds {
        AdjustmentBounds {
            floor: self.adjustment_floor.min(self.adjustment_cap),
            cap: self.adjustment_cap.max(self.adjustment_floor),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub ttl_hours: i64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_hours: 24,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AugmentConfig {
    pub use_expansion: bool,
    pub use_hyde: bool,
    /// 정적 동의어 규칙 (단어 → 관련어)
    pub synonyms: BTreeMap<String, Vec<String>>,
}

impl Default for AugmentConfig {
    fn default() -> Self {
        Self {
            use_expansion: true,
            use_hyde: false,
            synonyms: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub embedding_dimension: usize,
    pub completion_model: String,
    pub retry: RetryPolicy,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            embedding_dimension: crate::embedding::DEFAULT_DIMENSION,
            completion_model: crate::llm::DEFAULT_MODEL.to_string(),
            retry: RetryPolicy::default(),
        }
    }
}

impl FeedrankConfig {
    /// 기본 위치에서 로드 (없으면 기본값으로 생성)
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// 지정 경로에서 로드 (없으면 기본값으로 생성)
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            let config = FeedrankConfig::default();
            config.save_to(path)?;
            return Ok(config);
        }

        let contents = fs::read_to_string(path).context("Failed to read config file")?;
        let config: FeedrankConfig =
            toml::from_str(&contents).context("Failed to parse config file")?;
        config.validate()?;

        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let toml_string = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, toml_string).context("Failed to write config file")?;

        Ok(())
    }

    /// 설정 파일 경로
    pub fn config_path() -> PathBuf {
        get_data_dir().join("config.toml")
    }

    /// 데이터 디렉토리 (설정 우선)
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(get_data_dir)
    }

    /// 값 범위 검증
    pub fn validate(&self) -> Result<()> {
        if self.retrieval.top_k == 0 {
            anyhow::bail!("retrieval.top_k must be at least 1");
        }
        if self.retrieval.rrf_constant < 0.0 {
            anyhow::bail!("retrieval.rrf_constant must not be negative");
        }
        if self.feedback.flag_threshold == 0 {
            anyhow::bail!("feedback.flag_threshold must be at least 1");
        }
        if self.feedback.adjustment_floor > self.feedback.adjustment_cap {
            anyhow::bail!(
                "feedback.adjustment_floor ({}) exceeds adjustment_cap ({})",
                self.feedback.adjustment_floor,
                self.feedback.adjustment_cap
            );
        }
        if self.cache.ttl_hours <= 0 {
            anyhow::bail!("cache.ttl_hours must be positive");
        }
        // 벡터 테이블 스키마가 고정 차원
        if self.providers.embedding_dimension != crate::knowledge::EMBEDDING_DIMENSION as usize {
            anyhow::bail!(
                "providers.embedding_dimension must be {} (vector table dimension)",
                crate::knowledge::EMBEDDING_DIMENSION
            );
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
