//! 스코어 기본 연산 - 부스트/페널티 산술과 클램핑
//!
//! 피드백 누적값(adjustment)은 항상 `[floor, cap]` 범위 안에 있어야 합니다.

use serde::{Deserialize, Serialize};

/// 프래그먼트 식별자 (지식 저장소의 row id)
pub type FragmentId = i64;

// ============================================================================
// Polarity
// ============================================================================

/// 피드백 방향
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Polarity {
    Positive,
    Negative,
}

impl Polarity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Polarity::Positive => "positive",
            Polarity::Negative => "negative",
        }
    }
}

impl std::str::FromStr for Polarity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "positive" | "up" | "+" => Ok(Polarity::Positive),
            "negative" | "down" | "-" => Ok(Polarity::Negative),
            other => Err(format!("unknown polarity: {}", other)),
        }
    }
}

// ============================================================================
// Bounds & Weights
// ============================================================================

/// adjustment 허용 범위
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdjustmentBounds {
    pub floor: f64,
    pub cap: f64,
}

impl Default for AdjustmentBounds {
    fn default() -> Self {
        Self {
            floor: -0.5,
            cap: 0.5,
        }
    }
}

impl AdjustmentBounds {
    /// 범위 안으로 클램핑 (NaN은 0.0으로 취급)
    pub fn clamp(&self, value: f64) -> f64 {
        if value.is_nan() {
            return 0.0_f64.clamp(self.floor, self.cap);
        }
        value.clamp(self.floor, self.cap)
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.floor && value <= self.cap
    }
}

/// 피드백 한 건당 부스트/페널티 크기
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeedbackWeights {
    pub boost: f64,
    pub penalty: f64,
}

impl Default for FeedbackWeights {
    fn default() -> Self {
        // 페널티를 부스트보다 크게
        Self {
            boost: 0.1,
            penalty: 0.15,
        }
    }
}

impl FeedbackWeights {
    /// 방향에 따른 변화량 (+boost 또는 -penalty)
    pub fn delta(&self, polarity: Polarity) -> f64 {
        match polarity {
            Polarity::Positive => self.boost.abs(),
            Polarity::Negative => -self.penalty.abs(),
        }
    }
}

/// 현재값에 변화량을 더하고 범위로 클램핑
pub fn apply_delta(current: f64, delta: f64, bounds: AdjustmentBounds) -> f64 {
    bounds.clamp(bounds.clamp(current) + delta)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_delta_direction() {
        let weights = FeedbackWeights::default();
        assert!((weights.delta(Polarity::Positive) - 0.1).abs() < 1e-9);
        assert!((weights.delta(Polarity::Negative) + 0.15).abs() < 1e-9);
    }

    #[test]
    fn test_apply_delta_clamps() {
        let bounds = AdjustmentBounds::default();
        assert_eq!(apply_delta(0.45, 0.1, bounds), 0.5);
        assert_eq!(apply_delta(-0.4, -0.15, bounds), -0.5);
        assert!((apply_delta(0.0, 0.1, bounds) - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_nan_treated_as_zero() {
        let bounds = AdjustmentBounds::default();
        assert_eq!(bounds.clamp(f64::NAN), 0.0);
    }

    #[test]
    fn test_polarity_parse() {
        assert_eq!("positive".parse::<Polarity>(), Ok(Polarity::Positive));
        assert_eq!("DOWN".parse::<Polarity>(), Ok(Polarity::Negative));
        assert!("maybe".parse::<Polarity>().is_err());
    }

    proptest! {
        #[test]
        fn prop_feedback_sequence_stays_in_bounds(events in proptest::collection::vec(any::<bool>(), 0..200)) {
            let bounds = AdjustmentBounds::default();
            let weights = FeedbackWeights::default();
            let mut value = 0.0;
            for positive in events {
                let polarity = if positive { Polarity::Positive } else { Polarity::Negative };
                value = apply_delta(value, weights.delta(polarity), bounds);
                prop_assert!(bounds.contains(value));
            }
        }
    }
}
