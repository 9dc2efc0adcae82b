//! 히스토리 랭커 - 학습된 쿼리→프래그먼트 매핑 기반 순위

use std::sync::Arc;

use async_trait::async_trait;

use super::{into_ranked, RankedResult, RankerTag, RankingQuery, RankingSource};
use crate::error::Result;
use crate::feedback::FeedbackLearner;

/// 긍정 피드백으로 학습한 매핑을 순위로 제공
pub struct HistoryRanker {
    learner: Arc<FeedbackLearner>,
}

impl HistoryRanker {
    pub fn new(learner: Arc<FeedbackLearner>) -> Self {
        Self { learner }
    }
}

#[async_trait]
impl RankingSource for HistoryRanker {
    fn tag(&self) -> RankerTag {
        RankerTag::History
    }

    async fn produce_ranking(&self, query: &RankingQuery) -> Result<Vec<RankedResult>> {
        let mut boosts = self.learner.learned_boosts(&query.query_key, &query.text)?;
        boosts.truncate(query.limit);
        Ok(into_ranked(RankerTag::History, boosts))
    }
}
