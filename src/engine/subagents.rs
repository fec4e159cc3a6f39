use std::collections::BTreeSet;

use chrono::{DateTime, Utc};

use crate::pricing::cache_hit_rate;
use crate::query::{SourceData, ops};
use crate::types::{
    CostBreakdown, SessionAggregate, SessionMetrics, SessionStatus, SubagentInfo, TokenUsage,
};

/// Everything one subagent log contributes to its parent session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubagentTotals {
    pub tokens: TokenUsage,
    pub cost: CostBreakdown,
    pub models: BTreeSet<String>,
    pub tool_calls: u64,
    pub error_count: u64,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl SubagentTotals {
    pub fn from_source(data: &SourceData) -> Self {
        let (start_time, end_time) = ops::time_range(data);
        Self {
            tokens: ops::token_usage(data),
            cost: ops::cost(data),
            models: ops::models_used(data).into_iter().collect(),
            tool_calls: ops::tool_call_count(data),
            error_count: ops::error_count(data),
            start_time,
            end_time,
        }
    }

    pub fn add_to_metrics(&self, metrics: &mut SessionMetrics) {
        metrics.tokens += self.tokens;
        metrics.cost += self.cost;
        metrics.error_count += self.error_count;

        let mut models: BTreeSet<String> = metrics.models_used.drain(..).collect();
        models.extend(self.models.iter().cloned());
        metrics.models_used = models.into_iter().collect();
        metrics.cache_hit_rate = cache_hit_rate(&metrics.tokens);
    }

    /// Fill in what only the subagent's own log knows. A log with activity is done.
    pub fn apply_to(&self, info: &mut SubagentInfo) {
        info.status = if self.end_time.is_some() {
            SessionStatus::Completed
        } else {
            SessionStatus::Running
        };
        info.start_time = info.start_time.or(self.start_time);
        info.end_time = self.end_time;
        info.tokens = self.tokens;
        info.cost = self.cost.total();
        info.tool_calls = self.tool_calls;
        info.error_count = self.error_count;
    }

    pub fn add_to_aggregate(&self, aggregate: &mut SessionAggregate) {
        let mut tokens = aggregate.tokens();
        tokens += self.tokens;
        aggregate.set_tokens(tokens);
        aggregate.total_cost += self.cost.total();
        aggregate.error_count += self.error_count;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn totals() -> SubagentTotals {
        SubagentTotals {
            tokens: TokenUsage {
                input_tokens: 10,
                cache_read_input_tokens: 30,
                ..Default::default()
            },
            cost: CostBreakdown {
                input_cost: 0.25,
                ..Default::default()
            },
            models: ["claude-haiku-4-5".to_string()].into_iter().collect(),
            error_count: 2,
            ..Default::default()
        }
    }

    #[test]
    fn test_metrics_merge_models_and_recompute_hit_rate() {
        let mut metrics = SessionMetrics {
            tokens: TokenUsage {
                input_tokens: 60,
                ..Default::default()
            },
            models_used: vec!["claude-sonnet-4-20250514".into(), "claude-haiku-4-5".into()],
            ..Default::default()
        };
        totals().add_to_metrics(&mut metrics);

        assert_eq!(metrics.tokens.input_tokens, 70);
        assert_eq!(metrics.error_count, 2);
        assert_eq!(
            metrics.models_used,
            vec!["claude-haiku-4-5".to_string(), "claude-sonnet-4-20250514".to_string()]
        );
        assert!((metrics.cache_hit_rate - 30.0).abs() < 1e-9);
    }

    #[test]
    fn test_aggregate_gets_tokens_cost_and_errors() {
        let mut aggregate = SessionAggregate {
            input_tokens: 5,
            total_cost: 1.0,
            tool_calls: 3,
            ..Default::default()
        };
        totals().add_to_aggregate(&mut aggregate);

        assert_eq!(aggregate.input_tokens, 15);
        assert_eq!(aggregate.cache_read_input_tokens, 30);
        assert!((aggregate.total_cost - 1.25).abs() < 1e-9);
        assert_eq!(aggregate.error_count, 2);
        assert_eq!(aggregate.tool_calls, 3);
    }
}
