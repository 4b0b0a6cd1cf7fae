//! Token and latency accounting for agent runs.

use serde::{Deserialize, Serialize};

use crate::types::TokenUsage;

/// Aggregated usage across the steps of one run.
#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RunMetrics {
    pub steps: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub inference_time_ms: u64,
}

impl RunMetrics {
    /// Record one completed LLM call.
    pub fn record(&mut self, usage: &TokenUsage, inference_time_ms: u64) {
        self.steps += 1;
        self.prompt_tokens += usage.prompt_tokens;
        self.completion_tokens += usage.completion_tokens;
        self.total_tokens += usage.total_tokens;
        self.inference_time_ms += inference_time_ms;
    }

    /// Merge the values from another metrics instance into this one.
    pub fn merge(&mut self, other: &RunMetrics) {
        self.steps += other.steps;
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
        self.inference_time_ms += other.inference_time_ms;
    }
}
