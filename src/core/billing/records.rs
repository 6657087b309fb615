//! Billing audit records.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::quota::compute::ComputeResult;
use crate::core::types::{Quota, RequestMeta, Usage};

/// One append-only audit row, written at reconciliation for every completed
/// (or failed-with-usage) request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingRecord {
    pub request_id: String,
    pub trace_id: String,
    pub user_id: i64,
    pub token_id: i64,
    pub channel_id: i64,
    pub model_name: String,
    /// Signed delta applied at reconciliation vs what was pre-consumed
    pub quota_delta: Quota,
    /// Final figure the request settled at
    pub total_quota: Quota,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub cached_prompt_tokens: u32,
    pub cached_completion_tokens: u32,
    pub cache_write_tokens_5m: u32,
    pub cache_write_tokens_1h: u32,
    /// Ratios actually used, for audit replay
    pub used_model_ratio: f64,
    pub used_completion_ratio: f64,
    pub group_ratio: f64,
    pub tools_cost: Quota,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl BillingRecord {
    /// Skeleton record carrying the request identity and the final figure.
    pub fn for_request(meta: &RequestMeta, total_quota: Quota) -> Self {
        Self {
            request_id: meta.request_id.clone(),
            trace_id: meta.trace_id.clone(),
            user_id: meta.user_id,
            token_id: meta.token_id,
            channel_id: meta.channel_id,
            model_name: meta.model_name.clone(),
            quota_delta: 0,
            total_quota,
            prompt_tokens: 0,
            completion_tokens: 0,
            cached_prompt_tokens: 0,
            cached_completion_tokens: 0,
            cache_write_tokens_5m: 0,
            cache_write_tokens_1h: 0,
            used_model_ratio: 0.0,
            used_completion_ratio: 0.0,
            group_ratio: meta.group_ratio,
            tools_cost: 0,
            metadata: HashMap::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_usage(mut self, usage: &Usage) -> Self {
        self.cache_write_tokens_5m = usage.cache_write_tokens_5m;
        self.cache_write_tokens_1h = usage.cache_write_tokens_1h;
        self.tools_cost = usage.tools_cost;
        if let Some(tier) = &usage.service_tier {
            self.metadata
                .insert("service_tier".to_string(), serde_json::json!(tier));
        }
        self
    }

    pub fn with_compute(mut self, result: &ComputeResult) -> Self {
        self.prompt_tokens = result.prompt_tokens;
        self.completion_tokens = result.completion_tokens;
        self.cached_prompt_tokens = result.cached_prompt_tokens;
        self.cached_completion_tokens = result.cached_completion_tokens;
        self.used_model_ratio = result.used_model_ratio;
        self.used_completion_ratio = result.used_completion_ratio;
        self
    }

    pub fn with_delta(mut self, delta: Quota) -> Self {
        self.quota_delta = delta;
        self
    }

    pub fn insert_metadata(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.metadata.insert(key.into(), value);
    }
}
