//! Upstream provider adaptor contract
//!
//! Wire translation lives outside this crate; the accounting core only needs
//! the pieces of an adaptor that influence billing: the default pricing map,
//! scalar ratio fallbacks, and a single dispatch suspension point.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::core::pricing::types::{ModelConfig, DEFAULT_COMPLETION_RATIO, DEFAULT_MODEL_RATIO};
use crate::core::types::{ChatRequest, ChatResponse, RequestMeta, Usage};
use crate::utils::error::Result;

/// Result of one upstream exchange: the normalized response and the usage
/// the provider reported for it.
#[derive(Debug, Clone)]
pub struct UpstreamTurn {
    pub response: ChatResponse,
    pub usage: Usage,
}

impl UpstreamTurn {
    /// Usage for billing: the adaptor-extracted figure, falling back to the
    /// response body's usage block when the adaptor left it empty.
    pub fn billable_usage(&self) -> &Usage {
        if !self.usage.has_tokens() {
            if let Some(usage) = &self.response.usage {
                if usage.has_tokens() {
                    return usage;
                }
            }
        }
        &self.usage
    }
}

/// Provider adaptor seam consumed by the accounting core.
///
/// Implementations translate the canonical request to the provider wire
/// format, perform the exchange, and map the reply back. The request/response
/// halves are collapsed into one async `dispatch` call because the core only
/// needs a single suspension point per round.
#[async_trait]
pub trait UpstreamAdaptor: Send + Sync {
    /// Short provider name used in logs and billing metadata.
    fn channel_name(&self) -> &str;

    /// The provider's default per-model pricing map.
    fn default_model_pricing(&self) -> &HashMap<String, ModelConfig>;

    /// Scalar base-ratio fallback when the map has no entry for `model`.
    fn model_ratio(&self, model: &str) -> f64 {
        self.default_model_pricing()
            .get(model)
            .map(|c| c.ratio)
            .unwrap_or(DEFAULT_MODEL_RATIO)
    }

    /// Scalar completion-ratio fallback when the map has no entry for `model`.
    fn completion_ratio(&self, model: &str) -> f64 {
        self.default_model_pricing()
            .get(model)
            .and_then(|c| c.completion_ratio)
            .unwrap_or(DEFAULT_COMPLETION_RATIO)
    }

    /// Render the provider wire-format body for `request`.
    fn convert_request(&self, request: &ChatRequest) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(request)?)
    }

    /// Perform one upstream exchange.
    ///
    /// Implementations must call [`RequestMeta::mark_forwarded`] before the
    /// request body leaves the process, so that a later ambiguous failure
    /// suppresses refunds.
    async fn dispatch(&self, request: &ChatRequest, meta: &RequestMeta) -> Result<UpstreamTurn>;
}
