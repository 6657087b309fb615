//! Pure quota computation.
//!
//! `compute` is deterministic and side-effect free. It is called twice per
//! request: once for the pre-consume estimate (with the max-completion hint)
//! and once at reconciliation (with the actual counts). Both calls must use
//! the same arithmetic or the reconcile delta drifts.

use crate::core::adaptor::UpstreamAdaptor;
use crate::core::pricing::PricingResolver;
use crate::core::types::{Quota, Usage};

/// Inputs for one quota computation.
pub struct ComputeInput<'a> {
    pub usage: &'a Usage,
    pub model_name: &'a str,
    /// Base prompt-token ratio, already tier-resolved by the caller
    pub model_ratio: f64,
    pub group_ratio: f64,
    /// Channel-level completion-ratio override, when the channel sets one
    pub channel_completion_ratio: Option<f64>,
    pub resolver: &'a PricingResolver,
    pub adaptor: &'a dyn UpstreamAdaptor,
}

/// Quota figure plus the inputs that produced it, for audit records.
#[derive(Debug, Clone, PartialEq)]
pub struct ComputeResult {
    pub total_quota: Quota,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub cached_prompt_tokens: u32,
    pub cached_completion_tokens: u32,
    pub used_model_ratio: f64,
    pub used_completion_ratio: f64,
}

/// Compute the total quota owed for `usage`.
///
/// `total = ceil(prompt*ratio*group + completion*ratio*group*completion_ratio)
/// + tools_cost`, clamped to 1 when the combined ratio is non-zero but the
/// token base rounds to <= 0. Zero tokens force a total of zero: that is the
/// signal that the upstream produced no billable content.
pub fn compute(input: ComputeInput<'_>) -> ComputeResult {
    let completion_ratio = input.channel_completion_ratio.unwrap_or_else(|| {
        input
            .resolver
            .completion_ratio(input.model_name, input.adaptor)
    });

    let usage = input.usage;
    let prompt = usage.prompt_tokens as f64;
    let completion = usage.completion_tokens as f64;
    let combined = input.model_ratio * input.group_ratio;

    let total_quota = if usage.has_tokens() {
        let mut base = (prompt * combined + completion * combined * completion_ratio).ceil() as Quota;
        if combined != 0.0 && base <= 0 {
            base = 1;
        }
        base + usage.tools_cost
    } else {
        0
    };

    ComputeResult {
        total_quota,
        prompt_tokens: usage.prompt_tokens,
        completion_tokens: usage.completion_tokens,
        cached_prompt_tokens: usage.cached_prompt_tokens,
        cached_completion_tokens: usage.cached_completion_tokens,
        used_model_ratio: input.model_ratio,
        used_completion_ratio: completion_ratio,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use async_trait::async_trait;

    use super::*;
    use crate::core::pricing::{GlobalPricingTable, ModelConfig};
    use crate::core::types::{ChatRequest, RequestMeta};
    use crate::core::UpstreamTurn;
    use crate::utils::error::{GatewayError, Result};

    struct NullAdaptor {
        pricing: HashMap<String, ModelConfig>,
    }

    #[async_trait]
    impl UpstreamAdaptor for NullAdaptor {
        fn channel_name(&self) -> &str {
            "null"
        }

        fn default_model_pricing(&self) -> &HashMap<String, ModelConfig> {
            &self.pricing
        }

        async fn dispatch(&self, _: &ChatRequest, _: &RequestMeta) -> Result<UpstreamTurn> {
            Err(GatewayError::internal("no dispatch in compute tests"))
        }
    }

    fn adaptor_with(model: &str, config: ModelConfig) -> NullAdaptor {
        NullAdaptor {
            pricing: HashMap::from([(model.to_string(), config)]),
        }
    }

    fn resolver() -> PricingResolver {
        PricingResolver::with_table(Arc::new(GlobalPricingTable::new()))
    }

    #[test]
    fn total_includes_completion_ratio_and_tools_cost() {
        let adaptor = adaptor_with("m", ModelConfig::flat(0.001).with_completion_ratio(2.0));
        let resolver = resolver();
        let usage = Usage {
            prompt_tokens: 1000,
            completion_tokens: 500,
            total_tokens: 1500,
            tools_cost: 42,
            ..Usage::default()
        };
        let result = compute(ComputeInput {
            usage: &usage,
            model_name: "m",
            model_ratio: 0.001,
            group_ratio: 1.0,
            channel_completion_ratio: None,
            resolver: &resolver,
            adaptor: &adaptor,
        });
        // ceil(1000*0.001 + 500*0.001*2.0) + 42 = 2 + 42
        assert_eq!(result.total_quota, 44);
        assert_eq!(result.used_completion_ratio, 2.0);
    }

    #[test]
    fn zero_tokens_force_zero_quota() {
        let adaptor = adaptor_with("m", ModelConfig::flat(0.001));
        let resolver = resolver();
        let usage = Usage {
            tools_cost: 100,
            ..Usage::default()
        };
        let result = compute(ComputeInput {
            usage: &usage,
            model_name: "m",
            model_ratio: 0.001,
            group_ratio: 1.0,
            channel_completion_ratio: None,
            resolver: &resolver,
            adaptor: &adaptor,
        });
        assert_eq!(result.total_quota, 0);
    }

    #[test]
    fn nonzero_ratio_nonzero_tokens_never_bill_zero() {
        let adaptor = adaptor_with("m", ModelConfig::flat(1e-9));
        let resolver = resolver();
        let usage = Usage {
            prompt_tokens: 1,
            total_tokens: 1,
            ..Usage::default()
        };
        let result = compute(ComputeInput {
            usage: &usage,
            model_name: "m",
            model_ratio: 1e-9,
            group_ratio: 1.0,
            channel_completion_ratio: None,
            resolver: &resolver,
            adaptor: &adaptor,
        });
        assert_eq!(result.total_quota, 1);
    }

    #[test]
    fn zero_ratio_bills_zero() {
        let adaptor = adaptor_with("m", ModelConfig::flat(0.0));
        let resolver = resolver();
        let usage = Usage {
            prompt_tokens: 100,
            completion_tokens: 100,
            total_tokens: 200,
            ..Usage::default()
        };
        let result = compute(ComputeInput {
            usage: &usage,
            model_name: "m",
            model_ratio: 0.0,
            group_ratio: 1.0,
            channel_completion_ratio: None,
            resolver: &resolver,
            adaptor: &adaptor,
        });
        assert_eq!(result.total_quota, 0);
    }

    #[test]
    fn channel_completion_ratio_override_wins() {
        let adaptor = adaptor_with("m", ModelConfig::flat(1.0).with_completion_ratio(4.0));
        let resolver = resolver();
        let usage = Usage {
            prompt_tokens: 10,
            completion_tokens: 10,
            total_tokens: 20,
            ..Usage::default()
        };
        let result = compute(ComputeInput {
            usage: &usage,
            model_name: "m",
            model_ratio: 1.0,
            group_ratio: 1.0,
            channel_completion_ratio: Some(1.0),
            resolver: &resolver,
            adaptor: &adaptor,
        });
        assert_eq!(result.used_completion_ratio, 1.0);
        assert_eq!(result.total_quota, 20);
    }
}
