//! Layered price resolution.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use super::global::{global_pricing, GlobalPricingTable};
use super::types::{
    AudioPricing, ImagePricing, ModelConfig, VideoPricing, DEFAULT_COMPLETION_RATIO,
    DEFAULT_MODEL_RATIO,
};
use crate::core::adaptor::UpstreamAdaptor;

/// Fully resolved pricing for one request at a known prompt size.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectivePricing {
    /// Quota per prompt token
    pub input_ratio: f64,
    /// Quota per completion token (`input_ratio` times the completion ratio)
    pub output_ratio: f64,
    /// Cache-hit prompt multiplier; negative means free
    pub cached_input_ratio: Option<f64>,
    /// Threshold of the tier that applied, when volume tiers were in play
    pub applied_tier_threshold: Option<u32>,
}

/// Resolves model prices through the channel/provider/global/constant layers.
///
/// Resolution never fails: every scalar lookup bottoms out at an absolute
/// constant. Modality lookups return `None` when no layer prices the
/// modality, since there is no sensible constant for media.
pub struct PricingResolver {
    global: Arc<GlobalPricingTable>,
    channel_overrides: HashMap<String, ModelConfig>,
}

impl PricingResolver {
    /// Resolver bound to the process-wide global pricing table.
    pub fn new() -> Self {
        Self::with_table(global_pricing())
    }

    /// Resolver bound to a specific table. Used by tests and by deployments
    /// that scope pricing per tenant.
    pub fn with_table(global: Arc<GlobalPricingTable>) -> Self {
        Self {
            global,
            channel_overrides: HashMap::new(),
        }
    }

    /// Install the channel's per-model override map. Key presence decides:
    /// an entry with ratio 0 is a real price of zero, not an absence.
    pub fn with_channel_overrides(mut self, overrides: HashMap<String, ModelConfig>) -> Self {
        self.channel_overrides = overrides;
        self
    }

    /// First layer that has any entry for `model`, in override order.
    fn layered_config(&self, model: &str, adaptor: &dyn UpstreamAdaptor) -> Option<ModelConfig> {
        if let Some(config) = self.channel_overrides.get(model) {
            return Some(config.clone());
        }
        if let Some(config) = adaptor.default_model_pricing().get(model) {
            return Some(config.clone());
        }
        self.global.get(model)
    }

    /// Base prompt-token ratio for `model`.
    pub fn model_ratio(&self, model: &str, adaptor: &dyn UpstreamAdaptor) -> f64 {
        match self.layered_config(model, adaptor) {
            Some(config) => config.ratio,
            None => {
                debug!(model = %model, "no pricing layer has model, using fallback ratio");
                DEFAULT_MODEL_RATIO
            }
        }
    }

    /// Completion-token multiplier for `model`.
    ///
    /// Resolved independently of the base ratio: a layer contributes only
    /// when its entry actually sets a completion ratio.
    pub fn completion_ratio(&self, model: &str, adaptor: &dyn UpstreamAdaptor) -> f64 {
        self.field(model, adaptor, |c| c.completion_ratio)
            .unwrap_or(DEFAULT_COMPLETION_RATIO)
    }

    /// Cache-hit prompt multiplier, when any layer prices caching.
    pub fn cached_input_ratio(&self, model: &str, adaptor: &dyn UpstreamAdaptor) -> Option<f64> {
        self.field(model, adaptor, |c| c.cached_input_ratio)
    }

    pub fn resolve_audio_pricing(
        &self,
        model: &str,
        adaptor: &dyn UpstreamAdaptor,
    ) -> Option<AudioPricing> {
        self.field(model, adaptor, |c| c.audio.clone())
    }

    pub fn resolve_image_pricing(
        &self,
        model: &str,
        adaptor: &dyn UpstreamAdaptor,
    ) -> Option<ImagePricing> {
        self.field(model, adaptor, |c| c.image.clone())
    }

    pub fn resolve_video_pricing(
        &self,
        model: &str,
        adaptor: &dyn UpstreamAdaptor,
    ) -> Option<VideoPricing> {
        self.field(model, adaptor, |c| c.video.clone())
    }

    /// Resolve the effective input/output ratios for a request whose prompt
    /// size is known, applying volume tiers.
    ///
    /// Tier selection picks the greatest threshold that is <= `prompt_tokens`.
    /// A selected tier without its own completion ratio inherits the nearest
    /// lower tier's, falling back to the base completion ratio.
    pub fn resolve_effective_pricing(
        &self,
        model: &str,
        prompt_tokens: u32,
        adaptor: &dyn UpstreamAdaptor,
    ) -> EffectivePricing {
        let config = self.layered_config(model, adaptor);
        let base_ratio = config.as_ref().map(|c| c.ratio).unwrap_or(DEFAULT_MODEL_RATIO);
        let base_completion = self.completion_ratio(model, adaptor);
        let cached_input_ratio = self.cached_input_ratio(model, adaptor);

        let mut input_ratio = base_ratio;
        let mut completion_ratio = base_completion;
        let mut applied_tier_threshold = None;

        if let Some(tiers) = config.as_ref().and_then(|c| c.tiers.as_ref()) {
            let mut inherited_completion = base_completion;
            for tier in tiers {
                if tier.input_token_threshold > prompt_tokens {
                    break;
                }
                if let Some(tier_completion) = tier.completion_ratio {
                    inherited_completion = tier_completion;
                }
                input_ratio = tier.ratio;
                completion_ratio = inherited_completion;
                applied_tier_threshold = Some(tier.input_token_threshold);
            }
        }

        EffectivePricing {
            input_ratio,
            output_ratio: input_ratio * completion_ratio,
            cached_input_ratio,
            applied_tier_threshold,
        }
    }

    fn field<T>(
        &self,
        model: &str,
        adaptor: &dyn UpstreamAdaptor,
        extract: impl Fn(&ModelConfig) -> Option<T>,
    ) -> Option<T> {
        if let Some(value) = self.channel_overrides.get(model).and_then(&extract) {
            return Some(value);
        }
        if let Some(value) = adaptor.default_model_pricing().get(model).and_then(&extract) {
            return Some(value);
        }
        self.global.get(model).as_ref().and_then(&extract)
    }
}

impl Default for PricingResolver {
    fn default() -> Self {
        Self::new()
    }
}
