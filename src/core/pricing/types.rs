//! Pricing data model.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Absolute base-ratio fallback: quota per prompt token when nothing else
/// knows the model. Equivalent to 2.5 USD per million tokens at the default
/// quota-per-USD constant.
pub const DEFAULT_MODEL_RATIO: f64 = 2.5e-6;

/// Absolute completion-ratio fallback: output priced the same as input.
pub const DEFAULT_COMPLETION_RATIO: f64 = 1.0;

/// One tier of a volume-priced model, keyed by an input-token threshold.
///
/// Tier lists are ordered ascending by threshold. A tier that leaves
/// `completion_ratio` unset inherits the nearest lower tier's value, or the
/// model's base completion ratio if no lower tier set one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRatioTier {
    /// Tier applies when prompt tokens >= this threshold
    pub input_token_threshold: u32,
    pub ratio: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_ratio: Option<f64>,
}

/// Per-second audio pricing in USD.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioPricing {
    pub prompt_usd_per_second: f64,
    pub completion_usd_per_second: f64,
}

/// Per-image pricing in USD, with optional per-variant multiplier overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ImagePricing {
    pub usd_per_image: f64,
    /// Overrides keyed by `"{size}:{quality}"`, e.g. `"1024x1792:hd"`.
    /// When absent the standard size/quality multiplier table applies.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub multiplier_overrides: HashMap<String, f64>,
}

/// Per-second video pricing in USD, with resolution multipliers relative to
/// the model's base resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoPricing {
    pub usd_per_second: f64,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub resolution_multipliers: HashMap<String, f64>,
}

/// Complete price-layer record for one model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Base quota per prompt token
    pub ratio: f64,
    /// Output-token multiplier relative to `ratio`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_ratio: Option<f64>,
    /// Multiplier for cache-hit prompt tokens. Negative means free.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached_input_ratio: Option<f64>,
    /// Volume tiers, ascending by threshold
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tiers: Option<Vec<ModelRatioTier>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<AudioPricing>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<ImagePricing>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video: Option<VideoPricing>,
}

impl ModelConfig {
    /// Flat-rate config with only a base ratio.
    pub fn flat(ratio: f64) -> Self {
        Self {
            ratio,
            completion_ratio: None,
            cached_input_ratio: None,
            tiers: None,
            audio: None,
            image: None,
            video: None,
        }
    }

    pub fn with_completion_ratio(mut self, completion_ratio: f64) -> Self {
        self.completion_ratio = Some(completion_ratio);
        self
    }

    pub fn with_tiers(mut self, tiers: Vec<ModelRatioTier>) -> Self {
        self.tiers = Some(tiers);
        self
    }
}
