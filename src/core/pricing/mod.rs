//! Layered model pricing resolution.
//!
//! Price lookups try, in order: the channel override map (key presence wins,
//! an explicit zero is a real price), the provider adaptor's default map, the
//! global merged map, and finally an absolute constant. Modality configs
//! (audio/image/video) follow the same order but stop before the constant.

pub mod global;
pub mod media;
pub mod resolver;
pub mod types;

pub use global::{global_pricing, GlobalPricingTable};
pub use resolver::{EffectivePricing, PricingResolver};
pub use types::{
    AudioPricing, ImagePricing, ModelConfig, ModelRatioTier, VideoPricing,
    DEFAULT_COMPLETION_RATIO, DEFAULT_MODEL_RATIO,
};
