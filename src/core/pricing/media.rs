//! Media billing helpers.
//!
//! Image, audio and video charges are converted to quota units up front and
//! added into [`Usage::tools_cost`](crate::core::types::Usage), so the token
//! quota computation stays agnostic of modalities.

use tracing::debug;

use super::types::{AudioPricing, ImagePricing, VideoPricing};
use crate::core::types::{Quota, Usage};

/// Size/quality tier multiplier for image generation.
///
/// The base multiplier comes from the size table; HD quality then doubles a
/// square render and applies 1.5x to any other size. For DALL·E-3 this gives
/// standard/1024x1024 = 1, standard/1024x1792 = 2, hd/1024x1024 = 2,
/// hd/1024x1792 = 3.
pub fn image_tier_multiplier(size: &str, quality: &str) -> f64 {
    let size = size.trim().to_ascii_lowercase();
    let base = match size.as_str() {
        "1024x1024" => 1.0,
        "1024x1792" | "1792x1024" => 2.0,
        // Smaller legacy sizes bill at the base rate.
        _ => 1.0,
    };
    if quality.eq_ignore_ascii_case("hd") {
        if size == "1024x1024" {
            base * 2.0
        } else {
            base * 1.5
        }
    } else {
        base
    }
}

/// Tier multiplier honoring a channel's per-variant override, keyed
/// `"{size}:{quality}"` in the image pricing config.
pub fn resolved_image_multiplier(pricing: &ImagePricing, size: &str, quality: &str) -> f64 {
    let key = format!("{}:{}", size.trim().to_ascii_lowercase(), quality.to_ascii_lowercase());
    pricing
        .multiplier_overrides
        .get(&key)
        .copied()
        .unwrap_or_else(|| image_tier_multiplier(size, quality))
}

/// Quota for `n` generated images.
pub fn image_quota(
    pricing: &ImagePricing,
    size: &str,
    quality: &str,
    group_ratio: f64,
    n: u32,
    quota_per_usd: f64,
) -> Quota {
    let multiplier = resolved_image_multiplier(pricing, size, quality);
    let usd = pricing.usd_per_image * multiplier * n as f64;
    (usd * group_ratio * quota_per_usd).ceil() as Quota
}

/// Quota for audio measured in seconds, split by direction.
pub fn audio_quota(
    pricing: &AudioPricing,
    prompt_seconds: f64,
    completion_seconds: f64,
    group_ratio: f64,
    quota_per_usd: f64,
) -> Quota {
    let usd = pricing.prompt_usd_per_second * prompt_seconds
        + pricing.completion_usd_per_second * completion_seconds;
    (usd * group_ratio * quota_per_usd).ceil() as Quota
}

/// Quota for generated video, scaled by the resolution multiplier table.
/// Unknown resolutions bill at the base rate.
pub fn video_quota(
    pricing: &VideoPricing,
    seconds: f64,
    resolution: &str,
    group_ratio: f64,
    quota_per_usd: f64,
) -> Quota {
    let multiplier = pricing
        .resolution_multipliers
        .get(&resolution.trim().to_ascii_lowercase())
        .copied()
        .unwrap_or(1.0);
    let usd = pricing.usd_per_second * seconds * multiplier;
    (usd * group_ratio * quota_per_usd).ceil() as Quota
}

/// Add a media charge into a request's accumulated usage.
pub fn charge_media(usage: &mut Usage, quota: Quota, kind: &str) {
    debug!(kind = %kind, quota, "media charge added to tools cost");
    usage.tools_cost += quota;
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn dalle3_tier_table_is_exact() {
        assert_eq!(image_tier_multiplier("1024x1024", "standard"), 1.0);
        assert_eq!(image_tier_multiplier("1024x1792", "standard"), 2.0);
        assert_eq!(image_tier_multiplier("1792x1024", "standard"), 2.0);
        assert_eq!(image_tier_multiplier("1024x1024", "hd"), 2.0);
        assert_eq!(image_tier_multiplier("1024x1792", "hd"), 3.0);
        assert_eq!(image_tier_multiplier("1792x1024", "hd"), 3.0);
    }

    #[test]
    fn channel_override_beats_tier_table() {
        let mut overrides = HashMap::new();
        overrides.insert("1024x1024:hd".to_string(), 5.0);
        let pricing = ImagePricing {
            usd_per_image: 0.04,
            multiplier_overrides: overrides,
        };
        assert_eq!(resolved_image_multiplier(&pricing, "1024x1024", "hd"), 5.0);
        assert_eq!(resolved_image_multiplier(&pricing, "1024x1024", "standard"), 1.0);
    }

    #[test]
    fn image_quota_converts_usd_with_ceiling() {
        let pricing = ImagePricing {
            usd_per_image: 0.04,
            multiplier_overrides: HashMap::new(),
        };
        // 0.04 USD * 3x * 2 images * 500,000 = 120,000
        let quota = image_quota(&pricing, "1024x1792", "hd", 1.0, 2, 500_000.0);
        assert_eq!(quota, 120_000);
    }

    #[test]
    fn video_unknown_resolution_bills_base_rate() {
        let pricing = VideoPricing {
            usd_per_second: 0.1,
            resolution_multipliers: HashMap::from([("1080p".to_string(), 2.0)]),
        };
        assert_eq!(video_quota(&pricing, 10.0, "1080p", 1.0, 500_000.0), 1_000_000);
        assert_eq!(video_quota(&pricing, 10.0, "480p", 1.0, 500_000.0), 500_000);
    }
}
