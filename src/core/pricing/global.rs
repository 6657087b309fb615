//! Global merged pricing table.
//!
//! Built by unioning every registered provider's default pricing map. The
//! merged map is an immutable snapshot behind an `ArcSwap`: readers never
//! block, and a reload builds a fresh map and swaps it in atomically.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::info;

use super::types::ModelConfig;

type PricingMap = HashMap<String, ModelConfig>;

/// Merged union of every registered provider's default pricing map.
///
/// First-registered provider wins on model-name collisions; registration
/// order is therefore meaningful and preserved for reloads.
pub struct GlobalPricingTable {
    snapshot: ArcSwap<PricingMap>,
    // Registration log, replayed on reload. Guards writes only; reads go
    // through the snapshot.
    registered: Mutex<Vec<(String, PricingMap)>>,
}

impl GlobalPricingTable {
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(PricingMap::new()),
            registered: Mutex::new(Vec::new()),
        }
    }

    /// Register a provider's default pricing map and merge it into the
    /// snapshot. Models already present (registered earlier) are kept.
    pub fn register(&self, provider: impl Into<String>, defaults: &PricingMap) {
        let provider = provider.into();
        let mut registered = self.registered.lock();
        registered.push((provider.clone(), defaults.clone()));

        let mut merged = (**self.snapshot.load()).clone();
        let mut added = 0usize;
        for (model, config) in defaults {
            if !merged.contains_key(model) {
                merged.insert(model.clone(), config.clone());
                added += 1;
            }
        }
        self.snapshot.store(Arc::new(merged));
        info!(provider = %provider, models_added = added, "registered provider pricing");
    }

    /// Rebuild the snapshot from the registration log and swap it in.
    pub fn reload(&self) {
        let registered = self.registered.lock();
        let mut merged = PricingMap::new();
        for (_, defaults) in registered.iter() {
            for (model, config) in defaults {
                merged.entry(model.clone()).or_insert_with(|| config.clone());
            }
        }
        info!(models = merged.len(), "reloaded global pricing snapshot");
        self.snapshot.store(Arc::new(merged));
    }

    /// Current snapshot. Cheap; safe to hold across awaits.
    pub fn snapshot(&self) -> Arc<PricingMap> {
        self.snapshot.load_full()
    }

    pub fn get(&self, model: &str) -> Option<ModelConfig> {
        self.snapshot.load().get(model).cloned()
    }
}

impl Default for GlobalPricingTable {
    fn default() -> Self {
        Self::new()
    }
}

static GLOBAL_PRICING: Lazy<Arc<GlobalPricingTable>> =
    Lazy::new(|| Arc::new(GlobalPricingTable::new()));

/// Process-wide pricing table shared by default-constructed resolvers.
pub fn global_pricing() -> Arc<GlobalPricingTable> {
    Arc::clone(&GLOBAL_PRICING)
}
