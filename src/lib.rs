//! # tollgate
//!
//! Quota accounting and tool-orchestration core for a multi-provider LLM
//! gateway. The crate owns everything between "a request arrived with a
//! token" and "the final cost landed in the ledger":
//!
//! - **Pricing** ([`core::pricing`]): layered per-model price resolution
//!   (channel override, provider default, global merged map, constant
//!   fallback) with volume tiers and media pricing.
//! - **Quota** ([`core::quota`]): the pure cost computation, plus the ledger
//!   operations around it: optimistic pre-consume with a trust shortcut for
//!   well-funded accounts, refunds guarded by the forwarding-ambiguity
//!   marker, and idempotent delta reconciliation.
//! - **Tools** ([`core::mcp`], [`core::orchestrator`]): an external-tool
//!   catalog with policy filtering, per-request candidate registries, and
//!   the bounded multi-round tool-execution loop with schema-mismatch
//!   candidate fallback.
//! - **Billing** ([`core::billing`]): detached asynchronous reconciliation
//!   with a timeout watchdog and append-only audit records.
//!
//! HTTP routing, provider wire formats and persistent storage live outside
//! the crate; they plug in through the [`core::adaptor::UpstreamAdaptor`],
//! [`core::orchestrator::ToolTransport`] and [`storage`] traits.

pub mod config;
pub mod core;
pub mod monitoring;
pub mod storage;
pub mod utils;

pub use crate::config::Config;
pub use crate::core::adaptor::{UpstreamAdaptor, UpstreamTurn};
pub use crate::core::billing::{BillingReconciler, BillingRecord, ReconcileInputs};
pub use crate::core::mcp::{ToolCatalog, ToolPolicy, ToolRegistry};
pub use crate::core::orchestrator::{
    ToolLoopOutcome, ToolLoopTermination, ToolOrchestrator, ToolTransport,
};
pub use crate::core::pricing::{EffectivePricing, GlobalPricingTable, ModelConfig, PricingResolver};
pub use crate::core::quota::{ChargedSoFar, PreConsumed, QuotaLedger};
pub use crate::core::types::{ChatMessage, ChatRequest, ChatResponse, Quota, RequestMeta, Usage};
pub use crate::storage::{BalanceStore, CatalogStore, CostStore, InMemoryStore};
pub use crate::utils::error::{GatewayError, Result};
pub use crate::utils::logging::init_logging;
