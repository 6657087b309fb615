//! Storage contracts.
//!
//! Persistence is out of scope for this crate; these traits define exactly
//! what the accounting core needs from a backing store. The in-memory
//! implementation exists to honor the atomicity contract and to make the
//! crate testable end to end.

pub mod memory;

use async_trait::async_trait;

use crate::core::billing::records::BillingRecord;
use crate::core::mcp::catalog::{ToolServer, ToolSpec};
use crate::core::types::Quota;
use crate::utils::error::Result;

pub use memory::InMemoryStore;

/// User, token and channel quota balances.
///
/// Contract: `decrement_*` must execute the floor check and the decrement as
/// one atomic operation per key. Two concurrent decrements against the same
/// low balance must never both commit.
#[async_trait]
pub trait BalanceStore: Send + Sync {
    /// Cached user balance read. May be slightly stale.
    async fn user_balance(&self, user_id: i64) -> Result<Quota>;

    async fn token_balance(&self, token_id: i64) -> Result<Quota>;

    /// Atomically decrement the user balance, failing if it would go
    /// negative. On failure the balance is unchanged.
    async fn decrement_user_balance(&self, user_id: i64, amount: Quota) -> Result<()>;

    /// Same contract as [`decrement_user_balance`](Self::decrement_user_balance)
    /// for the token-level budget.
    async fn decrement_token_balance(&self, token_id: i64, amount: Quota) -> Result<()>;

    /// Atomically add a signed amount to the user balance. Positive credits
    /// back, negative charges more. No floor check: reconciliation deltas
    /// must apply even when they momentarily overdraw.
    async fn adjust_user_balance(&self, user_id: i64, delta: Quota) -> Result<()>;

    async fn adjust_token_balance(&self, token_id: i64, delta: Quota) -> Result<()>;

    /// Accumulate spend against the channel for operator accounting.
    async fn add_channel_used_quota(&self, channel_id: i64, amount: Quota) -> Result<()>;
}

/// Per-request cost rows, the billing audit log, and the reconciliation
/// idempotency guard.
#[async_trait]
pub trait CostStore: Send + Sync {
    /// Upsert the cost row for a request. Called with the provisional
    /// estimate first, then overwritten with the final figure.
    async fn update_request_cost(&self, user_id: i64, request_id: &str, quota: Quota)
        -> Result<()>;

    async fn request_cost(&self, request_id: &str) -> Result<Option<Quota>>;

    /// Append one audit record. Append-only.
    async fn append_billing_record(&self, record: BillingRecord) -> Result<()>;

    /// Whether the reconciliation slot for a request id has been claimed.
    async fn is_reconciled(&self, request_id: &str) -> Result<bool>;

    /// Claim the reconciliation slot for a request id. Returns `true` on the
    /// first call and `false` on every subsequent call. The ledger claims the
    /// slot only after all reconciliation writes have landed, so a failed
    /// attempt leaves the slot free for a retry.
    async fn mark_reconciled(&self, request_id: &str) -> Result<bool>;
}

/// Source of tool servers and their tool lists for the catalog.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn list_enabled_servers(&self) -> Result<Vec<ToolServer>>;

    async fn tools_by_server(&self, server_id: i64) -> Result<Vec<ToolSpec>>;
}
