//! In-memory store.
//!
//! Backs tests and single-process deployments. Per-key atomicity comes from
//! DashMap's entry guards: the floor check and the decrement happen under
//! the same shard lock.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use super::{BalanceStore, CatalogStore, CostStore};
use crate::core::billing::records::BillingRecord;
use crate::core::mcp::catalog::{ToolServer, ToolSpec};
use crate::core::types::Quota;
use crate::utils::error::{GatewayError, Result};

/// DashMap-backed store implementing every storage contract.
#[derive(Default)]
pub struct InMemoryStore {
    users: DashMap<i64, Quota>,
    tokens: DashMap<i64, Quota>,
    channel_used: DashMap<i64, Quota>,
    request_costs: DashMap<String, Quota>,
    reconciled: DashMap<String, ()>,
    billing_log: Mutex<Vec<BillingRecord>>,
    servers: Mutex<Vec<ToolServer>>,
    tools: DashMap<i64, Vec<ToolSpec>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn provision_user(&self, user_id: i64, balance: Quota) {
        self.users.insert(user_id, balance);
    }

    pub fn provision_token(&self, token_id: i64, balance: Quota) {
        self.tokens.insert(token_id, balance);
    }

    pub fn add_server(&self, server: ToolServer, tools: Vec<ToolSpec>) {
        self.tools.insert(server.id, tools);
        self.servers.lock().push(server);
    }

    pub fn channel_used_quota(&self, channel_id: i64) -> Quota {
        self.channel_used.get(&channel_id).map(|v| *v).unwrap_or(0)
    }

    pub fn billing_records(&self) -> Vec<BillingRecord> {
        self.billing_log.lock().clone()
    }
}

fn decrement_entry(
    map: &DashMap<i64, Quota>,
    key: i64,
    amount: Quota,
    kind: &str,
) -> Result<()> {
    let mut entry = map
        .get_mut(&key)
        .ok_or_else(|| GatewayError::not_found(format!("{kind} {key}")))?;
    if *entry < amount {
        return Err(GatewayError::quota_operation(format!(
            "{kind} {key} balance {} cannot cover {amount}",
            *entry
        )));
    }
    *entry -= amount;
    Ok(())
}

#[async_trait]
impl BalanceStore for InMemoryStore {
    async fn user_balance(&self, user_id: i64) -> Result<Quota> {
        self.users
            .get(&user_id)
            .map(|v| *v)
            .ok_or_else(|| GatewayError::not_found(format!("user {user_id}")))
    }

    async fn token_balance(&self, token_id: i64) -> Result<Quota> {
        self.tokens
            .get(&token_id)
            .map(|v| *v)
            .ok_or_else(|| GatewayError::not_found(format!("token {token_id}")))
    }

    async fn decrement_user_balance(&self, user_id: i64, amount: Quota) -> Result<()> {
        decrement_entry(&self.users, user_id, amount, "user")
    }

    async fn decrement_token_balance(&self, token_id: i64, amount: Quota) -> Result<()> {
        decrement_entry(&self.tokens, token_id, amount, "token")
    }

    async fn adjust_user_balance(&self, user_id: i64, delta: Quota) -> Result<()> {
        let mut entry = self
            .users
            .get_mut(&user_id)
            .ok_or_else(|| GatewayError::not_found(format!("user {user_id}")))?;
        *entry += delta;
        Ok(())
    }

    async fn adjust_token_balance(&self, token_id: i64, delta: Quota) -> Result<()> {
        let mut entry = self
            .tokens
            .get_mut(&token_id)
            .ok_or_else(|| GatewayError::not_found(format!("token {token_id}")))?;
        *entry += delta;
        Ok(())
    }

    async fn add_channel_used_quota(&self, channel_id: i64, amount: Quota) -> Result<()> {
        *self.channel_used.entry(channel_id).or_insert(0) += amount;
        Ok(())
    }
}

#[async_trait]
impl CostStore for InMemoryStore {
    async fn update_request_cost(
        &self,
        _user_id: i64,
        request_id: &str,
        quota: Quota,
    ) -> Result<()> {
        self.request_costs.insert(request_id.to_string(), quota);
        Ok(())
    }

    async fn request_cost(&self, request_id: &str) -> Result<Option<Quota>> {
        Ok(self.request_costs.get(request_id).map(|v| *v))
    }

    async fn append_billing_record(&self, record: BillingRecord) -> Result<()> {
        self.billing_log.lock().push(record);
        Ok(())
    }

    async fn is_reconciled(&self, request_id: &str) -> Result<bool> {
        Ok(self.reconciled.contains_key(request_id))
    }

    async fn mark_reconciled(&self, request_id: &str) -> Result<bool> {
        Ok(self
            .reconciled
            .insert(request_id.to_string(), ())
            .is_none())
    }
}

#[async_trait]
impl CatalogStore for InMemoryStore {
    async fn list_enabled_servers(&self) -> Result<Vec<ToolServer>> {
        Ok(self.servers.lock().clone())
    }

    async fn tools_by_server(&self, server_id: i64) -> Result<Vec<ToolSpec>> {
        Ok(self.tools.get(&server_id).map(|v| v.clone()).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn decrement_enforces_floor() {
        let store = InMemoryStore::new();
        store.provision_user(1, 100);

        store.decrement_user_balance(1, 60).await.expect("first decrement");
        let err = store.decrement_user_balance(1, 60).await.expect_err("overdraw");
        assert_eq!(err.code(), "quota_operation_failed");
        // Failed decrement leaves the balance untouched.
        assert_eq!(store.user_balance(1).await.expect("balance"), 40);
    }

    #[tokio::test]
    async fn adjust_allows_negative_balance() {
        let store = InMemoryStore::new();
        store.provision_token(7, 10);
        store.adjust_token_balance(7, -25).await.expect("adjust");
        assert_eq!(store.token_balance(7).await.expect("balance"), -15);
    }

    #[tokio::test]
    async fn mark_reconciled_claims_once() {
        let store = InMemoryStore::new();
        assert!(!store.is_reconciled("req-1").await.expect("unclaimed"));
        assert!(store.mark_reconciled("req-1").await.expect("first"));
        assert!(store.is_reconciled("req-1").await.expect("claimed"));
        assert!(!store.mark_reconciled("req-1").await.expect("second"));
        assert!(store.mark_reconciled("req-2").await.expect("other id"));
    }

    #[tokio::test]
    async fn concurrent_decrements_never_overdraw() {
        use std::sync::Arc;

        let store = Arc::new(InMemoryStore::new());
        store.provision_user(1, 50);

        let mut handles = Vec::new();
        for _ in 0..10 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.decrement_user_balance(1, 10).await.is_ok()
            }));
        }
        let mut succeeded = 0;
        for handle in handles {
            if handle.await.expect("join") {
                succeeded += 1;
            }
        }
        assert_eq!(succeeded, 5);
        assert_eq!(store.user_balance(1).await.expect("balance"), 0);
    }
}
