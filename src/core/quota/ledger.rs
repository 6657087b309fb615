//! Quota ledger operations: pre-consume, refund, reconcile.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::Config;
use crate::core::billing::records::BillingRecord;
use crate::core::pricing::EffectivePricing;
use crate::core::types::{Quota, RequestMeta};
use crate::monitoring::metrics;
use crate::storage::{BalanceStore, CostStore};
use crate::utils::error::{GatewayError, Result};

/// Well-funded accounts skip the token-level pre-consume write when both
/// balances exceed this multiple of the estimate.
const TRUST_SHORTCUT_MULTIPLE: Quota = 100;

/// Outcome of one pre-consume: what was actually taken from each ledger.
///
/// Deliberately neither `Clone` nor `Copy`: [`QuotaLedger::refund`] takes it
/// by value, so a reservation can be refunded at most once.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct PreConsumed {
    /// Token-level amount reported consumed. Zero under the trust shortcut.
    pub consumed: Quota,
    /// User-level amount reserved. Always the full estimate on success.
    pub user_reserved: Quota,
}

impl PreConsumed {
    pub fn none() -> Self {
        Self::default()
    }

    /// Fold another round's reservation into this one.
    pub fn absorb(&mut self, other: PreConsumed) {
        self.consumed += other.consumed;
        self.user_reserved += other.user_reserved;
    }
}

/// Everything already taken from the ledgers for one request, split by
/// ledger side so reconciliation can settle each against its own history.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChargedSoFar {
    /// Token-level amount from the base pre-consume
    pub consumed: Quota,
    /// User-level amount from the base pre-consume
    pub user_reserved: Quota,
    /// Token-level amount charged incrementally by the tool loop
    pub incremental_consumed: Quota,
    /// User-level amount reserved incrementally by the tool loop
    pub incremental_user_reserved: Quota,
}

impl ChargedSoFar {
    pub fn from_base(base: &PreConsumed) -> Self {
        Self {
            consumed: base.consumed,
            user_reserved: base.user_reserved,
            incremental_consumed: 0,
            incremental_user_reserved: 0,
        }
    }

    pub fn with_incremental(mut self, incremental: &PreConsumed) -> Self {
        self.incremental_consumed = incremental.consumed;
        self.incremental_user_reserved = incremental.user_reserved;
        self
    }
}

/// Mutating quota operations over the balance and cost stores.
///
/// All arithmetic lives in [`compute`](crate::core::quota::compute); the
/// ledger owns ordering, atomicity, and the refund/reconcile policies.
pub struct QuotaLedger {
    balances: Arc<dyn BalanceStore>,
    costs: Arc<dyn CostStore>,
    config: Config,
}

impl QuotaLedger {
    pub fn new(balances: Arc<dyn BalanceStore>, costs: Arc<dyn CostStore>, config: Config) -> Self {
        Self {
            balances,
            costs,
            config,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Size the optimistic reservation for a request.
    ///
    /// `floor(prompt*input_ratio + max_output*output_ratio)`, floored at the
    /// configured background minimum for background requests, and clamped to
    /// at least 1 whenever the input ratio is non-zero.
    pub fn estimate_pre_consume_quota(
        &self,
        prompt_tokens: u32,
        max_output_tokens: u32,
        pricing: &EffectivePricing,
        background: bool,
    ) -> Quota {
        let raw = prompt_tokens as f64 * pricing.input_ratio
            + max_output_tokens as f64 * pricing.output_ratio;
        let mut estimate = raw as Quota;

        if background {
            // Background completion size is unknowable; reserve a safe minimum.
            let floor = (self.config.background_preconsume_tokens as f64 * pricing.output_ratio)
                .ceil() as Quota;
            estimate = estimate.max(floor.max(1));
        }
        if pricing.input_ratio != 0.0 && estimate <= 0 {
            estimate = 1;
        }
        estimate
    }

    /// Optimistically reserve `estimate` before dispatching upstream.
    ///
    /// The user balance is checked and decremented first. Well-funded
    /// accounts then take the trust shortcut: when both the user balance and
    /// the token budget exceed 100x the estimate, the token-level write is
    /// skipped and `consumed` is reported as 0; the user-level decrement
    /// stands and is settled at reconciliation.
    pub async fn pre_consume(&self, meta: &RequestMeta, estimate: Quota) -> Result<PreConsumed> {
        if estimate <= 0 {
            return Ok(PreConsumed::none());
        }

        let user_balance = self.balances.user_balance(meta.user_id).await?;
        if user_balance < estimate {
            return Err(GatewayError::insufficient_user_quota(format!(
                "user {} balance {} cannot cover estimate {}",
                meta.user_id, user_balance, estimate
            )));
        }
        self.balances
            .decrement_user_balance(meta.user_id, estimate)
            .await
            .map_err(|err| {
                GatewayError::insufficient_user_quota(format!(
                    "user {} pre-consume of {} rejected: {}",
                    meta.user_id, estimate, err
                ))
            })?;

        // Trust shortcut. Explicit branch so it can be audited or disabled
        // independently of the arithmetic around it.
        let token_trusted = meta.unlimited_token_quota
            || self.balances.token_balance(meta.token_id).await? > TRUST_SHORTCUT_MULTIPLE * estimate;
        if user_balance > TRUST_SHORTCUT_MULTIPLE * estimate && token_trusted {
            debug!(
                request_id = %meta.request_id,
                estimate,
                "trust shortcut: skipping token-level pre-consume"
            );
            return Ok(PreConsumed {
                consumed: 0,
                user_reserved: estimate,
            });
        }

        if let Err(err) = self
            .balances
            .decrement_token_balance(meta.token_id, estimate)
            .await
        {
            // Undo the user-level reservation so a failed pre-consume
            // leaves both ledgers where they started.
            if let Err(undo_err) = self.balances.adjust_user_balance(meta.user_id, estimate).await {
                warn!(
                    request_id = %meta.request_id,
                    error = %undo_err,
                    "failed to undo user reservation after token pre-consume failure"
                );
            }
            return Err(GatewayError::insufficient_token_quota(format!(
                "token {} pre-consume of {} rejected: {}",
                meta.token_id, estimate, err
            )));
        }

        Ok(PreConsumed {
            consumed: estimate,
            user_reserved: estimate,
        })
    }

    /// Return a reservation to both ledgers.
    ///
    /// Skipped entirely when the request's forwarding-ambiguity marker is
    /// set: the upstream may already have done the work, and refunding then
    /// would under-bill. Taking `pre` by value makes a double refund
    /// unrepresentable.
    pub async fn refund(&self, pre: PreConsumed, meta: &RequestMeta) -> Result<()> {
        if meta.is_forwarded() {
            warn!(
                request_id = %meta.request_id,
                user_reserved = pre.user_reserved,
                consumed = pre.consumed,
                "refund suppressed: request may have reached the upstream"
            );
            return Ok(());
        }
        if pre.user_reserved > 0 {
            self.balances
                .adjust_user_balance(meta.user_id, pre.user_reserved)
                .await?;
        }
        if pre.consumed > 0 {
            self.balances
                .adjust_token_balance(meta.token_id, pre.consumed)
                .await?;
        }
        debug!(
            request_id = %meta.request_id,
            user_reserved = pre.user_reserved,
            consumed = pre.consumed,
            "pre-consumed quota refunded"
        );
        Ok(())
    }

    /// Settle the final figure against everything charged so far.
    ///
    /// Each ledger side settles against its own history: the token ledger
    /// against what was reported consumed, the user ledger against what was
    /// actually reserved from it. This keeps both sides netting to exactly
    /// `final_quota` even when the trust shortcut reported `consumed = 0`.
    ///
    /// Idempotent per completed request id: a second call after a successful
    /// reconcile is a logged no-op. The slot is claimed only once every write
    /// has landed, so a reconcile that fails partway stays retryable.
    pub async fn reconcile(
        &self,
        meta: &RequestMeta,
        final_quota: Quota,
        charged: ChargedSoFar,
        record: BillingRecord,
    ) -> Result<Quota> {
        if self.costs.is_reconciled(&meta.request_id).await? {
            warn!(
                request_id = %meta.request_id,
                "duplicate reconciliation attempt ignored"
            );
            return Ok(0);
        }

        let token_delta = final_quota - charged.consumed - charged.incremental_consumed;
        let user_delta = final_quota - charged.user_reserved - charged.incremental_user_reserved;

        // Positive delta charges more, negative credits back. No floor
        // check: the work is already done.
        if token_delta != 0 {
            self.balances
                .adjust_token_balance(meta.token_id, -token_delta)
                .await?;
        }
        if user_delta != 0 {
            self.balances
                .adjust_user_balance(meta.user_id, -user_delta)
                .await?;
        }
        if final_quota != 0 {
            self.balances
                .add_channel_used_quota(meta.channel_id, final_quota)
                .await?;
        }

        self.costs.append_billing_record(record).await?;
        if !self.costs.mark_reconciled(&meta.request_id).await? {
            // Lost a race against a concurrent reconcile for the same id;
            // both applied their deltas. Surfaced for manual review.
            warn!(
                request_id = %meta.request_id,
                "concurrent duplicate reconciliation detected"
            );
        }
        metrics().record_reconciled(&meta.request_id, token_delta);
        debug!(
            request_id = %meta.request_id,
            final_quota,
            token_delta,
            user_delta,
            "quota reconciled"
        );
        Ok(token_delta)
    }

    /// Upsert the externally visible cost row for a request.
    pub async fn update_request_cost(&self, meta: &RequestMeta, quota: Quota) -> Result<()> {
        self.costs
            .update_request_cost(meta.user_id, &meta.request_id, quota)
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::storage::InMemoryStore;

    /// Balance store that fails the next token adjustment, then recovers.
    struct FlakyBalances {
        inner: Arc<InMemoryStore>,
        fail_next_token_adjust: AtomicBool,
    }

    #[async_trait]
    impl BalanceStore for FlakyBalances {
        async fn user_balance(&self, user_id: i64) -> Result<Quota> {
            self.inner.user_balance(user_id).await
        }
        async fn token_balance(&self, token_id: i64) -> Result<Quota> {
            self.inner.token_balance(token_id).await
        }
        async fn decrement_user_balance(&self, user_id: i64, amount: Quota) -> Result<()> {
            self.inner.decrement_user_balance(user_id, amount).await
        }
        async fn decrement_token_balance(&self, token_id: i64, amount: Quota) -> Result<()> {
            self.inner.decrement_token_balance(token_id, amount).await
        }
        async fn adjust_user_balance(&self, user_id: i64, delta: Quota) -> Result<()> {
            self.inner.adjust_user_balance(user_id, delta).await
        }
        async fn adjust_token_balance(&self, token_id: i64, delta: Quota) -> Result<()> {
            if self.fail_next_token_adjust.swap(false, Ordering::SeqCst) {
                return Err(GatewayError::quota_operation("injected store fault"));
            }
            self.inner.adjust_token_balance(token_id, delta).await
        }
        async fn add_channel_used_quota(&self, channel_id: i64, amount: Quota) -> Result<()> {
            self.inner.add_channel_used_quota(channel_id, amount).await
        }
    }

    fn ledger_with(store: Arc<InMemoryStore>) -> QuotaLedger {
        QuotaLedger::new(store.clone(), store, Config::default())
    }

    fn meta() -> RequestMeta {
        RequestMeta::new("req-1", 1, 10, 100)
    }

    fn pricing(input_ratio: f64, completion_ratio: f64) -> EffectivePricing {
        EffectivePricing {
            input_ratio,
            output_ratio: input_ratio * completion_ratio,
            cached_input_ratio: None,
            applied_tier_threshold: None,
        }
    }

    #[test]
    fn estimate_uses_floor_arithmetic() {
        let store = Arc::new(InMemoryStore::new());
        let ledger = ledger_with(store);
        // floor(500*0.001 + 1000*0.001*2.0) = floor(2.5) = 2
        let estimate =
            ledger.estimate_pre_consume_quota(500, 1000, &pricing(0.001, 2.0), false);
        assert_eq!(estimate, 2);
    }

    #[test]
    fn background_estimate_is_floored() {
        let store = Arc::new(InMemoryStore::new());
        let ledger = ledger_with(store);
        // Background floor: ceil(1000 * 0.002) = 2 beats the tiny estimate.
        let estimate = ledger.estimate_pre_consume_quota(10, 0, &pricing(0.001, 2.0), true);
        assert_eq!(estimate, 2);
    }

    #[tokio::test]
    async fn pre_consume_then_refund_round_trips() {
        let store = Arc::new(InMemoryStore::new());
        store.provision_user(1, 1_000_000);
        store.provision_token(10, 5_000);
        let ledger = ledger_with(store.clone());
        let meta = meta();

        let pre = ledger.pre_consume(&meta, 2_000).await.expect("pre-consume");
        assert_eq!(pre.consumed, 2_000);
        assert_eq!(store.user_balance(1).await.expect("user"), 998_000);
        assert_eq!(store.token_balance(10).await.expect("token"), 3_000);

        ledger.refund(pre, &meta).await.expect("refund");
        assert_eq!(store.user_balance(1).await.expect("user"), 1_000_000);
        assert_eq!(store.token_balance(10).await.expect("token"), 5_000);
    }

    #[tokio::test]
    async fn trust_shortcut_skips_token_write() {
        let store = Arc::new(InMemoryStore::new());
        store.provision_user(1, 1_000_000);
        store.provision_token(10, 1_000_000);
        let ledger = ledger_with(store.clone());

        let pre = ledger.pre_consume(&meta(), 100).await.expect("pre-consume");
        assert_eq!(pre.consumed, 0);
        assert_eq!(pre.user_reserved, 100);
        assert_eq!(store.user_balance(1).await.expect("user"), 999_900);
        // Token ledger untouched.
        assert_eq!(store.token_balance(10).await.expect("token"), 1_000_000);
    }

    #[tokio::test]
    async fn insufficient_user_balance_consumes_nothing() {
        let store = Arc::new(InMemoryStore::new());
        store.provision_user(1, 50);
        store.provision_token(10, 50);
        let ledger = ledger_with(store.clone());

        let err = ledger.pre_consume(&meta(), 100).await.expect_err("must fail");
        assert_eq!(err.code(), "insufficient_user_quota");
        assert_eq!(store.user_balance(1).await.expect("user"), 50);
        assert_eq!(store.token_balance(10).await.expect("token"), 50);
    }

    #[tokio::test]
    async fn token_failure_rolls_back_user_reservation() {
        let store = Arc::new(InMemoryStore::new());
        store.provision_user(1, 10_000);
        store.provision_token(10, 50);
        let ledger = ledger_with(store.clone());

        let err = ledger.pre_consume(&meta(), 100).await.expect_err("must fail");
        assert_eq!(err.code(), "insufficient_token_quota");
        assert_eq!(store.user_balance(1).await.expect("user"), 10_000);
        assert_eq!(store.token_balance(10).await.expect("token"), 50);
    }

    #[tokio::test]
    async fn refund_is_suppressed_after_forwarding() {
        let store = Arc::new(InMemoryStore::new());
        store.provision_user(1, 10_000);
        store.provision_token(10, 10_000);
        let ledger = ledger_with(store.clone());
        let meta = meta();

        let pre = ledger.pre_consume(&meta, 500).await.expect("pre-consume");
        meta.mark_forwarded();
        ledger.refund(pre, &meta).await.expect("refund call succeeds");

        // Balances keep the reservation.
        assert_eq!(store.user_balance(1).await.expect("user"), 9_500);
        assert_eq!(store.token_balance(10).await.expect("token"), 9_500);
    }

    #[tokio::test]
    async fn reconcile_settles_both_ledgers_to_final() {
        let store = Arc::new(InMemoryStore::new());
        store.provision_user(1, 1_000_000);
        store.provision_token(10, 1_000_000);
        let ledger = ledger_with(store.clone());
        let meta = meta();

        // Trust shortcut: consumed 0, user reserved 100.
        let pre = ledger.pre_consume(&meta, 100).await.expect("pre-consume");
        let charged = ChargedSoFar::from_base(&pre);

        let delta = ledger
            .reconcile(&meta, 150, charged, BillingRecord::for_request(&meta, 150))
            .await
            .expect("reconcile");
        assert_eq!(delta, 150);

        // Both ledgers net exactly -150.
        assert_eq!(store.user_balance(1).await.expect("user"), 999_850);
        assert_eq!(store.token_balance(10).await.expect("token"), 999_850);
        assert_eq!(store.channel_used_quota(100), 150);
        assert_eq!(store.billing_records().len(), 1);
    }

    #[tokio::test]
    async fn failed_reconcile_stays_retryable() {
        let inner = Arc::new(InMemoryStore::new());
        inner.provision_user(1, 1_000);
        inner.provision_token(10, 1_000);
        let balances = Arc::new(FlakyBalances {
            inner: inner.clone(),
            fail_next_token_adjust: AtomicBool::new(true),
        });
        let ledger = QuotaLedger::new(balances, inner.clone(), Config::default());
        let meta = meta();
        let charged = ChargedSoFar::default();

        let err = ledger
            .reconcile(&meta, 200, charged, BillingRecord::for_request(&meta, 200))
            .await
            .expect_err("transient store failure");
        assert_eq!(err.code(), "quota_operation_failed");
        // Nothing landed, and the slot was not claimed.
        assert_eq!(inner.token_balance(10).await.expect("token"), 1_000);
        assert!(inner.billing_records().is_empty());

        let delta = ledger
            .reconcile(&meta, 200, charged, BillingRecord::for_request(&meta, 200))
            .await
            .expect("retry");
        assert_eq!(delta, 200);
        assert_eq!(inner.token_balance(10).await.expect("token"), 800);
        assert_eq!(inner.user_balance(1).await.expect("user"), 800);
        assert_eq!(inner.billing_records().len(), 1);

        // The successful retry claimed the slot: a third call is a no-op.
        let delta = ledger
            .reconcile(&meta, 200, charged, BillingRecord::for_request(&meta, 200))
            .await
            .expect("post-retry call");
        assert_eq!(delta, 0);
        assert_eq!(inner.billing_records().len(), 1);
    }

    #[tokio::test]
    async fn reconcile_is_idempotent_per_request() {
        let store = Arc::new(InMemoryStore::new());
        store.provision_user(1, 1_000);
        store.provision_token(10, 1_000);
        let ledger = ledger_with(store.clone());
        let meta = meta();

        let charged = ChargedSoFar::default();
        ledger
            .reconcile(&meta, 200, charged, BillingRecord::for_request(&meta, 200))
            .await
            .expect("first reconcile");
        let delta = ledger
            .reconcile(&meta, 200, charged, BillingRecord::for_request(&meta, 200))
            .await
            .expect("second reconcile");

        assert_eq!(delta, 0);
        assert_eq!(store.user_balance(1).await.expect("user"), 800);
        assert_eq!(store.billing_records().len(), 1);
    }
}
