//! Detached billing reconciliation.
//!
//! Finalizing cost never blocks the response path: reconciliation runs as a
//! detached task wrapped in a timeout. A timeout does not cancel the work,
//! it only raises the alarm; the inner task finishes on its own and the
//! ledger's per-request idempotency guard makes a late application safe.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error};

use super::records::BillingRecord;
use crate::config::Config;
use crate::core::adaptor::UpstreamAdaptor;
use crate::core::pricing::PricingResolver;
use crate::core::quota::compute::{compute, ComputeInput};
use crate::core::quota::ledger::{ChargedSoFar, PreConsumed, QuotaLedger};
use crate::core::types::{Quota, RequestMeta, Usage};
use crate::monitoring::metrics;
use crate::utils::error::Result;

/// Everything the reconciler needs from the request path.
pub struct ReconcileInputs {
    /// Accumulated usage, immutable from here on
    pub usage: Usage,
    /// Tier-resolved base ratio used for the request
    pub model_ratio: f64,
    pub channel_completion_ratio: Option<f64>,
    /// Amounts already taken from the ledgers
    pub charged: ChargedSoFar,
    /// Pre-consume estimate, reported on timeout when the exact figure is
    /// not yet known
    pub estimated_quota: Quota,
}

/// Finalizes request cost in the background.
pub struct BillingReconciler {
    ledger: Arc<QuotaLedger>,
    resolver: Arc<PricingResolver>,
    timeout: Duration,
}

impl BillingReconciler {
    pub fn new(ledger: Arc<QuotaLedger>, resolver: Arc<PricingResolver>, config: &Config) -> Self {
        Self {
            ledger,
            resolver,
            timeout: Duration::from_secs(config.billing_timeout_secs),
        }
    }

    /// Override the timeout. Tests use sub-second values.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Spawn the detached reconciliation for one request.
    ///
    /// The returned handle resolves when the watchdog finishes, which is
    /// either normal completion or the timeout alarm. The reconciliation
    /// itself may still be running after a timeout.
    pub fn reconcile_async(
        &self,
        meta: Arc<RequestMeta>,
        adaptor: Arc<dyn UpstreamAdaptor>,
        inputs: ReconcileInputs,
    ) -> JoinHandle<()> {
        let ledger = Arc::clone(&self.ledger);
        let resolver = Arc::clone(&self.resolver);
        let timeout = self.timeout;

        tokio::spawn(async move {
            let request_id = meta.request_id.clone();
            let estimated = inputs.estimated_quota;

            let mut inner = tokio::spawn(Self::reconcile_once(
                ledger, resolver, meta, adaptor, inputs,
            ));
            match tokio::time::timeout(timeout, &mut inner).await {
                Ok(Ok(Ok(()))) => {
                    debug!(request_id = %request_id, "billing reconciliation finished");
                }
                Ok(Ok(Err(err))) => {
                    error!(
                        request_id = %request_id,
                        error = %err,
                        "billing reconciliation failed"
                    );
                }
                Ok(Err(join_err)) => {
                    error!(
                        request_id = %request_id,
                        error = %join_err,
                        "billing reconciliation task panicked"
                    );
                }
                Err(_) => {
                    // Not cancelled: the inner task keeps running and its
                    // delta applies idempotently whenever it lands.
                    error!(
                        request_id = %request_id,
                        estimated_quota = estimated,
                        timeout_secs = timeout.as_secs_f64(),
                        "billing reconciliation timed out, estimated quota reported for manual review"
                    );
                    metrics().record_billing_timeout(&request_id, estimated);
                }
            }
        })
    }

    async fn reconcile_once(
        ledger: Arc<QuotaLedger>,
        resolver: Arc<PricingResolver>,
        meta: Arc<RequestMeta>,
        adaptor: Arc<dyn UpstreamAdaptor>,
        inputs: ReconcileInputs,
    ) -> Result<()> {
        let result = compute(ComputeInput {
            usage: &inputs.usage,
            model_name: &meta.model_name,
            model_ratio: inputs.model_ratio,
            group_ratio: meta.group_ratio,
            channel_completion_ratio: inputs.channel_completion_ratio,
            resolver: &resolver,
            adaptor: adaptor.as_ref(),
        });
        let final_quota = result.total_quota;
        let charged = inputs.charged;
        let token_delta = final_quota - charged.consumed - charged.incremental_consumed;

        let record = BillingRecord::for_request(&meta, final_quota)
            .with_usage(&inputs.usage)
            .with_compute(&result)
            .with_delta(token_delta);

        ledger.reconcile(&meta, final_quota, charged, record).await?;
        ledger.update_request_cost(&meta, final_quota).await?;
        Ok(())
    }

    /// Settle a request that failed with no usage at all: refund the
    /// reservation (unless the forwarding marker forbids it) and zero the
    /// provisional cost row.
    pub async fn settle_failed_request(&self, meta: &RequestMeta, pre: PreConsumed) -> Result<()> {
        self.ledger.refund(pre, meta).await?;
        self.ledger.update_request_cost(meta, 0).await
    }
}
