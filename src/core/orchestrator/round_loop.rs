//! The bounded multi-round tool-execution loop.
//!
//! Each round: pre-consume an estimate for the grown conversation, dispatch
//! upstream once, then either finish (no tool calls, or a call the registry
//! does not know) or execute every unseen call and go around again. Schema
//! mismatches on fallback candidates trigger a candidate advance and a
//! replay of the same round; replays do not consume round budget.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::summary::ToolUsageSummary;
use crate::config::Config;
use crate::core::adaptor::UpstreamAdaptor;
use crate::core::mcp::registry::{ToolCandidate, ToolRegistry};
use crate::core::mcp::schema::args_match_schema;
use crate::core::pricing::PricingResolver;
use crate::core::quota::compute::{compute, ComputeInput};
use crate::core::quota::ledger::{ChargedSoFar, PreConsumed, QuotaLedger};
use crate::core::types::{
    approximate_prompt_tokens, ChatMessage, ChatRequest, ChatResponse, Quota, RequestMeta,
    ToolCall, Usage,
};
use crate::monitoring::metrics;
use crate::utils::error::{GatewayError, Result, ToolSchemaMismatch};

/// Transport seam for invoking one tool on its server.
#[async_trait]
pub trait ToolTransport: Send + Sync {
    /// Invoke `candidate` with `args`, returning the textual tool result.
    async fn call_tool(
        &self,
        candidate: &ToolCandidate,
        args: &Value,
        headers: Option<&HashMap<String, String>>,
    ) -> Result<String>;
}

/// How the loop ended.
#[derive(Debug)]
pub enum ToolLoopTermination {
    /// Final response for the caller. Covers both a response without tool
    /// calls and the early-final case where a call was not registered.
    Completed(ChatResponse),
    /// Terminal failure: pre-consume, upstream, tool transport, candidates
    /// exhausted, or round budget exceeded.
    Failed(GatewayError),
}

/// Result of one tool loop, always carrying whatever was accumulated so the
/// caller can bill performed work even on failure.
#[derive(Debug)]
pub struct ToolLoopOutcome {
    pub termination: ToolLoopTermination,
    pub usage: Usage,
    pub summary: ToolUsageSummary,
    /// Quota reserved by the loop's own per-round pre-consumes
    pub incremental_charged: PreConsumed,
    /// Base reservation plus the incremental ones, ready for reconciliation
    pub charged: ChargedSoFar,
    /// Counted rounds actually executed (replays excluded)
    pub rounds: u32,
}

impl ToolLoopOutcome {
    pub fn response(&self) -> Option<&ChatResponse> {
        match &self.termination {
            ToolLoopTermination::Completed(response) => Some(response),
            ToolLoopTermination::Failed(_) => None,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self.termination, ToolLoopTermination::Completed(_))
    }
}

enum CallOutcome {
    Success {
        candidate: ToolCandidate,
        result: String,
        cost: Quota,
    },
    Mismatch(ToolSchemaMismatch),
    Terminal(GatewayError),
}

/// Runs the tool-execution loop for requests that declared registered tools.
pub struct ToolOrchestrator {
    ledger: Arc<QuotaLedger>,
    resolver: Arc<PricingResolver>,
    transport: Arc<dyn ToolTransport>,
    config: Config,
}

impl ToolOrchestrator {
    pub fn new(
        ledger: Arc<QuotaLedger>,
        resolver: Arc<PricingResolver>,
        transport: Arc<dyn ToolTransport>,
        config: Config,
    ) -> Self {
        Self {
            ledger,
            resolver,
            transport,
            config,
        }
    }

    /// Run the loop until a terminal state.
    ///
    /// `base_charged` is the request's initial reservation; it is not touched
    /// here, only folded into the returned [`ChargedSoFar`] so the caller can
    /// hand everything to reconciliation in one piece.
    pub async fn run_tool_loop(
        &self,
        meta: &RequestMeta,
        mut request: ChatRequest,
        registry: &mut ToolRegistry,
        adaptor: &dyn UpstreamAdaptor,
        base_charged: &PreConsumed,
    ) -> ToolLoopOutcome {
        let max_rounds = self.config.effective_max_tool_rounds();
        let mut usage = Usage::default();
        let mut summary = ToolUsageSummary::default();
        let mut incremental = PreConsumed::none();
        let mut executed: HashSet<String> = HashSet::new();
        let mut billed_tool_cost: Quota = 0;
        let mut rounds_used: u32 = 0;
        let mut replay = false;
        let mut model_ratio_used = 0.0;
        let mut round_pre = PreConsumed::none();

        loop {
            if replay {
                replay = false;
            } else {
                if rounds_used >= max_rounds {
                    usage.tools_cost += summary.total_cost() - billed_tool_cost;
                    return self.finish(
                        ToolLoopTermination::Failed(GatewayError::ToolRoundsExceeded {
                            rounds: rounds_used,
                        }),
                        usage,
                        summary,
                        base_charged,
                        incremental,
                        rounds_used,
                    );
                }
                rounds_used += 1;

                let prompt_tokens = approximate_prompt_tokens(&request.messages);
                let pricing =
                    self.resolver
                        .resolve_effective_pricing(&meta.model_name, prompt_tokens, adaptor);
                model_ratio_used = pricing.input_ratio;
                let estimate = self.ledger.estimate_pre_consume_quota(
                    prompt_tokens,
                    request.max_tokens.unwrap_or(0),
                    &pricing,
                    meta.background,
                );
                round_pre = match self.ledger.pre_consume(meta, estimate).await {
                    Ok(pre) => pre,
                    Err(err) => {
                        // No upstream call is made this round; prior rounds'
                        // usage is returned so performed work gets billed.
                        warn!(
                            request_id = %meta.request_id,
                            round = rounds_used,
                            error = %err,
                            "round pre-consume failed, aborting tool loop"
                        );
                        usage.tools_cost += summary.total_cost() - billed_tool_cost;
                        return self.finish(
                            ToolLoopTermination::Failed(err),
                            usage,
                            summary,
                            base_charged,
                            incremental,
                            rounds_used - 1,
                        );
                    }
                };
            }

            let turn = match adaptor.dispatch(&request, meta).await {
                Ok(turn) => turn,
                Err(err) => {
                    // Refund this round's reservation only. The refund is a
                    // no-op if the adaptor marked the request as forwarded.
                    if let Err(refund_err) = self
                        .ledger
                        .refund(std::mem::take(&mut round_pre), meta)
                        .await
                    {
                        warn!(
                            request_id = %meta.request_id,
                            error = %refund_err,
                            "round refund failed"
                        );
                    }
                    usage.tools_cost += summary.total_cost() - billed_tool_cost;
                    return self.finish(
                        ToolLoopTermination::Failed(err),
                        usage,
                        summary,
                        base_charged,
                        incremental,
                        rounds_used,
                    );
                }
            };

            incremental.absorb(std::mem::take(&mut round_pre));
            usage.merge_round(turn.billable_usage());

            // Keep the externally queryable cost row current.
            let provisional = compute(ComputeInput {
                usage: &usage,
                model_name: &meta.model_name,
                model_ratio: model_ratio_used,
                group_ratio: meta.group_ratio,
                channel_completion_ratio: None,
                resolver: &self.resolver,
                adaptor,
            })
            .total_quota;
            if let Err(err) = self.ledger.update_request_cost(meta, provisional).await {
                warn!(
                    request_id = %meta.request_id,
                    error = %err,
                    "provisional cost update failed"
                );
            }

            let tool_calls: Vec<ToolCall> = turn.response.tool_calls().to_vec();
            if tool_calls.is_empty() {
                usage.tools_cost += summary.total_cost() - billed_tool_cost;
                return self.finish(
                    ToolLoopTermination::Completed(turn.response),
                    usage,
                    summary,
                    base_charged,
                    incremental,
                    rounds_used,
                );
            }
            if tool_calls
                .iter()
                .any(|call| !registry.is_registered(&call.function.name))
            {
                // Mixed execution is never attempted: the response goes back
                // to the caller, who owns the non-registered calls.
                debug!(
                    request_id = %meta.request_id,
                    "response contains a non-registered tool call, returning it as final"
                );
                usage.tools_cost += summary.total_cost() - billed_tool_cost;
                return self.finish(
                    ToolLoopTermination::Completed(turn.response),
                    usage,
                    summary,
                    base_charged,
                    incremental,
                    rounds_used,
                );
            }

            let rollback_len = request.messages.len();
            let assistant = turn
                .response
                .choices
                .first()
                .map(|choice| choice.message.clone())
                .unwrap_or_else(|| ChatMessage {
                    role: "assistant".to_string(),
                    content: None,
                    tool_calls: tool_calls.clone(),
                    tool_call_id: None,
                });
            request.messages.push(assistant);

            let mut mismatch: Option<ToolSchemaMismatch> = None;
            let mut terminal: Option<GatewayError> = None;
            for (position, call) in tool_calls.iter().enumerate() {
                if !executed.insert(call.id.clone()) {
                    debug!(call_id = %call.id, "duplicate tool call id skipped");
                    continue;
                }
                let affected_ids: Vec<String> = tool_calls[position..]
                    .iter()
                    .filter(|c| {
                        c.function.name.eq_ignore_ascii_case(&call.function.name)
                            && (c.id == call.id || !executed.contains(&c.id))
                    })
                    .map(|c| c.id.clone())
                    .collect();

                match self.invoke_call(registry, call, affected_ids).await {
                    CallOutcome::Success {
                        candidate,
                        result,
                        cost,
                    } => {
                        summary.record_call(&candidate, cost);
                        metrics().record_tool_invocation(&candidate.tool_name, cost);
                        request
                            .messages
                            .push(ChatMessage::tool_result(&call.id, result));
                    }
                    CallOutcome::Mismatch(signal) => {
                        mismatch = Some(signal);
                        break;
                    }
                    CallOutcome::Terminal(err) => {
                        terminal = Some(err);
                        break;
                    }
                }
            }

            if let Some(err) = terminal {
                usage.tools_cost += summary.total_cost() - billed_tool_cost;
                return self.finish(
                    ToolLoopTermination::Failed(err),
                    usage,
                    summary,
                    base_charged,
                    incremental,
                    rounds_used,
                );
            }

            if let Some(signal) = mismatch {
                if registry.advance_candidate(&signal.tool_name) {
                    warn!(
                        request_id = %meta.request_id,
                        tool = %signal.tool_name,
                        failed_candidate = signal.candidate_index,
                        "schema mismatch, replaying round with next candidate"
                    );
                    registry.rebuild_request_tools(&mut request);
                    request.messages.truncate(rollback_len);
                    for id in &signal.call_ids {
                        executed.remove(id);
                    }
                    replay = true;
                    continue;
                }
                usage.tools_cost += summary.total_cost() - billed_tool_cost;
                return self.finish(
                    ToolLoopTermination::Failed(GatewayError::tool_call(format!(
                        "tool {}: arguments rejected by every candidate",
                        signal.tool_name
                    ))),
                    usage,
                    summary,
                    base_charged,
                    incremental,
                    rounds_used,
                );
            }

            // Round complete: bill this round's tool spend exactly once.
            let delta = summary.total_cost() - billed_tool_cost;
            usage.tools_cost += delta;
            billed_tool_cost = summary.total_cost();
        }
    }

    /// Invoke one call against the currently selected candidate, falling
    /// back through candidates on transport errors. Timeouts stop the
    /// fallback early: a timed-out tool may still be executing.
    async fn invoke_call(
        &self,
        registry: &mut ToolRegistry,
        call: &ToolCall,
        affected_ids: Vec<String>,
    ) -> CallOutcome {
        let name = call.function.name.trim().to_ascii_lowercase();
        let args: Value =
            serde_json::from_str(&call.function.arguments).unwrap_or_else(|_| json!({}));
        let timeout = Duration::from_secs(self.config.tool_call_timeout_secs);

        loop {
            let index = registry.selected_index(&name);
            let candidate = match registry.selected_candidate(&name) {
                Some(candidate) => candidate.clone(),
                None => {
                    return CallOutcome::Terminal(GatewayError::tool_call(format!(
                        "tool {name} has no selectable candidate"
                    )))
                }
            };

            if !args_match_schema(&args, &candidate.input_schema) {
                if index == 0 {
                    // The primary candidate is what the model was shown;
                    // let the server be the judge of marginal arguments.
                    warn!(
                        tool = %name,
                        call_id = %call.id,
                        "arguments do not satisfy primary candidate schema, proceeding"
                    );
                } else {
                    return CallOutcome::Mismatch(ToolSchemaMismatch {
                        tool_name: name,
                        candidate_index: index,
                        call_ids: affected_ids,
                    });
                }
            }

            let headers = registry.headers_for(&name).cloned();
            match tokio::time::timeout(
                timeout,
                self.transport.call_tool(&candidate, &args, headers.as_ref()),
            )
            .await
            {
                Ok(Ok(result)) => {
                    let cost = candidate.pricing.cost_per_call(self.config.quota_per_usd);
                    return CallOutcome::Success {
                        candidate,
                        result,
                        cost,
                    };
                }
                Ok(Err(err @ GatewayError::Timeout(_))) => return CallOutcome::Terminal(err),
                Ok(Err(err)) => {
                    warn!(
                        tool = %name,
                        server = %candidate.server_label,
                        error = %err,
                        "tool call failed, advancing candidate"
                    );
                    if !registry.advance_candidate(&name) {
                        return CallOutcome::Terminal(GatewayError::tool_call(format!(
                            "tool {name}: all candidates failed, last error: {err}"
                        )));
                    }
                }
                Err(_) => {
                    return CallOutcome::Terminal(GatewayError::Timeout(format!(
                        "tool {name} invocation exceeded {}s",
                        self.config.tool_call_timeout_secs
                    )))
                }
            }
        }
    }

    fn finish(
        &self,
        termination: ToolLoopTermination,
        usage: Usage,
        summary: ToolUsageSummary,
        base_charged: &PreConsumed,
        incremental: PreConsumed,
        rounds: u32,
    ) -> ToolLoopOutcome {
        let charged = ChargedSoFar::from_base(base_charged).with_incremental(&incremental);
        ToolLoopOutcome {
            termination,
            usage,
            summary,
            incremental_charged: incremental,
            charged,
            rounds,
        }
    }
}
