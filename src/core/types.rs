//! Canonical request/response types shared across the accounting core
//!
//! These mirror the unified chat-completion shape the gateway normalizes
//! every provider into. The routing layer converts provider wire formats
//! to and from these types through an [`UpstreamAdaptor`](crate::core::adaptor::UpstreamAdaptor).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Quota units. 500,000 units equal one USD by default (see
/// [`Config::quota_per_usd`](crate::config::Config)).
pub type Quota = i64;

/// API surface a request arrived on. Billing semantics are shared, but
/// background handling and cache-write accounting differ per surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiSurface {
    ChatCompletions,
    Responses,
    ClaudeMessages,
}

impl Default for ApiSurface {
    fn default() -> Self {
        Self::ChatCompletions
    }
}

/// Token usage for one upstream exchange, accumulated across tool rounds.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    /// Prompt tokens served from the provider's prompt cache
    #[serde(default)]
    pub cached_prompt_tokens: u32,
    /// Completion tokens served from cache (rare; some providers report it)
    #[serde(default)]
    pub cached_completion_tokens: u32,
    /// Tokens written to the 5-minute cache tier
    #[serde(default)]
    pub cache_write_tokens_5m: u32,
    /// Tokens written to the 1-hour cache tier
    #[serde(default)]
    pub cache_write_tokens_1h: u32,
    /// Pre-converted quota owed for tool invocations and media generation
    #[serde(default)]
    pub tools_cost: Quota,
    /// Provider service tier actually used, when reported
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_tier: Option<String>,
}

impl Usage {
    /// Merge one round's usage into the running total.
    ///
    /// Token counts accumulate; `tools_cost` is intentionally *not* merged
    /// here because the orchestrator adds only the per-round summary delta.
    pub fn merge_round(&mut self, round: &Usage) {
        self.prompt_tokens += round.prompt_tokens;
        self.completion_tokens += round.completion_tokens;
        self.total_tokens += round.total_tokens;
        self.cached_prompt_tokens += round.cached_prompt_tokens;
        self.cached_completion_tokens += round.cached_completion_tokens;
        self.cache_write_tokens_5m += round.cache_write_tokens_5m;
        self.cache_write_tokens_1h += round.cache_write_tokens_1h;
        if round.service_tier.is_some() {
            self.service_tier = round.service_tier.clone();
        }
    }

    /// Whether the exchange produced any billable tokens.
    pub fn has_tokens(&self) -> bool {
        self.prompt_tokens + self.completion_tokens > 0
    }
}

/// Per-request billing identity and flags.
///
/// Shared by reference between the request handler, the tool orchestrator,
/// and the detached reconciliation task.
#[derive(Debug)]
pub struct RequestMeta {
    pub request_id: String,
    pub trace_id: String,
    pub user_id: i64,
    pub token_id: i64,
    pub channel_id: i64,
    pub model_name: String,
    pub group_ratio: f64,
    /// Token has no budget cap of its own
    pub unlimited_token_quota: bool,
    /// Asynchronous background request; completion size unknowable up front
    pub background: bool,
    pub api_surface: ApiSurface,
    pub start_time: DateTime<Utc>,
    /// Set once the request body may have reached the upstream. While set,
    /// refunds are suppressed: the work may already have been done.
    forwarded: AtomicBool,
}

impl RequestMeta {
    /// Meta with a freshly generated request id.
    pub fn generate(user_id: i64, token_id: i64, channel_id: i64) -> Self {
        Self::new(uuid::Uuid::new_v4().to_string(), user_id, token_id, channel_id)
    }

    pub fn new(request_id: impl Into<String>, user_id: i64, token_id: i64, channel_id: i64) -> Self {
        let request_id = request_id.into();
        Self {
            trace_id: request_id.clone(),
            request_id,
            user_id,
            token_id,
            channel_id,
            model_name: String::new(),
            group_ratio: 1.0,
            unlimited_token_quota: false,
            background: false,
            api_surface: ApiSurface::default(),
            start_time: Utc::now(),
            forwarded: AtomicBool::new(false),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model_name = model.into();
        self
    }

    pub fn with_group_ratio(mut self, ratio: f64) -> Self {
        self.group_ratio = ratio;
        self
    }

    /// Mark the request as possibly forwarded to the upstream.
    pub fn mark_forwarded(&self) {
        self.forwarded.store(true, Ordering::SeqCst);
    }

    pub fn is_forwarded(&self) -> bool {
        self.forwarded.load(Ordering::SeqCst)
    }
}

/// Function call requested by the model within an assistant turn.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FunctionCall {
    pub name: String,
    /// JSON-encoded arguments, exactly as the model produced them
    pub arguments: String,
}

/// A tool call entry in an assistant message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: String,
    pub function: FunctionCall,
}

/// Function tool definition advertised to the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionDef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON schema for the tool's arguments
    pub parameters: serde_json::Value,
}

/// Tool entry in a request's `tools` list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDef {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: FunctionDef,
}

impl ToolDef {
    pub fn function(def: FunctionDef) -> Self {
        Self {
            tool_type: "function".to_string(),
            function: def,
        }
    }
}

/// One conversation turn.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Set on `tool` role messages: the call id this message answers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: "tool".to_string(),
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: Some(call_id.into()),
        }
    }
}

/// Normalized chat request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    /// Extra provider-specific fields carried through untouched
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            max_tokens: None,
            tools: Vec::new(),
            temperature: None,
            stream: None,
            extra: HashMap::new(),
        }
    }
}

/// One response choice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    pub index: u32,
    pub message: ChatMessage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

/// Normalized chat response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub id: String,
    pub model: String,
    pub choices: Vec<Choice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl ChatResponse {
    /// Tool calls from the first choice, if any.
    pub fn tool_calls(&self) -> &[ToolCall] {
        self.choices
            .first()
            .map(|c| c.message.tool_calls.as_slice())
            .unwrap_or(&[])
    }
}

/// Rough prompt-token estimate used for pre-consume sizing when an exact
/// tokenizer is unavailable: four characters per token.
pub fn approximate_prompt_tokens(messages: &[ChatMessage]) -> u32 {
    let chars: usize = messages
        .iter()
        .map(|m| {
            m.content.as_deref().map(str::len).unwrap_or(0)
                + m.tool_calls
                    .iter()
                    .map(|c| c.function.name.len() + c.function.arguments.len())
                    .sum::<usize>()
        })
        .sum();
    (chars / 4).max(1) as u32
}
