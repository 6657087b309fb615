//! Tool server catalog.
//!
//! Materializes the enabled tool servers and their tool lists from the
//! catalog store, and resolves which tools a given request may use after
//! server, channel and user policy filters.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::types::Quota;
use crate::storage::CatalogStore;
use crate::utils::error::Result;

/// Price terms for calling one tool. `quota_per_call` wins when both are set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolPricing {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quota_per_call: Option<Quota>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usd_per_call: Option<f64>,
}

impl ToolPricing {
    /// Resolved quota cost for one call.
    pub fn cost_per_call(&self, quota_per_usd: f64) -> Quota {
        if let Some(quota) = self.quota_per_call {
            return quota;
        }
        self.usd_per_call
            .map(|usd| (usd * quota_per_usd).ceil() as Quota)
            .unwrap_or(0)
    }
}

/// One registered external tool server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolServer {
    pub id: i64,
    /// Label used in `server.tool` qualified names and summaries
    pub name: String,
    pub base_url: String,
    /// Higher priority servers are preferred as candidates
    pub priority: i32,
    /// When non-empty, only these tool names are served
    #[serde(default)]
    pub tool_whitelist: Vec<String>,
    #[serde(default)]
    pub tool_blacklist: Vec<String>,
    /// Pricing per tool name; the empty key sets a server-wide default
    #[serde(default)]
    pub tool_pricing: HashMap<String, ToolPricing>,
}

impl ToolServer {
    pub fn pricing_for(&self, tool: &str) -> ToolPricing {
        self.tool_pricing
            .get(tool)
            .or_else(|| self.tool_pricing.get(""))
            .cloned()
            .unwrap_or_default()
    }
}

/// One tool as declared by its server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON schema for the tool's arguments
    pub input_schema: serde_json::Value,
}

/// Policy filters applied when resolving tools for one request.
#[derive(Debug, Clone, Default)]
pub struct ToolPolicy {
    /// Tool names blacklisted for the channel (bare or `server.tool`)
    pub channel_blacklist: Vec<String>,
    /// Tool names blacklisted for the user (bare or `server.tool`)
    pub user_blacklist: Vec<String>,
    /// When set, only these names are allowed
    pub allow_list: Option<Vec<String>>,
}

/// Materialized view of every enabled server and its tools.
pub struct ToolCatalog {
    servers: Vec<ToolServer>,
    tools: HashMap<i64, Vec<ToolSpec>>,
    /// server label -> server id
    label_index: HashMap<String, i64>,
}

fn normalize(name: &str) -> String {
    name.trim().to_ascii_lowercase()
}

impl ToolCatalog {
    /// Load every enabled server and its tool list from the store.
    pub async fn load(store: &Arc<dyn CatalogStore>) -> Result<Self> {
        let servers = store.list_enabled_servers().await?;
        let mut tools = HashMap::new();
        let mut label_index = HashMap::new();
        for server in &servers {
            tools.insert(server.id, store.tools_by_server(server.id).await?);
            label_index.insert(normalize(&server.name), server.id);
        }
        debug!(servers = servers.len(), "tool catalog loaded");
        Ok(Self {
            servers,
            tools,
            label_index,
        })
    }

    pub fn servers(&self) -> &[ToolServer] {
        &self.servers
    }

    pub fn server_by_id(&self, id: i64) -> Option<&ToolServer> {
        self.servers.iter().find(|s| s.id == id)
    }

    pub fn server_by_label(&self, label: &str) -> Option<&ToolServer> {
        self.label_index
            .get(&normalize(label))
            .and_then(|id| self.server_by_id(*id))
    }

    pub fn tools_of(&self, server_id: i64) -> &[ToolSpec] {
        self.tools.get(&server_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Every (server, tool) pair the request may use under `policy`.
    ///
    /// A tool passes when it is inside the server whitelist (when one is
    /// set), outside the server/channel/user blacklists (both its bare name
    /// and the `server.tool` qualified form are checked), and inside the
    /// optional allow list. All names compare normalized.
    pub fn resolve_tools(&self, policy: &ToolPolicy) -> Vec<(&ToolServer, &ToolSpec)> {
        let channel_block: HashSet<String> =
            policy.channel_blacklist.iter().map(|n| normalize(n)).collect();
        let user_block: HashSet<String> =
            policy.user_blacklist.iter().map(|n| normalize(n)).collect();
        let allow: Option<HashSet<String>> = policy
            .allow_list
            .as_ref()
            .map(|names| names.iter().map(|n| normalize(n)).collect());

        let mut resolved = Vec::new();
        for server in &self.servers {
            let whitelist: HashSet<String> =
                server.tool_whitelist.iter().map(|n| normalize(n)).collect();
            let server_block: HashSet<String> =
                server.tool_blacklist.iter().map(|n| normalize(n)).collect();
            let server_label = normalize(&server.name);

            for tool in self.tools_of(server.id) {
                let name = normalize(&tool.name);
                let qualified = format!("{server_label}.{name}");

                if !whitelist.is_empty() && !whitelist.contains(&name) {
                    continue;
                }
                if server_block.contains(&name) {
                    continue;
                }
                if channel_block.contains(&name) || channel_block.contains(&qualified) {
                    continue;
                }
                if user_block.contains(&name) || user_block.contains(&qualified) {
                    continue;
                }
                if let Some(allow) = &allow {
                    if !allow.contains(&name) && !allow.contains(&qualified) {
                        continue;
                    }
                }
                resolved.push((server, tool));
            }
        }
        resolved
    }
}
