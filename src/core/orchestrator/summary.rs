//! Per-request tool usage accounting.

use std::collections::HashMap;

use serde::Serialize;

use crate::core::mcp::registry::ToolCandidate;
use crate::core::types::Quota;

/// One executed tool call.
#[derive(Debug, Clone, Serialize)]
pub struct ToolUsageEntry {
    pub tool_name: String,
    pub server_label: String,
    pub server_id: i64,
    pub cost: Quota,
}

/// Running totals for one request's tool usage.
///
/// Kept consistent by construction: `total_cost` always equals the sum of
/// `cost_by_tool`, which always equals the sum of the entries' costs.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ToolUsageSummary {
    calls_by_tool: HashMap<String, u32>,
    cost_by_tool: HashMap<String, Quota>,
    entries: Vec<ToolUsageEntry>,
    total_cost: Quota,
}

impl ToolUsageSummary {
    pub fn record_call(&mut self, candidate: &ToolCandidate, cost: Quota) {
        *self
            .calls_by_tool
            .entry(candidate.tool_name.clone())
            .or_insert(0) += 1;
        *self
            .cost_by_tool
            .entry(candidate.tool_name.clone())
            .or_insert(0) += cost;
        self.entries.push(ToolUsageEntry {
            tool_name: candidate.tool_name.clone(),
            server_label: candidate.server_label.clone(),
            server_id: candidate.server_id,
            cost,
        });
        self.total_cost += cost;
    }

    pub fn total_cost(&self) -> Quota {
        self.total_cost
    }

    pub fn calls(&self, tool: &str) -> u32 {
        self.calls_by_tool.get(tool).copied().unwrap_or(0)
    }

    pub fn cost_of(&self, tool: &str) -> Quota {
        self.cost_by_tool.get(tool).copied().unwrap_or(0)
    }

    pub fn entries(&self) -> &[ToolUsageEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serialized form merged into the request's audit metadata.
    pub fn to_metadata(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::core::mcp::catalog::ToolPricing;

    fn candidate(name: &str, server_id: i64) -> ToolCandidate {
        ToolCandidate {
            server_id,
            server_label: format!("srv-{server_id}"),
            base_url: String::new(),
            tool_name: name.to_string(),
            description: None,
            input_schema: json!({}),
            signature: String::new(),
            priority: 0,
            pricing: ToolPricing::default(),
        }
    }

    #[test]
    fn totals_stay_consistent() {
        let mut summary = ToolUsageSummary::default();
        summary.record_call(&candidate("search", 1), 100);
        summary.record_call(&candidate("search", 1), 100);
        summary.record_call(&candidate("fetch", 2), 50);

        assert_eq!(summary.total_cost(), 250);
        assert_eq!(summary.calls("search"), 2);
        assert_eq!(summary.cost_of("search"), 200);
        assert_eq!(summary.cost_of("fetch"), 50);

        let by_tool: Quota = ["search", "fetch"].iter().map(|t| summary.cost_of(t)).sum();
        let by_entry: Quota = summary.entries().iter().map(|e| e.cost).sum();
        assert_eq!(summary.total_cost(), by_tool);
        assert_eq!(summary.total_cost(), by_entry);
    }
}
