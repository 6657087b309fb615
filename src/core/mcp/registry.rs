//! Per-request tool registry.
//!
//! Built when a request's declared tools are matched against the catalog,
//! discarded at request end. Holds the candidate lists per tool name, the
//! sticky selected-candidate index that drives schema-mismatch fallback, and
//! everything needed to rebuild the request's tool list after an advance.

use std::collections::HashMap;

use serde_json::{json, Value};
use tracing::{debug, warn};

use super::catalog::{ToolCatalog, ToolPolicy, ToolPricing};
use super::schema::{schema_is_empty, signature_from_json};
use crate::core::types::{ChatRequest, FunctionDef, ToolDef};
use crate::utils::error::{GatewayError, Result};

/// One concrete binding of a logical tool name to a server.
#[derive(Debug, Clone)]
pub struct ToolCandidate {
    pub server_id: i64,
    pub server_label: String,
    pub base_url: String,
    /// Normalized bare tool name
    pub tool_name: String,
    pub description: Option<String>,
    pub input_schema: Value,
    /// Canonical schema signature; empty for unconstrained schemas
    pub signature: String,
    pub priority: i32,
    pub pricing: ToolPricing,
}

impl ToolCandidate {
    /// Function tool definition advertised to the model for this candidate.
    pub fn to_tool_def(&self) -> ToolDef {
        let parameters = if schema_is_empty(&self.input_schema) {
            json!({"type": "object"})
        } else {
            self.input_schema.clone()
        };
        ToolDef::function(FunctionDef {
            name: self.tool_name.clone(),
            description: self.description.clone(),
            parameters,
        })
    }
}

fn normalize(name: &str) -> String {
    name.trim().to_ascii_lowercase()
}

/// Split an optional `server.tool` qualified name into (server label, tool).
fn split_qualified(name: &str) -> (Option<&str>, &str) {
    match name.split_once('.') {
        Some((server, tool)) if !server.is_empty() && !tool.is_empty() => (Some(server), tool),
        _ => (None, name),
    }
}

/// Build the ordered candidate list for one logical tool name.
///
/// Rules: a `server.tool` name restricts to that server; when a signature is
/// supplied only signature-equal candidates survive; otherwise candidates
/// without a signature are dropped once any signed candidate exists, and
/// same-name candidates with distinct signatures are rejected as ambiguous.
/// Survivors sort by descending priority, then server id.
pub fn build_tool_candidates(
    catalog: &ToolCatalog,
    policy: &ToolPolicy,
    name: &str,
    signature: Option<&str>,
) -> Result<Vec<ToolCandidate>> {
    let (server_label, bare) = split_qualified(name);
    let bare = normalize(bare);
    let server_label = server_label.map(normalize);

    let mut candidates: Vec<ToolCandidate> = catalog
        .resolve_tools(policy)
        .into_iter()
        .filter(|(server, tool)| {
            normalize(&tool.name) == bare
                && server_label
                    .as_ref()
                    .map(|label| normalize(&server.name) == *label)
                    .unwrap_or(true)
        })
        .map(|(server, tool)| ToolCandidate {
            server_id: server.id,
            server_label: server.name.clone(),
            base_url: server.base_url.clone(),
            tool_name: bare.clone(),
            description: tool.description.clone(),
            input_schema: tool.input_schema.clone(),
            signature: signature_from_json(&tool.input_schema),
            priority: server.priority,
            pricing: server.pricing_for(&tool.name),
        })
        .collect();

    if let Some(signature) = signature {
        candidates.retain(|c| c.signature == signature);
    } else {
        let any_signed = candidates.iter().any(|c| !c.signature.is_empty());
        if any_signed {
            candidates.retain(|c| !c.signature.is_empty());
        }
        let mut distinct: Vec<&str> = candidates.iter().map(|c| c.signature.as_str()).collect();
        distinct.sort_unstable();
        distinct.dedup();
        if distinct.len() > 1 {
            return Err(GatewayError::validation(format!(
                "tool {bare} has {} same-name candidates with distinct schemas; \
                 qualify the server or supply a schema",
                candidates.len()
            )));
        }
    }

    candidates.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.server_id.cmp(&b.server_id)));
    Ok(candidates)
}

/// Per-request registry of resolved tool candidates.
pub struct ToolRegistry {
    /// normalized bare name -> ordered candidate list
    candidates: HashMap<String, Vec<ToolCandidate>>,
    /// sticky selected index per tool name, advanced on schema mismatch
    selected: HashMap<String, usize>,
    /// request tool list before expansion, for rebuilds
    original_tools: Vec<ToolDef>,
    /// extra request headers per tool name
    headers: HashMap<String, HashMap<String, String>>,
}

impl ToolRegistry {
    /// Match a request's declared tools against the catalog.
    ///
    /// Function tools register when at least one candidate exists; aliased
    /// server entries (non-`function` type whose name is a server label)
    /// expand into every resolved tool on that server.
    pub fn from_request(
        catalog: &ToolCatalog,
        policy: &ToolPolicy,
        request: &mut ChatRequest,
    ) -> Result<Self> {
        let original_tools = request.tools.clone();
        let mut candidates: HashMap<String, Vec<ToolCandidate>> = HashMap::new();
        let mut expanded: Vec<ToolDef> = Vec::new();

        for tool in &original_tools {
            if tool.tool_type != "function" {
                // Server alias entry: expand every tool the server offers.
                let Some(server) = catalog.server_by_label(&tool.function.name) else {
                    expanded.push(tool.clone());
                    continue;
                };
                let server_id = server.id;
                for (srv, spec) in catalog.resolve_tools(policy) {
                    if srv.id != server_id {
                        continue;
                    }
                    let list = build_tool_candidates(
                        catalog,
                        policy,
                        &format!("{}.{}", srv.name, spec.name),
                        None,
                    )?;
                    if let Some(first) = list.first() {
                        expanded.push(first.to_tool_def());
                        candidates.insert(first.tool_name.clone(), list);
                    }
                }
                continue;
            }

            let declared_signature = if schema_is_empty(&tool.function.parameters) {
                None
            } else {
                Some(signature_from_json(&tool.function.parameters))
            };
            let list = build_tool_candidates(
                catalog,
                policy,
                &tool.function.name,
                declared_signature.as_deref(),
            )?;
            if let Some(first) = list.first() {
                debug!(
                    tool = %first.tool_name,
                    candidates = list.len(),
                    "tool registered"
                );
                expanded.push(first.to_tool_def());
                candidates.insert(first.tool_name.clone(), list);
            } else {
                // Unknown to the catalog: passes through to the model as-is.
                expanded.push(tool.clone());
            }
        }

        request.tools = expanded;
        Ok(Self {
            candidates,
            selected: HashMap::new(),
            original_tools,
            headers: HashMap::new(),
        })
    }

    /// Registry over explicit candidate lists. Used by tests and by callers
    /// that resolve candidates out of band.
    pub fn from_candidates(candidates: HashMap<String, Vec<ToolCandidate>>) -> Self {
        Self {
            candidates,
            selected: HashMap::new(),
            original_tools: Vec::new(),
            headers: HashMap::new(),
        }
    }

    pub fn set_headers(&mut self, tool: &str, headers: HashMap<String, String>) {
        self.headers.insert(normalize(tool), headers);
    }

    pub fn headers_for(&self, tool: &str) -> Option<&HashMap<String, String>> {
        self.headers.get(&normalize(tool))
    }

    pub fn is_registered(&self, tool: &str) -> bool {
        self.candidates.contains_key(&normalize(tool))
    }

    pub fn registered_names(&self) -> impl Iterator<Item = &str> {
        self.candidates.keys().map(String::as_str)
    }

    pub fn selected_index(&self, tool: &str) -> usize {
        self.selected.get(&normalize(tool)).copied().unwrap_or(0)
    }

    /// Currently selected candidate for a tool name.
    pub fn selected_candidate(&self, tool: &str) -> Option<&ToolCandidate> {
        let name = normalize(tool);
        let list = self.candidates.get(&name)?;
        list.get(self.selected.get(&name).copied().unwrap_or(0))
    }

    /// Advance the selected candidate for `tool`. Returns whether the index
    /// actually changed; `false` means the candidates are exhausted.
    pub fn advance_candidate(&mut self, tool: &str) -> bool {
        let name = normalize(tool);
        let Some(list) = self.candidates.get(&name) else {
            return false;
        };
        let current = self.selected.get(&name).copied().unwrap_or(0);
        if current + 1 >= list.len() {
            warn!(tool = %name, index = current, "tool candidates exhausted");
            return false;
        }
        self.selected.insert(name.clone(), current + 1);
        debug!(tool = %name, index = current + 1, "advanced tool candidate");
        true
    }

    /// Re-derive the request's tool list from the currently selected
    /// candidates, keeping non-registered originals as declared.
    pub fn rebuild_request_tools(&self, request: &mut ChatRequest) {
        let mut tools = Vec::with_capacity(self.original_tools.len());
        let mut seen: Vec<String> = Vec::new();
        for tool in &self.original_tools {
            let name = normalize(&tool.function.name);
            if tool.tool_type == "function" {
                if let Some(candidate) = self.selected_candidate(&name) {
                    tools.push(candidate.to_tool_def());
                    seen.push(name);
                } else {
                    tools.push(tool.clone());
                }
                continue;
            }
            // Server alias: re-expand from the current selections, in name
            // order so the model sees a stable tool list across replays.
            let mut names: Vec<&String> = self
                .candidates
                .keys()
                .filter(|name| !seen.contains(*name))
                .collect();
            names.sort();
            for tool_name in names {
                let index = self.selected.get(tool_name).copied().unwrap_or(0);
                if let Some(candidate) = self.candidates[tool_name].get(index) {
                    tools.push(candidate.to_tool_def());
                    seen.push(tool_name.clone());
                }
            }
        }
        request.tools = tools;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::core::mcp::catalog::{ToolServer, ToolSpec};
    use crate::core::types::ChatMessage;
    use crate::storage::{CatalogStore, InMemoryStore};

    fn server(id: i64, name: &str, priority: i32) -> ToolServer {
        ToolServer {
            id,
            name: name.to_string(),
            base_url: format!("http://tools-{id}.internal"),
            priority,
            tool_whitelist: Vec::new(),
            tool_blacklist: Vec::new(),
            tool_pricing: HashMap::new(),
        }
    }

    fn spec(name: &str, schema: Value) -> ToolSpec {
        ToolSpec {
            name: name.to_string(),
            display_name: None,
            description: None,
            input_schema: schema,
        }
    }

    async fn catalog_with(entries: Vec<(ToolServer, Vec<ToolSpec>)>) -> ToolCatalog {
        let store = InMemoryStore::new();
        for (server, tools) in entries {
            store.add_server(server, tools);
        }
        let store: Arc<dyn CatalogStore> = Arc::new(store);
        ToolCatalog::load(&store).await.expect("load catalog")
    }

    fn search_schema() -> Value {
        json!({"type": "object", "required": ["query"], "properties": {"query": {"type": "string"}}})
    }

    #[tokio::test]
    async fn candidates_sort_by_priority_then_server_id() {
        let catalog = catalog_with(vec![
            (server(2, "beta", 5), vec![spec("search", search_schema())]),
            (server(1, "alpha", 10), vec![spec("search", search_schema())]),
            (server(3, "gamma", 10), vec![spec("search", search_schema())]),
        ])
        .await;

        let list =
            build_tool_candidates(&catalog, &ToolPolicy::default(), "search", None).expect("build");
        let order: Vec<i64> = list.iter().map(|c| c.server_id).collect();
        assert_eq!(order, vec![1, 3, 2]);
    }

    #[tokio::test]
    async fn ambiguous_schemas_without_signature_are_rejected() {
        let catalog = catalog_with(vec![
            (server(1, "alpha", 10), vec![spec("search", search_schema())]),
            (
                server(2, "beta", 5),
                vec![spec("search", json!({"type": "object", "required": ["q"]}))],
            ),
        ])
        .await;

        let err = build_tool_candidates(&catalog, &ToolPolicy::default(), "search", None)
            .expect_err("ambiguous");
        assert_eq!(err.code(), "validation_error");

        // Supplying a signature disambiguates.
        let signature = signature_from_json(&search_schema());
        let list =
            build_tool_candidates(&catalog, &ToolPolicy::default(), "search", Some(&signature))
                .expect("build");
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].server_id, 1);
    }

    #[tokio::test]
    async fn unsigned_candidates_drop_when_signed_exist() {
        let catalog = catalog_with(vec![
            (server(1, "alpha", 10), vec![spec("search", json!({}))]),
            (server(2, "beta", 5), vec![spec("search", search_schema())]),
        ])
        .await;

        let list =
            build_tool_candidates(&catalog, &ToolPolicy::default(), "search", None).expect("build");
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].server_id, 2);
    }

    #[tokio::test]
    async fn qualified_name_restricts_server() {
        let catalog = catalog_with(vec![
            (server(1, "alpha", 10), vec![spec("search", search_schema())]),
            (server(2, "beta", 5), vec![spec("search", search_schema())]),
        ])
        .await;

        let list = build_tool_candidates(&catalog, &ToolPolicy::default(), "beta.search", None)
            .expect("build");
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].server_label, "beta");
    }

    #[tokio::test]
    async fn advance_is_sticky_and_bounded() {
        let catalog = catalog_with(vec![
            (server(1, "alpha", 10), vec![spec("search", search_schema())]),
            (server(2, "beta", 5), vec![spec("search", search_schema())]),
        ])
        .await;
        let list =
            build_tool_candidates(&catalog, &ToolPolicy::default(), "search", None).expect("build");
        let mut registry =
            ToolRegistry::from_candidates(HashMap::from([("search".to_string(), list)]));

        assert_eq!(registry.selected_index("search"), 0);
        assert!(registry.advance_candidate("search"));
        assert_eq!(registry.selected_index("search"), 1);
        assert_eq!(
            registry.selected_candidate("search").map(|c| c.server_id),
            Some(2)
        );
        // Exhausted.
        assert!(!registry.advance_candidate("search"));
        assert_eq!(registry.selected_index("search"), 1);
    }

    #[tokio::test]
    async fn alias_rebuild_keeps_a_stable_tool_order() {
        let catalog = catalog_with(vec![(
            server(1, "alpha", 10),
            vec![spec("search", search_schema()), spec("fetch", search_schema())],
        )])
        .await;

        let mut request = ChatRequest::new("m", vec![ChatMessage::user("hi")]);
        request.tools = vec![ToolDef {
            tool_type: "mcp".to_string(),
            function: FunctionDef {
                name: "alpha".to_string(),
                description: None,
                parameters: json!({}),
            },
        }];

        let registry = ToolRegistry::from_request(&catalog, &ToolPolicy::default(), &mut request)
            .expect("registry");
        assert!(registry.is_registered("search"));
        assert!(registry.is_registered("fetch"));

        registry.rebuild_request_tools(&mut request);
        let first: Vec<String> = request
            .tools
            .iter()
            .map(|t| t.function.name.clone())
            .collect();
        assert_eq!(first, vec!["fetch", "search"]);

        registry.rebuild_request_tools(&mut request);
        let second: Vec<String> = request
            .tools
            .iter()
            .map(|t| t.function.name.clone())
            .collect();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn from_request_registers_and_rebuilds_tools() {
        let catalog = catalog_with(vec![
            (server(1, "alpha", 10), vec![spec("search", search_schema())]),
            (
                server(2, "beta", 5),
                vec![spec("search", search_schema())],
            ),
        ])
        .await;

        let mut request = ChatRequest::new("m", vec![ChatMessage::user("hi")]);
        request.tools = vec![ToolDef::function(FunctionDef {
            name: "search".to_string(),
            description: None,
            parameters: json!({}),
        })];

        let mut registry =
            ToolRegistry::from_request(&catalog, &ToolPolicy::default(), &mut request)
                .expect("registry");
        assert!(registry.is_registered("search"));
        assert_eq!(request.tools[0].function.parameters, search_schema());

        // After an advance the rebuilt list reflects the new selection.
        assert!(registry.advance_candidate("search"));
        registry.rebuild_request_tools(&mut request);
        assert_eq!(request.tools.len(), 1);
        assert_eq!(
            registry.selected_candidate("search").map(|c| c.server_label.as_str()),
            Some("beta")
        );
    }
}
