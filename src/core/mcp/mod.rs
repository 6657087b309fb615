//! External tool (MCP) catalog, per-request registry and schema checks.

pub mod catalog;
pub mod registry;
pub mod schema;

pub use catalog::{ToolCatalog, ToolPolicy, ToolPricing, ToolServer, ToolSpec};
pub use registry::{ToolCandidate, ToolRegistry};
