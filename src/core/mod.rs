//! Core accounting and orchestration logic.

pub mod adaptor;
pub mod billing;
pub mod mcp;
pub mod orchestrator;
pub mod pricing;
pub mod quota;
pub mod types;

pub use adaptor::{UpstreamAdaptor, UpstreamTurn};
pub use types::{ChatMessage, ChatRequest, ChatResponse, Quota, RequestMeta, Usage};
