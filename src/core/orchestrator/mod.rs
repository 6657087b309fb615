//! Bounded multi-round tool-execution loop.

pub mod round_loop;
pub mod summary;


pub use round_loop::{
    ToolLoopOutcome, ToolLoopTermination, ToolOrchestrator, ToolTransport,
};
pub use summary::{ToolUsageEntry, ToolUsageSummary};
