//! Quota computation and ledger operations.

pub mod compute;
pub mod ledger;

pub use compute::{compute, ComputeInput, ComputeResult};
pub use ledger::{ChargedSoFar, PreConsumed, QuotaLedger};
