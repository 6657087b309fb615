//! Billing records and asynchronous reconciliation.

pub mod reconciler;
pub mod records;

pub use reconciler::{BillingReconciler, ReconcileInputs};
pub use records::BillingRecord;
