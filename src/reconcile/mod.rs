//! Scheduled reconciliation of subscriptions and purchase grants.

pub mod sweep;
pub mod worker;

pub use sweep::{Reconciler, SweepReport};
pub use worker::ReconciliationWorker;
