//! SQLite persistence for Trellis.
//!
//! One `SqliteStore` behind the whole service: workflow definitions,
//! execution records with their lifecycle state machine, approval gates,
//! webhook endpoints with their audit log, and run checkpoints. Lifecycle
//! races (two deciders, worker vs. expiry sweep) resolve with
//! compare-and-set UPDATEs rather than in-process locks.

mod approvals;
mod checkpoints;
mod executions;
mod store;
mod webhooks;
mod workflows;

pub use store::SqliteStore;
