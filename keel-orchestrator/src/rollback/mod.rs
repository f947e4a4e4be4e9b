//! Rollback Module
//!
//! - `planner`: validates a rollback request and turns it into an ordered plan
//!   or a non-mutating preview
//! - `executor`: runs a plan server by server with per-server isolation and
//!   cooperative cancellation

pub mod executor;
pub mod planner;

pub use executor::RollbackExecutor;
pub use planner::RollbackPlanner;
