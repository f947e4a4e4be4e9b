//! Keel Orchestrator
//!
//! Deployment pipeline execution and rollback engine.
//!
//! Architecture:
//! - Coordinator: creates runs, drives stages in phase order, records deployments
//! - Rollback: plans and executes rollbacks to earlier deployments
//! - Repository: persistence behind store traits (Postgres or memory)
//! - Services: stage definitions and history queries
//! - API: axum HTTP surface over all of the above

pub mod api;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod engine;
pub mod error;
pub mod inventory;
pub mod notify;
pub mod repository;
pub mod rollback;
pub mod service;
pub mod sweeper;

#[cfg(test)]
mod testing;

pub use coordinator::{PipelineRunCoordinator, StartedRun};
pub use engine::{Engine, EngineSettings};
pub use error::{EngineError, Result};
pub use rollback::{RollbackExecutor, RollbackPlanner};
