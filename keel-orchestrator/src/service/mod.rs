//! Service Module
//!
//! Business logic over the stores: stage definition management and history
//! queries. Run execution lives in the coordinator, rollbacks in `rollback`.

pub mod history;
pub mod stage;

// Re-export for convenience
pub use history as history_service;
pub use stage as stage_service;
