//! Core domain types
//!
//! This module contains the core domain structures used across Keel crates.
//! These types represent the fundamental business entities and are shared between
//! the orchestrator (for persistence and coordination) and the runner (for execution).

pub mod deployment;
pub mod log;
pub mod project;
pub mod rollback;
pub mod run;
pub mod stage;
