//! Keel Core
//!
//! Core types and abstractions for the Keel deployment engine.
//!
//! This crate contains:
//! - Domain types: Core business entities (StageDefinition, PipelineRun, Deployment, ...)
//! - DTOs: Data transfer objects exchanged with trigger sources and the HTTP API

pub mod domain;
pub mod dto;
