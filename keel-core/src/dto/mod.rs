//! Data Transfer Objects (DTOs)
//!
//! Request and query payloads exchanged between trigger sources, the HTTP
//! API and the engine. Domain types are returned as-is.

pub mod page;
pub mod rollback;
pub mod run;
pub mod stage;
