//! Shared domain types for gridflow.
//!
//! The entity × period [`DataContainer`](container::DataContainer) and its
//! payloads, workflow definitions and runs, step configuration, engine
//! configuration, and the repository error type.
//!
//! Zero infrastructure dependencies -- only serde, indexmap, uuid, chrono, thiserror.

pub mod config;
pub mod container;
pub mod error;
pub mod payload;
pub mod period;
pub mod step;
pub mod workflow;
