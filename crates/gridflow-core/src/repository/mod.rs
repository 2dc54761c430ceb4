//! Repository trait definitions.
//!
//! These are the storage "ports" of the engine. `gridflow-infra` provides the
//! SQLite implementation; tests use in-memory mocks.

pub mod workflow;
