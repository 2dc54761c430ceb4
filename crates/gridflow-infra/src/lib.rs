//! Infrastructure layer for gridflow.
//!
//! Implements the ports defined in `gridflow-core`: SQLite persistence for
//! workflows and runs, a filesystem document source, a filesystem export
//! sink, and an HTTP analysis client. `app` wires them into a
//! `WorkflowService`.

pub mod analysis;
pub mod app;
pub mod config;
pub mod document;
pub mod export;
pub mod sqlite;
