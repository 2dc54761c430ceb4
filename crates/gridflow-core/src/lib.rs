//! Workflow engine and repository/service ports for gridflow.
//!
//! This crate defines the "ports" (repository and external service traits)
//! that the infrastructure layer implements. It depends only on
//! `gridflow-types`, never on `gridflow-infra` or any database/IO crate.

pub mod provider;
pub mod repository;
pub mod service;
pub mod workflow;

#[cfg(test)]
pub(crate) mod testing;
