//! Workflow repository trait definition.
//!
//! Defines the storage interface for workflow definitions, runs, step outputs
//! and step logs. The infrastructure layer (gridflow-infra) implements this
//! trait with SQLite persistence.

use chrono::{DateTime, Utc};
use gridflow_types::container::DataContainer;
use gridflow_types::error::RepositoryError;
use gridflow_types::workflow::{
    RunControl, StepLogEntry, WorkflowDefinition, WorkflowRun,
};
use uuid::Uuid;

/// Repository trait for workflow persistence.
///
/// Covers four entity families:
/// - **Definitions:** CRUD for saved workflows.
/// - **Runs:** create/update/query execution instances, including the
///   advisory control flag and the execution lease.
/// - **Step outputs:** one serialized `DataContainer` per (run, step).
/// - **Step logs:** append-only human-facing trail.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait WorkflowRepository: Send + Sync {
    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    /// Upsert a workflow definition (insert or replace by ID).
    fn save_definition(
        &self,
        def: &WorkflowDefinition,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get a workflow definition by its UUID.
    fn get_definition(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowDefinition>, RepositoryError>> + Send;

    /// List all workflow definitions ordered by name.
    fn list_definitions(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowDefinition>, RepositoryError>> + Send;

    /// Delete a workflow definition by ID. Returns `true` if it existed.
    /// Runs keep their own snapshot and are not touched.
    fn delete_definition(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    /// Create a new workflow run record.
    fn create_run(
        &self,
        run: &WorkflowRun,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Persist a run's status, progress, errors and timestamps.
    ///
    /// Applies only while the run's lease holder is `owner` (`None`: the run
    /// must not be leased at all); otherwise fails with
    /// `RepositoryError::LeaseLost`. Does not touch `control`, `lease_owner`
    /// or `heartbeat_at`; those are written only through the dedicated
    /// methods below.
    fn update_run(
        &self,
        run: &WorkflowRun,
        owner: Option<&Uuid>,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get a workflow run by its UUID.
    fn get_run(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowRun>, RepositoryError>> + Send;

    /// List runs for a workflow, newest first.
    fn list_runs(
        &self,
        workflow_id: &Uuid,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowRun>, RepositoryError>> + Send;

    /// Set or clear the advisory control flag of a run.
    fn set_control(
        &self,
        run_id: &Uuid,
        control: Option<RunControl>,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Lease
    // -----------------------------------------------------------------------

    /// Atomically take the execution lease of a run.
    ///
    /// Succeeds (returns `true`) when the run has no lease holder, when
    /// `owner` already holds it, or when the holder's heartbeat is older than
    /// `stale_before`. On success the heartbeat is set to `now`.
    fn acquire_lease(
        &self,
        run_id: &Uuid,
        owner: &Uuid,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Refresh the heartbeat. Returns `false` if `owner` no longer holds the lease.
    fn renew_lease(
        &self,
        run_id: &Uuid,
        owner: &Uuid,
        now: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Drop the lease if `owner` holds it.
    fn release_lease(
        &self,
        run_id: &Uuid,
        owner: &Uuid,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Runs in `running` whose heartbeat is missing or older than `stale_before`.
    fn list_stale_runs(
        &self,
        stale_before: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowRun>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Step outputs
    // -----------------------------------------------------------------------

    /// Store a step's output and the run's advanced progress in one
    /// transaction. Re-executing a step overwrites its previous output.
    ///
    /// Nothing is written unless `owner` holds the run's lease
    /// (`RepositoryError::LeaseLost`).
    fn commit_step(
        &self,
        run: &WorkflowRun,
        owner: &Uuid,
        step_id: &str,
        output: &DataContainer,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Load a persisted step output.
    fn get_step_output(
        &self,
        run_id: &Uuid,
        step_id: &str,
    ) -> impl std::future::Future<Output = Result<Option<DataContainer>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Step logs
    // -----------------------------------------------------------------------

    /// Append log entries.
    fn append_step_logs(
        &self,
        entries: &[StepLogEntry],
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Log entries of a run in insertion order, optionally for one step.
    fn list_step_logs(
        &self,
        run_id: &Uuid,
        step_id: Option<&str>,
    ) -> impl std::future::Future<Output = Result<Vec<StepLogEntry>, RepositoryError>> + Send;
}
