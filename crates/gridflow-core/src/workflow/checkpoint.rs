//! Durable checkpoints for workflow runs.
//!
//! Wraps `WorkflowRepository` with the operations the engine performs at
//! step boundaries: persisting run progress, committing step outputs,
//! reading control flags, and holding the execution lease. A step's output
//! and the run's advanced progress are committed together, so a crashed run
//! always resumes at the first step whose output was never stored.

use std::time::Duration;

use chrono::{DateTime, Utc};
use gridflow_types::container::DataContainer;
use gridflow_types::error::RepositoryError;
use gridflow_types::workflow::{RunControl, StepLogEntry, WorkflowRun};
use uuid::Uuid;

use crate::repository::workflow::WorkflowRepository;

// ---------------------------------------------------------------------------
// CheckpointManager
// ---------------------------------------------------------------------------

/// Generic over `R: WorkflowRepository` so it works with any storage backend
/// (SQLite, in-memory mock).
pub struct CheckpointManager<R: WorkflowRepository> {
    repo: R,
}

impl<R: WorkflowRepository> CheckpointManager<R> {
    pub fn new(repo: R) -> Self {
        Self { repo }
    }

    /// Access the underlying repository.
    pub fn repo(&self) -> &R {
        &self.repo
    }

    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    pub async fn load_run(&self, run_id: Uuid) -> Result<WorkflowRun, CheckpointError> {
        self.repo
            .get_run(&run_id)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?
            .ok_or(CheckpointError::RunNotFound(run_id))
    }

    /// Persist status, progress, errors and timestamps of a run leased to
    /// `owner`.
    pub async fn checkpoint_run(&self, run: &WorkflowRun, owner: Uuid) -> Result<(), CheckpointError> {
        self.repo
            .update_run(run, Some(&owner))
            .await
            .map_err(|e| guarded_error(run.id, e))?;

        tracing::debug!(
            run_id = %run.id,
            status = %run.status,
            step_index = run.current_step_index,
            "checkpointed run"
        );
        Ok(())
    }

    /// Read the pending control request of a run, if any.
    pub async fn control(&self, run_id: Uuid) -> Result<Option<RunControl>, CheckpointError> {
        Ok(self.load_run(run_id).await?.control)
    }

    pub async fn set_control(&self, run_id: Uuid, control: Option<RunControl>) -> Result<(), CheckpointError> {
        self.repo
            .set_control(&run_id, control)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))
    }

    // -----------------------------------------------------------------------
    // Step outputs + logs
    // -----------------------------------------------------------------------

    /// Store `output` for `step_id` together with the run's progress.
    pub async fn commit_step(
        &self,
        run: &WorkflowRun,
        owner: Uuid,
        step_id: &str,
        output: &DataContainer,
    ) -> Result<(), CheckpointError> {
        self.repo
            .commit_step(run, &owner, step_id, output)
            .await
            .map_err(|e| guarded_error(run.id, e))?;

        tracing::debug!(
            run_id = %run.id,
            step_id,
            next_index = run.current_step_index,
            items = output.total_items(),
            "committed step output"
        );
        Ok(())
    }

    pub async fn load_output(&self, run_id: Uuid, step_id: &str) -> Result<Option<DataContainer>, CheckpointError> {
        self.repo
            .get_step_output(&run_id, step_id)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))
    }

    pub async fn append_logs(&self, entries: &[StepLogEntry]) -> Result<(), CheckpointError> {
        if entries.is_empty() {
            return Ok(());
        }
        self.repo
            .append_step_logs(entries)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))
    }

    // -----------------------------------------------------------------------
    // Lease
    // -----------------------------------------------------------------------

    /// Take the execution lease; a holder whose heartbeat is older than
    /// `ttl` is displaced.
    pub async fn acquire_lease(&self, run_id: Uuid, owner: Uuid, ttl: Duration) -> Result<bool, CheckpointError> {
        let now = Utc::now();
        self.repo
            .acquire_lease(&run_id, &owner, now, stale_cutoff(now, ttl))
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))
    }

    pub async fn renew_lease(&self, run_id: Uuid, owner: Uuid) -> Result<bool, CheckpointError> {
        self.repo
            .renew_lease(&run_id, &owner, Utc::now())
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))
    }

    pub async fn release_lease(&self, run_id: Uuid, owner: Uuid) -> Result<(), CheckpointError> {
        self.repo
            .release_lease(&run_id, &owner)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))
    }

    /// Running runs whose heartbeat is older than `ttl`.
    pub async fn stale_runs(&self, ttl: Duration) -> Result<Vec<WorkflowRun>, CheckpointError> {
        self.repo
            .list_stale_runs(stale_cutoff(Utc::now(), ttl))
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))
    }
}

fn guarded_error(run_id: Uuid, error: RepositoryError) -> CheckpointError {
    match error {
        RepositoryError::LeaseLost => CheckpointError::LeaseLost(run_id),
        other => CheckpointError::Repository(other.to_string()),
    }
}

fn stale_cutoff(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(365));
    now.checked_sub_signed(ttl).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

// ---------------------------------------------------------------------------
// CheckpointError
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// Underlying repository operation failed.
    #[error("checkpoint repository error: {0}")]
    Repository(String),

    #[error("workflow run not found: {0}")]
    RunNotFound(Uuid),

    /// Another owner took the run's lease; nothing was written.
    #[error("lease on workflow run {0} was lost")]
    LeaseLost(Uuid),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockWorkflowRepository, document_grid};
    use gridflow_types::workflow::{LogLevel, WorkflowDefinition};

    fn pending_run() -> WorkflowRun {
        let def: WorkflowDefinition = serde_json::from_value(serde_json::json!({
            "name": "w",
            "steps": [{"step_id": "load", "type": "input"}, {"step_id": "out", "type": "export"}]
        }))
        .unwrap();
        WorkflowRun::new(&def)
    }

    #[test]
    fn test_checkpoint_error_display() {
        let err = CheckpointError::Repository("db locked".into());
        assert_eq!(err.to_string(), "checkpoint repository error: db locked");

        let id = Uuid::nil();
        assert_eq!(
            CheckpointError::RunNotFound(id).to_string(),
            format!("workflow run not found: {id}")
        );
        assert_eq!(
            CheckpointError::LeaseLost(id).to_string(),
            format!("lease on workflow run {id} was lost")
        );
    }

    #[tokio::test]
    async fn test_commit_step_stores_output_and_progress() {
        let repo = MockWorkflowRepository::default();
        let manager = CheckpointManager::new(repo.clone());
        let mut run = pending_run();
        repo.create_run(&run).await.unwrap();

        let owner = Uuid::now_v7();
        assert!(manager.acquire_lease(run.id, owner, Duration::from_secs(60)).await.unwrap());

        run.current_step_index = 1;
        run.last_successful_step_id = Some("load".into());
        let output = document_grid(&["A"], &[2024]);
        manager.commit_step(&run, owner, "load", &output).await.unwrap();

        let stored = manager.load_run(run.id).await.unwrap();
        assert_eq!(stored.current_step_index, 1);
        assert_eq!(stored.last_successful_step_id.as_deref(), Some("load"));
        let loaded = manager.load_output(run.id, "load").await.unwrap().unwrap();
        assert_eq!(loaded.data, output.data);
        assert!(manager.load_output(run.id, "out").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_writes_require_the_lease() {
        let repo = MockWorkflowRepository::default();
        let manager = CheckpointManager::new(repo.clone());
        let mut run = pending_run();
        repo.create_run(&run).await.unwrap();

        let (holder, intruder) = (Uuid::now_v7(), Uuid::now_v7());
        assert!(manager.acquire_lease(run.id, holder, Duration::from_secs(60)).await.unwrap());

        run.current_step_index = 1;
        run.last_successful_step_id = Some("load".into());
        let output = document_grid(&["A"], &[2024]);
        assert!(matches!(
            manager.commit_step(&run, intruder, "load", &output).await,
            Err(CheckpointError::LeaseLost(id)) if id == run.id
        ));
        assert!(matches!(
            manager.checkpoint_run(&run, intruder).await,
            Err(CheckpointError::LeaseLost(_))
        ));

        let stored = manager.load_run(run.id).await.unwrap();
        assert_eq!(stored.current_step_index, 0);
        assert!(manager.load_output(run.id, "load").await.unwrap().is_none());
        assert_eq!(repo.commits(), 0);

        // An unleased run only accepts unguarded updates.
        manager.release_lease(run.id, holder).await.unwrap();
        assert!(matches!(
            manager.checkpoint_run(&run, holder).await,
            Err(CheckpointError::LeaseLost(_))
        ));
        repo.update_run(&run, None).await.unwrap();
        assert_eq!(manager.load_run(run.id).await.unwrap().current_step_index, 1);
    }

    #[tokio::test]
    async fn test_lease_is_exclusive_until_stale() {
        let repo = MockWorkflowRepository::default();
        let manager = CheckpointManager::new(repo.clone());
        let run = pending_run();
        repo.create_run(&run).await.unwrap();

        let (first, second) = (Uuid::now_v7(), Uuid::now_v7());
        let ttl = Duration::from_secs(60);
        assert!(manager.acquire_lease(run.id, first, ttl).await.unwrap());
        assert!(!manager.acquire_lease(run.id, second, ttl).await.unwrap());
        assert!(manager.renew_lease(run.id, first).await.unwrap());
        assert!(!manager.renew_lease(run.id, second).await.unwrap());

        repo.force_lease(&run.id, Some(first), Some(Utc::now() - chrono::Duration::minutes(5)));
        assert!(manager.acquire_lease(run.id, second, ttl).await.unwrap());

        manager.release_lease(run.id, second).await.unwrap();
        assert_eq!(manager.load_run(run.id).await.unwrap().lease_owner, None);
    }

    #[tokio::test]
    async fn test_control_and_logs() {
        let repo = MockWorkflowRepository::default();
        let manager = CheckpointManager::new(repo.clone());
        let run = pending_run();
        repo.create_run(&run).await.unwrap();

        assert_eq!(manager.control(run.id).await.unwrap(), None);
        manager.set_control(run.id, Some(RunControl::Pause)).await.unwrap();
        assert_eq!(manager.control(run.id).await.unwrap(), Some(RunControl::Pause));

        manager
            .append_logs(&[StepLogEntry::new(run.id, "load", LogLevel::Info, "started")])
            .await
            .unwrap();
        manager.append_logs(&[]).await.unwrap();
        assert_eq!(repo.list_step_logs(&run.id, None).await.unwrap().len(), 1);

        assert!(matches!(
            manager.load_run(Uuid::now_v7()).await,
            Err(CheckpointError::RunNotFound(_))
        ));
    }
}
