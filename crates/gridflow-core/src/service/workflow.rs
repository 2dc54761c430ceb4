//! Workflow management service.
//!
//! The caller-facing facade: saves and edits definitions, starts runs in the
//! background or inline, reports progress and results, and relays pause and
//! cancel requests to the engine through the run's control flag.

use std::sync::Arc;

use chrono::Utc;
use gridflow_types::config::EngineConfig;
use gridflow_types::container::DataContainer;
use gridflow_types::error::RepositoryError;
use gridflow_types::workflow::{
    LogLevel, RunControl, RunError, RunStatus, RunSummary, StepDefinition, StepLogEntry, WorkflowDefinition,
    WorkflowRun,
};
use uuid::Uuid;

use crate::repository::workflow::WorkflowRepository;
use crate::workflow::definition::{WorkflowError, parse_workflow_json, parse_workflow_yaml, validate_definition};
use crate::workflow::engine::{CANCELLED_MESSAGE, ExecutorError, WorkflowEngine};
use crate::workflow::steps::ExecutorRegistry;

/// Default page size for run listings.
pub const DEFAULT_RUN_LIMIT: u32 = 50;

/// Service orchestrating workflow definitions and runs.
///
/// Generic over the repository so the core never depends on gridflow-infra.
pub struct WorkflowService<R: WorkflowRepository + 'static> {
    engine: Arc<WorkflowEngine<R>>,
}

impl<R: WorkflowRepository + 'static> WorkflowService<R> {
    pub fn new(repo: R, registry: ExecutorRegistry, config: &EngineConfig) -> Self {
        Self::from_engine(WorkflowEngine::new(repo, registry, config))
    }

    pub fn from_engine(engine: WorkflowEngine<R>) -> Self {
        Self {
            engine: Arc::new(engine),
        }
    }

    pub fn engine(&self) -> &WorkflowEngine<R> {
        &self.engine
    }

    fn repo(&self) -> &R {
        self.engine.checkpoint().repo()
    }

    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    /// Validate and store a new workflow. Returns its id.
    pub async fn save(
        &self,
        name: &str,
        description: Option<&str>,
        steps: Vec<StepDefinition>,
    ) -> Result<Uuid, ServiceError> {
        let def = WorkflowDefinition {
            id: Uuid::now_v7(),
            name: name.trim().to_string(),
            description: description.map(str::to_string),
            steps,
        };
        self.store_new(def).await
    }

    /// Store a workflow authored as JSON.
    pub async fn save_json(&self, json: &str) -> Result<Uuid, ServiceError> {
        self.store_new(parse_workflow_json(json)?).await
    }

    /// Store a workflow authored as YAML.
    pub async fn save_yaml(&self, yaml: &str) -> Result<Uuid, ServiceError> {
        self.store_new(parse_workflow_yaml(yaml)?).await
    }

    async fn store_new(&self, mut def: WorkflowDefinition) -> Result<Uuid, ServiceError> {
        validate_definition(&def)?;
        if def.id.is_nil() || self.find_definition(def.id).await?.is_some() {
            def.id = Uuid::now_v7();
        }
        self.repo()
            .save_definition(&def)
            .await
            .map_err(|e| ServiceError::Repository(e.to_string()))?;

        tracing::info!(workflow_id = %def.id, workflow = %def.name, steps = def.steps.len(), "saved workflow");
        Ok(def.id)
    }

    /// Replace the definition of an existing workflow. Runs already created
    /// keep executing their own snapshot.
    pub async fn update(&self, workflow_id: Uuid, mut def: WorkflowDefinition) -> Result<(), ServiceError> {
        if self.find_definition(workflow_id).await?.is_none() {
            return Err(ServiceError::WorkflowNotFound(workflow_id));
        }
        def.id = workflow_id;
        validate_definition(&def)?;
        self.repo()
            .save_definition(&def)
            .await
            .map_err(|e| ServiceError::Repository(e.to_string()))?;

        tracing::info!(workflow_id = %workflow_id, workflow = %def.name, "updated workflow");
        Ok(())
    }

    pub async fn get(&self, workflow_id: Uuid) -> Result<WorkflowDefinition, ServiceError> {
        self.find_definition(workflow_id)
            .await?
            .ok_or(ServiceError::WorkflowNotFound(workflow_id))
    }

    pub async fn list(&self) -> Result<Vec<WorkflowDefinition>, ServiceError> {
        self.repo()
            .list_definitions()
            .await
            .map_err(|e| ServiceError::Repository(e.to_string()))
    }

    pub async fn delete(&self, workflow_id: Uuid) -> Result<(), ServiceError> {
        let existed = self
            .repo()
            .delete_definition(&workflow_id)
            .await
            .map_err(|e| ServiceError::Repository(e.to_string()))?;
        if !existed {
            return Err(ServiceError::WorkflowNotFound(workflow_id));
        }
        tracing::info!(workflow_id = %workflow_id, "deleted workflow");
        Ok(())
    }

    async fn find_definition(&self, workflow_id: Uuid) -> Result<Option<WorkflowDefinition>, ServiceError> {
        self.repo()
            .get_definition(&workflow_id)
            .await
            .map_err(|e| ServiceError::Repository(e.to_string()))
    }

    // -----------------------------------------------------------------------
    // Execution
    // -----------------------------------------------------------------------

    /// Start a new run (or resume `resume`) on the tokio runtime and return
    /// its id immediately.
    pub async fn execute(&self, workflow_id: Uuid, resume: Option<Uuid>) -> Result<Uuid, ServiceError> {
        let run_id = self.prepare(workflow_id, resume).await?;
        let engine = self.engine.clone();
        tokio::spawn(async move {
            match engine.execute(run_id).await {
                Ok(result) => tracing::debug!(run_id = %run_id, status = %result.status, "background run stopped"),
                Err(e) => tracing::warn!(run_id = %run_id, error = %e, "background run ended with error"),
            }
        });
        Ok(run_id)
    }

    /// Start (or resume) a run and drive it inline.
    ///
    /// A run that fails inside a step is reported through the returned
    /// summary; errors are reserved for runs the engine could not drive.
    pub async fn execute_and_wait(&self, workflow_id: Uuid, resume: Option<Uuid>) -> Result<RunSummary, ServiceError> {
        let run_id = self.prepare(workflow_id, resume).await?;
        match self.engine.execute(run_id).await {
            Ok(_) => {}
            Err(
                ExecutorError::Step { .. }
                | ExecutorError::Panicked { .. }
                | ExecutorError::Workflow(_)
                | ExecutorError::MissingStepOutput { .. },
            ) => {}
            Err(e) => return Err(e.into()),
        }
        self.status(run_id).await
    }

    async fn prepare(&self, workflow_id: Uuid, resume: Option<Uuid>) -> Result<Uuid, ServiceError> {
        let Some(run_id) = resume else {
            return Ok(self.engine.create_run(workflow_id).await?.id);
        };

        let run = self.load_run(run_id).await?;
        if run.workflow_id != workflow_id {
            return Err(ServiceError::InvalidState(format!(
                "run {run_id} belongs to workflow {}",
                run.workflow_id
            )));
        }
        if run.status == RunStatus::Completed {
            return Err(ServiceError::InvalidState(format!("run {run_id} already completed")));
        }
        if self.engine.is_active(run_id) {
            return Err(ServiceError::InvalidState(format!("run {run_id} is already executing")));
        }

        // An explicit resume overrides any pause or cancel left on the run.
        self.engine
            .checkpoint()
            .set_control(run_id, None)
            .await
            .map_err(|e| ServiceError::Repository(e.to_string()))?;

        tracing::info!(
            run_id = %run_id,
            from_step = run.current_step_index,
            last_successful = run.last_successful_step_id.as_deref().unwrap_or(""),
            "resuming run"
        );
        Ok(run_id)
    }

    // -----------------------------------------------------------------------
    // Progress + results
    // -----------------------------------------------------------------------

    pub async fn status(&self, run_id: Uuid) -> Result<RunSummary, ServiceError> {
        Ok(RunSummary::from(&self.load_run(run_id).await?))
    }

    /// Final output of a completed run.
    pub async fn results(&self, run_id: Uuid) -> Result<DataContainer, ServiceError> {
        let run = self.load_run(run_id).await?;
        if run.status != RunStatus::Completed {
            return Err(ServiceError::NotCompleted { status: run.status });
        }
        let last = run
            .last_successful_step_id
            .as_deref()
            .ok_or_else(|| ServiceError::InvalidState(format!("run {run_id} completed without steps")))?;
        self.step_output(run_id, last)
            .await?
            .ok_or_else(|| ServiceError::InvalidState(format!("output of step '{last}' is missing")))
    }

    /// Stored output of one step, if that step has run.
    pub async fn step_output(&self, run_id: Uuid, step_id: &str) -> Result<Option<DataContainer>, ServiceError> {
        self.repo()
            .get_step_output(&run_id, step_id)
            .await
            .map_err(|e| ServiceError::Repository(e.to_string()))
    }

    pub async fn step_logs(&self, run_id: Uuid, step_id: Option<&str>) -> Result<Vec<StepLogEntry>, ServiceError> {
        self.repo()
            .list_step_logs(&run_id, step_id)
            .await
            .map_err(|e| ServiceError::Repository(e.to_string()))
    }

    /// Runs of a workflow, newest first.
    pub async fn list_runs(&self, workflow_id: Uuid, limit: Option<u32>) -> Result<Vec<RunSummary>, ServiceError> {
        let runs = self
            .repo()
            .list_runs(&workflow_id, limit.unwrap_or(DEFAULT_RUN_LIMIT))
            .await
            .map_err(|e| ServiceError::Repository(e.to_string()))?;
        Ok(runs.iter().map(RunSummary::from).collect())
    }

    // -----------------------------------------------------------------------
    // Control
    // -----------------------------------------------------------------------

    /// Ask the engine to pause the run before its next step.
    pub async fn pause(&self, run_id: Uuid) -> Result<RunStatus, ServiceError> {
        let run = self.load_run(run_id).await?;
        match run.status {
            RunStatus::Pending | RunStatus::Running => {
                self.set_control(run_id, RunControl::Pause).await?;
                tracing::info!(run_id = %run_id, "pause requested");
                Ok(run.status)
            }
            RunStatus::Paused => Ok(RunStatus::Paused),
            status => Err(ServiceError::InvalidState(format!("cannot pause a {status} run"))),
        }
    }

    /// Cancel a run. A running run stops before its next step; a pending or
    /// paused run that no engine is driving is failed immediately.
    pub async fn cancel(&self, run_id: Uuid) -> Result<RunStatus, ServiceError> {
        let mut run = self.load_run(run_id).await?;
        if run.status.is_terminal() {
            return Err(ServiceError::InvalidState(format!("cannot cancel a {} run", run.status)));
        }

        self.set_control(run_id, RunControl::Cancel).await?;
        if run.status == RunStatus::Running || self.engine.is_active(run_id) {
            tracing::info!(run_id = %run_id, "cancel requested");
            return Ok(run.status);
        }

        let step_id = run.next_step_id().map(str::to_string);
        run.status = RunStatus::Failed;
        run.completed_at = Some(Utc::now());
        run.errors.push(RunError {
            step_id: step_id.clone(),
            message: CANCELLED_MESSAGE.to_string(),
            detail: None,
        });
        // Only while no engine holds the lease; an engine that took it in the
        // meantime stops at its next step boundary on the control flag.
        match self.repo().update_run(&run, None).await {
            Ok(()) => {}
            Err(RepositoryError::LeaseLost) => {
                tracing::info!(run_id = %run_id, "cancel requested");
                return Ok(RunStatus::Running);
            }
            Err(e) => return Err(ServiceError::Repository(e.to_string())),
        }
        self.repo()
            .append_step_logs(&[StepLogEntry::new(
                run_id,
                step_id.unwrap_or_default(),
                LogLevel::Warn,
                "run cancelled before this step",
            )])
            .await
            .map_err(|e| ServiceError::Repository(e.to_string()))?;

        tracing::info!(run_id = %run_id, "run cancelled");
        Ok(RunStatus::Failed)
    }

    /// Park runs whose engine stopped heartbeating. Returns their ids.
    pub async fn recover_stale_runs(&self) -> Result<Vec<Uuid>, ServiceError> {
        Ok(self.engine.recover_stale_runs().await?)
    }

    async fn set_control(&self, run_id: Uuid, control: RunControl) -> Result<(), ServiceError> {
        self.engine
            .checkpoint()
            .set_control(run_id, Some(control))
            .await
            .map_err(|e| ServiceError::Repository(e.to_string()))
    }

    async fn load_run(&self, run_id: Uuid) -> Result<WorkflowRun, ServiceError> {
        self.repo()
            .get_run(&run_id)
            .await
            .map_err(|e| ServiceError::Repository(e.to_string()))?
            .ok_or(ServiceError::RunNotFound(run_id))
    }
}

// ---------------------------------------------------------------------------
// ServiceError
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("workflow not found: {0}")]
    WorkflowNotFound(Uuid),

    #[error("workflow run not found: {0}")]
    RunNotFound(Uuid),

    #[error("workflow run is {status}, not completed")]
    NotCompleted { status: RunStatus },

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("invalid workflow definition: {0}")]
    Definition(#[from] WorkflowError),

    #[error("engine error: {0}")]
    Engine(ExecutorError),

    #[error("storage error: {0}")]
    Repository(String),
}

impl From<ExecutorError> for ServiceError {
    fn from(err: ExecutorError) -> Self {
        match err {
            ExecutorError::WorkflowNotFound(id) => ServiceError::WorkflowNotFound(id),
            ExecutorError::RunNotFound(id) => ServiceError::RunNotFound(id),
            ExecutorError::Workflow(e) => ServiceError::Definition(e),
            other => ServiceError::Engine(other),
        }
    }
}
