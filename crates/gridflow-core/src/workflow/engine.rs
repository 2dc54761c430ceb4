//! Sequential workflow engine with durable step checkpoints.
//!
//! Steps run strictly in definition order. After every step the output and
//! the run's advanced progress are committed together, so a run that stops
//! for any reason (failure, pause, crash) resumes at the first step whose
//! output was never stored.
//!
//! An engine holds a per-run lease while it drives a run and renews it from
//! a background heartbeat task. Every run write is conditional on holding
//! that lease, and an engine that loses it stops at the next step boundary
//! without touching the run again. A run whose heartbeat goes stale is picked
//! up by [`WorkflowEngine::recover_stale_runs`] and parked as `paused`.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::FutureExt;
use gridflow_types::config::EngineConfig;
use gridflow_types::container::DataContainer;
use gridflow_types::workflow::{LogLevel, RunControl, RunStatus, StepLogEntry, WorkflowRun};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::repository::workflow::WorkflowRepository;

use super::checkpoint::{CheckpointError, CheckpointManager};
use super::definition::{PlannedStep, WorkflowError, resolve_plan, validate_definition};
use super::state::WorkflowState;
use super::steps::{ExecutionSettings, ExecutorRegistry, StepContext, StepError};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Message recorded on a run stopped by a cancel request.
pub const CANCELLED_MESSAGE: &str = "cancelled";

// ---------------------------------------------------------------------------
// ExecutionResult
// ---------------------------------------------------------------------------

/// Where a run stopped when the engine returned without an error.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub run_id: Uuid,
    /// `completed`, `paused`, or `failed` for a cancelled run.
    pub status: RunStatus,
    pub last_successful_step_id: Option<String>,
    /// Output of the last step this engine committed or loaded.
    pub output: Option<DataContainer>,
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

/// Generic over `R: WorkflowRepository` for storage flexibility.
pub struct WorkflowEngine<R: WorkflowRepository> {
    checkpoint: Arc<CheckpointManager<R>>,
    registry: Arc<ExecutorRegistry>,
    settings: Arc<ExecutionSettings>,
    /// Lease owner id of this engine instance.
    engine_id: Uuid,
    lease_ttl: Duration,
    heartbeat_interval: Duration,
    /// Heartbeat stop tokens of the runs this instance is driving.
    active_runs: DashMap<Uuid, CancellationToken>,
}

impl<R: WorkflowRepository + 'static> WorkflowEngine<R> {
    pub fn new(repo: R, registry: ExecutorRegistry, config: &EngineConfig) -> Self {
        Self {
            checkpoint: Arc::new(CheckpointManager::new(repo)),
            registry: Arc::new(registry),
            settings: Arc::new(ExecutionSettings::from_config(config)),
            engine_id: Uuid::now_v7(),
            lease_ttl: Duration::from_secs(config.lease_ttl_secs.max(1)),
            heartbeat_interval: Duration::from_secs(config.heartbeat_interval_secs.max(1)),
            active_runs: DashMap::new(),
        }
    }

    /// Replace the execution settings derived from the engine config.
    pub fn with_settings(mut self, settings: ExecutionSettings) -> Self {
        self.settings = Arc::new(settings);
        self
    }

    pub fn engine_id(&self) -> Uuid {
        self.engine_id
    }

    pub fn checkpoint(&self) -> &CheckpointManager<R> {
        &self.checkpoint
    }

    /// Whether this engine instance is currently driving `run_id`.
    pub fn is_active(&self, run_id: Uuid) -> bool {
        self.active_runs.contains_key(&run_id)
    }

    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    /// Create a pending run over a snapshot of the saved workflow.
    pub async fn create_run(&self, workflow_id: Uuid) -> Result<WorkflowRun, ExecutorError> {
        let definition = self
            .checkpoint
            .repo()
            .get_definition(&workflow_id)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?
            .ok_or(ExecutorError::WorkflowNotFound(workflow_id))?;
        validate_definition(&definition)?;

        let run = WorkflowRun::new(&definition);
        self.checkpoint
            .repo()
            .create_run(&run)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?;

        tracing::info!(
            run_id = %run.id,
            workflow_id = %workflow_id,
            workflow = %run.workflow_name,
            total_steps = run.total_steps,
            "created workflow run"
        );
        Ok(run)
    }

    /// Drive a run from its first unexecuted step until it completes,
    /// pauses, is cancelled, or a step fails.
    ///
    /// A step failure is persisted on the run before it is returned as
    /// `Err`. Pause and cancel are returned as `Ok` with the final status.
    pub async fn execute(&self, run_id: Uuid) -> Result<ExecutionResult, ExecutorError> {
        let run = self.load_run(run_id).await?;
        if run.status == RunStatus::Completed {
            return Err(ExecutorError::AlreadyCompleted(run_id));
        }

        let token = CancellationToken::new();
        match self.active_runs.entry(run_id) {
            Entry::Occupied(_) => return Err(ExecutorError::LeaseHeld(run_id)),
            Entry::Vacant(slot) => {
                slot.insert(token.clone());
            }
        }

        let acquired = self
            .checkpoint
            .acquire_lease(run_id, self.engine_id, self.lease_ttl)
            .await;
        match acquired {
            Ok(true) => {}
            Ok(false) => {
                self.active_runs.remove(&run_id);
                return Err(ExecutorError::LeaseHeld(run_id));
            }
            Err(e) => {
                self.active_runs.remove(&run_id);
                return Err(e.into());
            }
        }

        let lease_lost = CancellationToken::new();
        let heartbeat = self.spawn_heartbeat(run_id, token.clone(), lease_lost.clone());
        let result = self.drive(run_id, &lease_lost).await;

        token.cancel();
        let _ = heartbeat.await;
        if let Err(e) = self.checkpoint.release_lease(run_id, self.engine_id).await {
            tracing::warn!(run_id = %run_id, error = %e, "failed to release run lease");
        }
        self.active_runs.remove(&run_id);
        result
    }

    /// Park every running run whose heartbeat went stale as `paused`.
    ///
    /// Returns the ids of the recovered runs. Runs this instance is driving
    /// are skipped.
    pub async fn recover_stale_runs(&self) -> Result<Vec<Uuid>, ExecutorError> {
        let stale = self.checkpoint.stale_runs(self.lease_ttl).await?;
        let mut recovered = Vec::with_capacity(stale.len());

        for mut run in stale {
            if self.is_active(run.id) {
                continue;
            }
            if !self
                .checkpoint
                .acquire_lease(run.id, self.engine_id, self.lease_ttl)
                .await?
            {
                continue;
            }

            let previous_owner = run.lease_owner;
            run.status = RunStatus::Paused;
            self.checkpoint.checkpoint_run(&run, self.engine_id).await?;
            let step_id = run.next_step_id().unwrap_or_default().to_string();
            self.checkpoint
                .append_logs(&[StepLogEntry::new(
                    run.id,
                    step_id,
                    LogLevel::Warn,
                    "engine stopped heartbeating; run paused for resume",
                )])
                .await?;
            self.checkpoint.release_lease(run.id, self.engine_id).await?;

            tracing::warn!(
                run_id = %run.id,
                previous_owner = ?previous_owner,
                step_index = run.current_step_index,
                "recovered stale workflow run"
            );
            recovered.push(run.id);
        }
        Ok(recovered)
    }

    // -----------------------------------------------------------------------
    // Driving a run
    // -----------------------------------------------------------------------

    async fn drive(&self, run_id: Uuid, lease_lost: &CancellationToken) -> Result<ExecutionResult, ExecutorError> {
        // Reloaded under the lease; another engine may have moved it on.
        let run = self.load_run(run_id).await?;
        if run.status == RunStatus::Completed {
            return Err(ExecutorError::AlreadyCompleted(run_id));
        }
        let mut state = WorkflowState::new(run);

        // Cancelled while no engine held the lease: the failure is already
        // recorded, only the request is left to consume.
        if state.run.status == RunStatus::Failed && state.run.control == Some(RunControl::Cancel) {
            self.checkpoint.set_control(run_id, None).await?;
            tracing::info!(run_id = %run_id, "run was cancelled before execution");
            return Ok(result_of(&state, Some(CANCELLED_MESSAGE.to_string())));
        }

        let plan = match resolve_plan(&state.run.definition) {
            Ok(plan) => plan,
            Err(e) => {
                let step_id = match &e {
                    WorkflowError::UnknownStepType { step_id, .. }
                    | WorkflowError::InvalidConfig { step_id, .. } => Some(step_id.clone()),
                    _ => None,
                };
                return Err(self.fail_run(&mut state, step_id.as_deref(), e.into()).await);
            }
        };
        if let Some(missing) = plan.iter().find(|step| !self.registry.contains(step.kind)) {
            let err = WorkflowError::UnknownStepType {
                step_id: missing.step_id.clone(),
                step_type: missing.kind.to_string(),
            };
            return Err(self.fail_run(&mut state, Some(missing.step_id.as_str()), err.into()).await);
        }

        let resuming = state.run.current_step_index > 0;
        state.mark_running();
        self.checkpoint.checkpoint_run(&state.run, self.engine_id).await?;
        if resuming {
            tracing::info!(
                run_id = %run_id,
                workflow = %state.run.workflow_name,
                from_step = state.run.current_step_index,
                total_steps = plan.len(),
                "resuming workflow run"
            );
        } else {
            tracing::info!(
                run_id = %run_id,
                workflow = %state.run.workflow_name,
                total_steps = plan.len(),
                "starting workflow run"
            );
        }

        let start = state.run.current_step_index;
        for planned in plan.iter().skip(start) {
            if lease_lost.is_cancelled() {
                return Err(lease_lost_error(&state, &planned.step_id));
            }
            match self.checkpoint.control(run_id).await? {
                Some(RunControl::Pause) => return self.pause_run(&mut state, &planned.step_id).await,
                Some(RunControl::Cancel) => return self.cancel_run(&mut state, &planned.step_id).await,
                None => {}
            }
            match self.run_step(&mut state, planned, &plan).await {
                Ok(()) => {}
                Err(ExecutorError::LeaseHeld(_)) => return Err(lease_lost_error(&state, &planned.step_id)),
                Err(e) => return Err(self.fail_run(&mut state, Some(planned.step_id.as_str()), e).await),
            }
        }

        state.mark_completed();
        self.checkpoint.checkpoint_run(&state.run, self.engine_id).await?;
        tracing::info!(
            run_id = %run_id,
            workflow = %state.run.workflow_name,
            last_step = state.run.last_successful_step_id.as_deref().unwrap_or(""),
            "workflow run completed"
        );
        Ok(result_of(&state, None))
    }

    async fn run_step(
        &self,
        state: &mut WorkflowState,
        planned: &PlannedStep,
        plan: &[PlannedStep],
    ) -> Result<(), ExecutorError> {
        let executor = self
            .registry
            .get(planned.kind)
            .ok_or_else(|| WorkflowError::UnknownStepType {
                step_id: planned.step_id.clone(),
                step_type: planned.kind.to_string(),
            })?;

        let input = self.step_input(state, planned, plan).await?;
        executor
            .validate_input(input.as_deref())
            .map_err(|source| ExecutorError::Step {
                step_id: planned.step_id.clone(),
                source,
            })?;

        state.log(&planned.step_id, LogLevel::Info, format!("started {} step", planned.kind));
        tracing::info!(
            run_id = %state.run.id,
            step_id = %planned.step_id,
            kind = %planned.kind,
            index = planned.index,
            "step started"
        );

        let ctx = StepContext {
            run_id: state.run.id,
            step_id: planned.step_id.clone(),
            kind: planned.kind,
            settings: self.settings.clone(),
        };
        let started = Instant::now();
        let outcome = AssertUnwindSafe(executor.execute(&ctx, &planned.config, input.as_deref()))
            .catch_unwind()
            .await;
        let elapsed_ms = started.elapsed().as_millis();

        let output = match outcome {
            Ok(Ok(output)) => output,
            Ok(Err(source)) => {
                return Err(ExecutorError::Step {
                    step_id: planned.step_id.clone(),
                    source,
                });
            }
            Err(panic) => {
                return Err(ExecutorError::Panicked {
                    step_id: planned.step_id.clone(),
                    message: panic_message(panic.as_ref()),
                });
            }
        };

        for error in &output.errors {
            tracing::warn!(
                run_id = %state.run.id,
                step_id = %planned.step_id,
                entity = %error.entity,
                period = %error.period,
                attempts = error.attempts,
                error = %error.message,
                "item failed"
            );
        }
        tracing::info!(
            run_id = %state.run.id,
            step_id = %planned.step_id,
            elapsed_ms = elapsed_ms as u64,
            shape = %output.shape(),
            items = output.total_items(),
            errors = output.errors.len(),
            warnings = output.warnings.len(),
            "step completed"
        );
        state.log_step_result(&planned.step_id, &output, elapsed_ms);

        let mut next = state.run.clone();
        next.current_step_index = planned.index + 1;
        next.last_successful_step_id = Some(planned.step_id.clone());
        self.checkpoint
            .commit_step(&next, self.engine_id, &planned.step_id, &output)
            .await?;
        state.record_output(planned.index, &planned.step_id, Arc::new(output));

        let logs = state.drain_logs();
        if let Err(e) = self.checkpoint.append_logs(&logs).await {
            tracing::warn!(run_id = %state.run.id, step_id = %planned.step_id, error = %e, "failed to persist step logs");
        }
        Ok(())
    }

    /// The output feeding `planned`, reloaded from storage when this engine
    /// did not produce it (after a resume).
    async fn step_input(
        &self,
        state: &mut WorkflowState,
        planned: &PlannedStep,
        plan: &[PlannedStep],
    ) -> Result<Option<Arc<DataContainer>>, ExecutorError> {
        let Some(source) = planned.input_from.and_then(|index| plan.get(index)) else {
            return Ok(None);
        };
        if let Some(output) = state.output(&source.step_id) {
            return Ok(Some(output));
        }

        let loaded = self
            .checkpoint
            .load_output(state.run.id, &source.step_id)
            .await?
            .ok_or_else(|| ExecutorError::MissingStepOutput {
                step_id: planned.step_id.clone(),
                source_step: source.step_id.clone(),
            })?;
        tracing::debug!(
            run_id = %state.run.id,
            step_id = %planned.step_id,
            source_step = %source.step_id,
            "reloaded step output"
        );
        let loaded = Arc::new(loaded);
        state.remember_output(&source.step_id, loaded.clone());
        Ok(Some(loaded))
    }

    async fn pause_run(&self, state: &mut WorkflowState, step_id: &str) -> Result<ExecutionResult, ExecutorError> {
        state.mark_paused();
        state.log(step_id, LogLevel::Info, "run paused before this step");
        self.checkpoint.checkpoint_run(&state.run, self.engine_id).await?;
        self.checkpoint.set_control(state.run.id, None).await?;
        self.flush_logs(state).await;

        tracing::info!(run_id = %state.run.id, next_step = step_id, "workflow run paused");
        Ok(result_of(state, None))
    }

    async fn cancel_run(&self, state: &mut WorkflowState, step_id: &str) -> Result<ExecutionResult, ExecutorError> {
        state.fail(Some(step_id), CANCELLED_MESSAGE, None);
        state.log(step_id, LogLevel::Warn, "run cancelled before this step");
        self.checkpoint.checkpoint_run(&state.run, self.engine_id).await?;
        self.checkpoint.set_control(state.run.id, None).await?;
        self.flush_logs(state).await;

        tracing::info!(run_id = %state.run.id, next_step = step_id, "workflow run cancelled");
        Ok(result_of(state, Some(CANCELLED_MESSAGE.to_string())))
    }

    /// Record `error` on the run and hand it back for the caller to return.
    async fn fail_run(&self, state: &mut WorkflowState, step_id: Option<&str>, error: ExecutorError) -> ExecutorError {
        let message = error.to_string();
        let log_step = step_id
            .map(str::to_string)
            .or_else(|| state.run.next_step_id().map(str::to_string))
            .unwrap_or_default();

        tracing::error!(
            run_id = %state.run.id,
            step_id = %log_step,
            error = %message,
            "workflow run failed"
        );
        state.log(&log_step, LogLevel::Error, message.clone());
        state.fail(step_id, message, Some(format!("{error:?}")));

        if let Err(e) = self.checkpoint.checkpoint_run(&state.run, self.engine_id).await {
            tracing::error!(run_id = %state.run.id, error = %e, "failed to persist run failure");
        }
        self.flush_logs(state).await;
        error
    }

    async fn flush_logs(&self, state: &mut WorkflowState) {
        let logs = state.drain_logs();
        if let Err(e) = self.checkpoint.append_logs(&logs).await {
            tracing::warn!(run_id = %state.run.id, error = %e, "failed to persist step logs");
        }
    }

    async fn load_run(&self, run_id: Uuid) -> Result<WorkflowRun, ExecutorError> {
        self.checkpoint.load_run(run_id).await.map_err(|e| match e {
            CheckpointError::RunNotFound(id) => ExecutorError::RunNotFound(id),
            other => other.into(),
        })
    }

    /// Renew the lease every heartbeat interval until `token` is cancelled.
    /// Losing the lease cancels `lease_lost`.
    fn spawn_heartbeat(&self, run_id: Uuid, token: CancellationToken, lease_lost: CancellationToken) -> JoinHandle<()> {
        let checkpoint = self.checkpoint.clone();
        let owner = self.engine_id;
        let interval = self.heartbeat_interval;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        match checkpoint.renew_lease(run_id, owner).await {
                            Ok(true) => tracing::trace!(run_id = %run_id, "lease renewed"),
                            Ok(false) => {
                                tracing::warn!(run_id = %run_id, "run lease lost to another engine");
                                lease_lost.cancel();
                                break;
                            }
                            Err(e) => tracing::warn!(run_id = %run_id, error = %e, "lease renewal failed"),
                        }
                    }
                }
            }
        })
    }
}

fn result_of(state: &WorkflowState, error: Option<String>) -> ExecutionResult {
    ExecutionResult {
        run_id: state.run.id,
        status: state.run.status,
        last_successful_step_id: state.run.last_successful_step_id.clone(),
        output: state.last_output().map(|output| (*output).clone()),
        error,
    }
}

/// Stop driving a run whose lease moved to another engine. Nothing is
/// written; the new holder owns the run's state from here on.
fn lease_lost_error(state: &WorkflowState, step_id: &str) -> ExecutorError {
    tracing::warn!(
        run_id = %state.run.id,
        next_step = step_id,
        "lease lost; abandoning workflow run"
    );
    ExecutorError::LeaseHeld(state.run.id)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "executor panicked".to_string()
    }
}

// ---------------------------------------------------------------------------
// ExecutorError
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// Definition could not be planned.
    #[error("workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("checkpoint error: {0}")]
    Checkpoint(#[source] CheckpointError),

    #[error("step '{step_id}' failed: {source}")]
    Step { step_id: String, source: StepError },

    #[error("step '{step_id}' panicked: {message}")]
    Panicked { step_id: String, message: String },

    #[error("step '{step_id}' needs the output of '{source_step}', which was never stored")]
    MissingStepOutput { step_id: String, source_step: String },

    #[error("workflow run not found: {0}")]
    RunNotFound(Uuid),

    #[error("workflow not found: {0}")]
    WorkflowNotFound(Uuid),

    /// Another engine (or this one) is driving the run.
    #[error("workflow run {0} is already being executed")]
    LeaseHeld(Uuid),

    #[error("workflow run {0} already completed")]
    AlreadyCompleted(Uuid),
}

impl From<CheckpointError> for ExecutorError {
    fn from(err: CheckpointError) -> Self {
        match err {
            CheckpointError::LeaseLost(run_id) => Self::LeaseHeld(run_id),
            other => Self::Checkpoint(other),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
