//! In-memory state of a run while an engine drives it.

use std::sync::Arc;

use chrono::Utc;
use gridflow_types::container::DataContainer;
use gridflow_types::workflow::{LogLevel, RunError, RunStatus, StepLogEntry, WorkflowRun};
use indexmap::IndexMap;

/// The run record plus the step outputs and log entries produced since the
/// engine picked it up.
#[derive(Debug)]
pub struct WorkflowState {
    pub run: WorkflowRun,
    outputs: IndexMap<String, Arc<DataContainer>>,
    pending_logs: Vec<StepLogEntry>,
}

impl WorkflowState {
    pub fn new(run: WorkflowRun) -> Self {
        Self {
            run,
            outputs: IndexMap::new(),
            pending_logs: Vec::new(),
        }
    }

    pub fn output(&self, step_id: &str) -> Option<Arc<DataContainer>> {
        self.outputs.get(step_id).cloned()
    }

    /// Cache an output reloaded from storage after a resume.
    pub fn remember_output(&mut self, step_id: &str, output: Arc<DataContainer>) {
        self.outputs.insert(step_id.to_string(), output);
    }

    /// Advance progress past step `index`.
    pub fn record_output(&mut self, index: usize, step_id: &str, output: Arc<DataContainer>) {
        self.run.current_step_index = index + 1;
        self.run.last_successful_step_id = Some(step_id.to_string());
        self.outputs.insert(step_id.to_string(), output);
    }

    /// The output of the last committed step.
    pub fn last_output(&self) -> Option<Arc<DataContainer>> {
        let step_id = self.run.last_successful_step_id.as_deref()?;
        self.output(step_id)
    }

    pub fn mark_running(&mut self) {
        self.run.status = RunStatus::Running;
        self.run.started_at.get_or_insert_with(Utc::now);
        self.run.completed_at = None;
    }

    pub fn mark_paused(&mut self) {
        self.run.status = RunStatus::Paused;
    }

    pub fn mark_completed(&mut self) {
        self.run.status = RunStatus::Completed;
        self.run.completed_at = Some(Utc::now());
    }

    pub fn fail(&mut self, step_id: Option<&str>, message: impl Into<String>, detail: Option<String>) {
        self.run.status = RunStatus::Failed;
        self.run.completed_at = Some(Utc::now());
        self.run.errors.push(RunError {
            step_id: step_id.map(str::to_string),
            message: message.into(),
            detail,
        });
    }

    // -----------------------------------------------------------------------
    // Step logs
    // -----------------------------------------------------------------------

    pub fn log(&mut self, step_id: &str, level: LogLevel, message: impl Into<String>) {
        self.pending_logs
            .push(StepLogEntry::new(self.run.id, step_id, level, message));
    }

    /// Completion entry plus one entry per item error and per warning.
    pub fn log_step_result(&mut self, step_id: &str, output: &DataContainer, elapsed_ms: u128) {
        self.log(
            step_id,
            LogLevel::Info,
            format!(
                "completed in {elapsed_ms}ms: shape {}, {} items, {} errors, {} warnings",
                output.shape(),
                output.total_items(),
                output.errors.len(),
                output.warnings.len()
            ),
        );
        for error in &output.errors {
            self.log(
                step_id,
                LogLevel::Warn,
                format!(
                    "{}/{} failed after {} attempt(s): {}",
                    error.entity, error.period, error.attempts, error.message
                ),
            );
        }
        for warning in &output.warnings {
            self.log(step_id, LogLevel::Warn, warning.to_string());
        }
    }

    pub fn drain_logs(&mut self) -> Vec<StepLogEntry> {
        std::mem::take(&mut self.pending_logs)
    }
}
