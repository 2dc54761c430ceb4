//! Workflow definition, run, and step-log records.
//!
//! The definition is the stable JSON authoring format:
//!
//! ```json
//! {
//!   "name": "health-screen",
//!   "description": "Score filings and keep the strong ones",
//!   "steps": [
//!     {"step_id": "load", "type": "input", "config": {"tickers": ["A"], "periods": [2024]}},
//!     {"step_id": "score", "type": "primary_analysis", "config": {"analysis_kind": "health"}}
//!   ]
//! }
//! ```
//!
//! A run stores a deep copy of the definition it executes, so editing the
//! workflow while the run is in flight has no effect on it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Definition
// ---------------------------------------------------------------------------

/// A saved workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Assigned on save; absent (nil) in freshly authored documents.
    #[serde(default)]
    pub id: Uuid,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub steps: Vec<StepDefinition>,
}

impl WorkflowDefinition {
    pub fn step_index(&self, step_id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.step_id == step_id)
    }
}

/// One step as authored. `step_type` and `config` are resolved into typed
/// form when the workflow is loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    #[serde(alias = "stepId", alias = "id")]
    pub step_id: String,
    #[serde(rename = "type")]
    pub step_type: String,
    #[serde(default)]
    pub config: Value,
    /// Earlier steps this one reads from. The last entry supplies the input;
    /// when empty the previous step's output is used.
    #[serde(default, alias = "dependsOn", skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
}

// ---------------------------------------------------------------------------
// Runs
// ---------------------------------------------------------------------------

/// Status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Paused,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Paused => "paused",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Externally requested change of a run's state, observed at the next step
/// boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunControl {
    Pause,
    Cancel,
}

/// A fatal error recorded on a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub message: String,
    /// Full error chain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// One execution of a workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub workflow_name: String,
    /// Snapshot of the definition taken when the run was created.
    pub definition: WorkflowDefinition,
    pub status: RunStatus,
    /// Index of the next step to execute.
    pub current_step_index: usize,
    pub total_steps: usize,
    pub last_successful_step_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub errors: Vec<RunError>,
    #[serde(default)]
    pub control: Option<RunControl>,
    #[serde(default)]
    pub lease_owner: Option<Uuid>,
    #[serde(default)]
    pub heartbeat_at: Option<DateTime<Utc>>,
}

impl WorkflowRun {
    /// A pending run over a snapshot of `definition`.
    pub fn new(definition: &WorkflowDefinition) -> Self {
        Self {
            id: Uuid::now_v7(),
            workflow_id: definition.id,
            workflow_name: definition.name.clone(),
            definition: definition.clone(),
            status: RunStatus::Pending,
            current_step_index: 0,
            total_steps: definition.steps.len(),
            last_successful_step_id: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            errors: Vec::new(),
            control: None,
            lease_owner: None,
            heartbeat_at: None,
        }
    }

    /// The step that will run next, if any remain.
    pub fn next_step_id(&self) -> Option<&str> {
        self.definition
            .steps
            .get(self.current_step_index)
            .map(|s| s.step_id.as_str())
    }
}

/// Caller-facing progress report for a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub workflow_id: Uuid,
    pub status: RunStatus,
    pub step_index: usize,
    pub total_steps: usize,
    pub last_successful_step_id: Option<String>,
    pub errors: Vec<RunError>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&WorkflowRun> for RunSummary {
    fn from(run: &WorkflowRun) -> Self {
        Self {
            run_id: run.id,
            workflow_id: run.workflow_id,
            status: run.status,
            step_index: run.current_step_index,
            total_steps: run.total_steps,
            last_successful_step_id: run.last_successful_step_id.clone(),
            errors: run.errors.clone(),
            started_at: run.started_at,
            completed_at: run.completed_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Step logs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// Append-only, human-facing record of what a step did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepLogEntry {
    pub run_id: Uuid,
    pub step_id: String,
    pub level: LogLevel,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl StepLogEntry {
    pub fn new(run_id: Uuid, step_id: impl Into<String>, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            run_id,
            step_id: step_id.into(),
            level,
            message: message.into(),
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_definition() -> WorkflowDefinition {
        serde_json::from_value(json!({
            "name": "screen",
            "description": "score and filter",
            "steps": [
                {"step_id": "load", "type": "input", "config": {"tickers": ["A"], "periods": [2024]}},
                {"stepId": "score", "type": "primary_analysis", "dependsOn": ["load"]}
            ]
        }))
        .unwrap()
    }

    #[test]
    fn test_definition_parses_both_key_spellings() {
        let def = sample_definition();
        assert!(def.id.is_nil());
        assert_eq!(def.steps.len(), 2);
        assert_eq!(def.steps[1].step_id, "score");
        assert_eq!(def.steps[1].depends_on, vec!["load".to_string()]);
        assert_eq!(def.steps[1].config, Value::Null);
        assert_eq!(def.step_index("score"), Some(1));
    }

    #[test]
    fn test_definition_serializes_with_type_key() {
        let value = serde_json::to_value(sample_definition()).unwrap();
        assert_eq!(value["steps"][0]["type"], "input");
        assert_eq!(value["steps"][0]["step_id"], "load");
        assert!(value["steps"][0].get("depends_on").is_none());
    }

    #[test]
    fn test_new_run_snapshots_definition() {
        let mut def = sample_definition();
        def.id = Uuid::now_v7();
        let run = WorkflowRun::new(&def);
        def.steps.clear();

        assert_eq!(run.status, RunStatus::Pending);
        assert_eq!(run.total_steps, 2);
        assert_eq!(run.definition.steps.len(), 2);
        assert_eq!(run.next_step_id(), Some("load"));
    }

    #[test]
    fn test_run_status_terminality() {
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(!RunStatus::Paused.is_terminal());
        assert_eq!(
            serde_json::to_value(RunStatus::Paused).unwrap(),
            json!("paused")
        );
    }
}
