//! Workflow definition parsing, validation, and plan resolution.
//!
//! JSON is the canonical authoring format; YAML is accepted as an
//! alternative. Validation resolves every step's `type` and `config` into
//! typed form, so a definition that validates can always be planned.

use std::collections::HashMap;

use gridflow_types::step::{StepConfig, StepKind};
use gridflow_types::workflow::WorkflowDefinition;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum WorkflowError {
    /// JSON/YAML parse failure.
    #[error("parse error: {0}")]
    Parse(String),

    /// Structural validation failure.
    #[error("validation error: {0}")]
    Validation(String),

    #[error("step '{step_id}': unknown step type '{step_type}'")]
    UnknownStepType { step_id: String, step_type: String },

    #[error("step '{step_id}': invalid config: {message}")]
    InvalidConfig { step_id: String, message: String },
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse and validate a JSON workflow definition.
pub fn parse_workflow_json(json: &str) -> Result<WorkflowDefinition, WorkflowError> {
    let def: WorkflowDefinition =
        serde_json::from_str(json).map_err(|e| WorkflowError::Parse(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

/// Parse and validate a YAML workflow definition.
pub fn parse_workflow_yaml(yaml: &str) -> Result<WorkflowDefinition, WorkflowError> {
    let def: WorkflowDefinition =
        serde_yaml_ng::from_str(yaml).map_err(|e| WorkflowError::Parse(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

pub fn serialize_workflow_json(def: &WorkflowDefinition) -> Result<String, WorkflowError> {
    serde_json::to_string_pretty(def).map_err(|e| WorkflowError::Parse(e.to_string()))
}

// ---------------------------------------------------------------------------
// Planning
// ---------------------------------------------------------------------------

/// One step of a definition with its kind and config resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedStep {
    pub index: usize,
    pub step_id: String,
    pub kind: StepKind,
    pub config: StepConfig,
    /// Index of the step whose output feeds this one. `None` for the first
    /// step.
    pub input_from: Option<usize>,
}

/// Resolve every step of `def`.
///
/// The input of a step is the output of the last step named in its
/// `depends_on`, or of the preceding step when `depends_on` is empty.
/// Dependencies must name earlier steps.
pub fn resolve_plan(def: &WorkflowDefinition) -> Result<Vec<PlannedStep>, WorkflowError> {
    let mut seen: HashMap<&str, usize> = HashMap::with_capacity(def.steps.len());
    let mut plan = Vec::with_capacity(def.steps.len());

    for (index, step) in def.steps.iter().enumerate() {
        let step_id = step.step_id.trim();
        if step_id.is_empty() {
            return Err(WorkflowError::Validation(format!("step {index} has an empty step_id")));
        }
        if seen.contains_key(step_id) {
            return Err(WorkflowError::Validation(format!("duplicate step_id '{step_id}'")));
        }

        let kind: StepKind = step.step_type.parse().map_err(|_| WorkflowError::UnknownStepType {
            step_id: step_id.to_string(),
            step_type: step.step_type.clone(),
        })?;
        let config = StepConfig::parse(kind, &step.config).map_err(|e| WorkflowError::InvalidConfig {
            step_id: step_id.to_string(),
            message: e.to_string(),
        })?;

        for dep in &step.depends_on {
            if !seen.contains_key(dep.as_str()) {
                return Err(WorkflowError::Validation(format!(
                    "step '{step_id}' depends on '{dep}', which is not an earlier step"
                )));
            }
        }
        let input_from = match step.depends_on.last() {
            Some(dep) => seen.get(dep.as_str()).copied(),
            None => index.checked_sub(1),
        };

        seen.insert(step_id, index);
        plan.push(PlannedStep {
            index,
            step_id: step_id.to_string(),
            kind,
            config,
            input_from,
        });
    }
    Ok(plan)
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Check a definition before it is saved or run.
///
/// - the name is non-empty
/// - there is at least one step
/// - step ids are non-empty and unique
/// - every type is a known step kind and every config parses for it
/// - `depends_on` names earlier steps only
pub fn validate_definition(def: &WorkflowDefinition) -> Result<(), WorkflowError> {
    if def.name.trim().is_empty() {
        return Err(WorkflowError::Validation("workflow name must not be empty".into()));
    }
    if def.steps.is_empty() {
        return Err(WorkflowError::Validation("workflow must have at least one step".into()));
    }
    resolve_plan(def).map(|_| ())
}
