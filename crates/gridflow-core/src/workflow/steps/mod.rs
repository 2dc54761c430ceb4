//! Step executors.
//!
//! Every step kind has one [`StepExecutor`]. The engine resolves executors
//! through an [`ExecutorRegistry`] keyed by [`StepKind`], so dispatch is a
//! table lookup fixed when the registry is built.
//!
//! Executors receive the previous step's output by reference and return a
//! fresh [`DataContainer`]. Per-cell failures are recorded inside the
//! returned container; only step-level failures surface as [`StepError`].

pub mod aggregate;
pub mod custom_prompt;
pub mod export;
pub mod filter;
pub mod input;
pub mod lens;
pub mod primary;
pub mod secondary;
mod work;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use gridflow_types::config::EngineConfig;
use gridflow_types::container::DataContainer;
use gridflow_types::step::{StepConfig, StepKind};
use thiserror::Error;
use uuid::Uuid;

use crate::provider::analysis::{AnalysisService, AnalysisServiceDyn};
use crate::provider::document::{DocumentSource, DocumentSourceDyn};
use crate::provider::export::{ExportSink, ExportSinkDyn};

use super::retry::RetryPolicy;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Step-level failures. Any of these fails the run.
#[derive(Debug, Error)]
pub enum StepError {
    /// The input does not have the shape or payload type this step needs.
    #[error("invalid input: expected {expected}, found {actual}")]
    Validation { expected: String, actual: String },

    #[error("{expected} executor received a {actual} config")]
    ConfigMismatch { expected: StepKind, actual: StepKind },

    #[error("invalid step config: {0}")]
    InvalidConfig(String),

    /// Too many work units failed.
    #[error("{failed} of {total} work units failed (threshold {:.0}%)", .threshold * 100.0)]
    Systemic {
        failed: usize,
        total: usize,
        threshold: f64,
    },

    #[error("step produced no items")]
    EmptyResult,

    /// An external service failed for every unit of work.
    #[error("service unavailable: {0}")]
    Service(String),

    #[error("export failed: {0}")]
    Export(String),
}

impl StepError {
    pub fn validation(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        StepError::Validation {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    fn mismatch(expected: StepKind, config: &StepConfig) -> Self {
        StepError::ConfigMismatch {
            expected,
            actual: config.kind(),
        }
    }
}

// ---------------------------------------------------------------------------
// Execution settings and context
// ---------------------------------------------------------------------------

/// Engine-wide execution policy, shared read-only by every step of a run.
#[derive(Debug, Clone)]
pub struct ExecutionSettings {
    pub failure_threshold: f64,
    pub fail_on_empty: bool,
    pub max_concurrency: Option<usize>,
    pub call_timeout: Duration,
    pub retry: RetryPolicy,
}

impl ExecutionSettings {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            failure_threshold: clamp_fraction(config.failure_threshold),
            fail_on_empty: config.fail_on_empty,
            max_concurrency: config.max_concurrency,
            call_timeout: Duration::from_secs(config.call_timeout_secs.max(1)),
            retry: RetryPolicy::from_config(&config.retry),
        }
    }

    /// Failure threshold for a step, preferring the step's own override.
    pub fn threshold(&self, step_override: Option<f64>) -> f64 {
        step_override
            .map(clamp_fraction)
            .unwrap_or(self.failure_threshold)
    }

    /// Worker bound for a step: step override, then engine setting, then
    /// the service's own hint.
    pub fn concurrency(&self, step_override: Option<usize>, service_hint: usize) -> usize {
        step_override
            .or(self.max_concurrency)
            .unwrap_or(service_hint)
            .max(1)
    }
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

fn clamp_fraction(value: f64) -> f64 {
    if value.is_nan() { 0.5 } else { value.clamp(0.0, 1.0) }
}

/// What an executor knows about the step it is running.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub run_id: Uuid,
    pub step_id: String,
    pub kind: StepKind,
    pub settings: Arc<ExecutionSettings>,
}

// ---------------------------------------------------------------------------
// StepExecutor
// ---------------------------------------------------------------------------

/// One executor per step kind.
pub trait StepExecutor: Send + Sync {
    fn kind(&self) -> StepKind;

    /// Check the previous step's output before any work starts.
    fn validate_input(&self, input: Option<&DataContainer>) -> Result<(), StepError>;

    fn execute<'a>(
        &'a self,
        ctx: &'a StepContext,
        config: &'a StepConfig,
        input: Option<&'a DataContainer>,
    ) -> Pin<Box<dyn Future<Output = Result<DataContainer, StepError>> + Send + 'a>>;
}

/// Shared validation: a step that transforms data needs a previous output.
fn require_input(input: Option<&DataContainer>) -> Result<&DataContainer, StepError> {
    input.ok_or_else(|| StepError::validation("the output of a previous step", "no input"))
}

// ---------------------------------------------------------------------------
// Services + registry
// ---------------------------------------------------------------------------

/// External collaborators shared by the executors.
#[derive(Clone)]
pub struct Services {
    pub documents: Arc<dyn DocumentSourceDyn>,
    pub analysis: Arc<dyn AnalysisServiceDyn>,
    pub export: Arc<dyn ExportSinkDyn>,
}

impl Services {
    pub fn new<D, A, E>(documents: D, analysis: A, export: E) -> Self
    where
        D: DocumentSource + 'static,
        A: AnalysisService + 'static,
        E: ExportSink + 'static,
    {
        Self {
            documents: Arc::new(documents),
            analysis: Arc::new(analysis),
            export: Arc::new(export),
        }
    }
}

/// Step kind -> executor table.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<StepKind, Arc<dyn StepExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the eight built-in executors.
    pub fn standard(services: &Services) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(input::InputExecutor::new(services.documents.clone())));
        registry.register(Arc::new(primary::PrimaryAnalysisExecutor::new(services.analysis.clone())));
        registry.register(Arc::new(secondary::SecondaryAnalysisExecutor::new(services.analysis.clone())));
        registry.register(Arc::new(lens::LensExecutor::new(services.analysis.clone())));
        registry.register(Arc::new(custom_prompt::CustomPromptExecutor::new(services.analysis.clone())));
        registry.register(Arc::new(filter::FilterExecutor));
        registry.register(Arc::new(aggregate::AggregateExecutor::new(services.analysis.clone())));
        registry.register(Arc::new(export::ExportExecutor::new(services.export.clone())));
        registry
    }

    /// Register (or replace) the executor for its kind.
    pub fn register(&mut self, executor: Arc<dyn StepExecutor>) {
        self.executors.insert(executor.kind(), executor);
    }

    pub fn get(&self, kind: StepKind) -> Option<Arc<dyn StepExecutor>> {
        self.executors.get(&kind).cloned()
    }

    pub fn contains(&self, kind: StepKind) -> bool {
        self.executors.contains_key(&kind)
    }
}
