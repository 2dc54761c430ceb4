//! In-memory doubles for the repository and service ports, shared by the
//! unit tests of this crate.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use gridflow_types::config::EngineConfig;
use gridflow_types::container::DataContainer;
use gridflow_types::error::RepositoryError;
use gridflow_types::payload::{AnalysisResult, DocumentRef};
use gridflow_types::period::Period;
use gridflow_types::step::StepKind;
use gridflow_types::workflow::{
    RunControl, RunStatus, StepLogEntry, WorkflowDefinition, WorkflowRun,
};
use serde_json::json;
use uuid::Uuid;

use crate::provider::analysis::{AnalysisError, AnalysisInput, AnalysisKey, AnalysisRequest, AnalysisService};
use crate::provider::document::{DocumentError, DocumentSource};
use crate::provider::export::{ExportError, ExportSink};
use crate::repository::workflow::WorkflowRepository;
use crate::workflow::retry::RetryPolicy;
use crate::workflow::steps::{ExecutionSettings, Services, StepContext};

fn cell_key(entity: &str, period: &Period) -> String {
    format!("{entity}|{period}")
}

// ---------------------------------------------------------------------------
// Documents
// ---------------------------------------------------------------------------

/// Every document exists except the ones marked missing.
#[derive(Clone, Default)]
pub struct StaticDocuments {
    missing: Arc<Mutex<HashSet<String>>>,
    fetches: Arc<AtomicUsize>,
    delay: Duration,
}

impl StaticDocuments {
    /// Sleep this long inside every fetch.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_missing(self, entity: &str, period: Period) -> Self {
        self.missing.lock().unwrap().insert(cell_key(entity, &period));
        self
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl DocumentSource for StaticDocuments {
    async fn fetch(
        &self,
        entity: &str,
        period: &Period,
        kind: &str,
    ) -> Result<Option<DocumentRef>, DocumentError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.missing.lock().unwrap().contains(&cell_key(entity, period)) {
            return Ok(None);
        }
        Ok(Some(DocumentRef {
            entity: entity.to_string(),
            period: period.clone(),
            kind: kind.to_string(),
            uri: format!("mem://{entity}/{period}/{kind}"),
            checksum: None,
        }))
    }
}

// ---------------------------------------------------------------------------
// Analysis
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Script {
    fatal: Mutex<HashSet<String>>,
    transient: Mutex<HashMap<String, u32>>,
    scores: Mutex<HashMap<String, f64>>,
    cache: Mutex<HashMap<String, AnalysisResult>>,
    fail_all: AtomicBool,
    cache_disabled: AtomicBool,
    analyze_calls: AtomicUsize,
    cache_hits: AtomicUsize,
}

/// Deterministic analysis backend with scripted failures and a result cache.
#[derive(Clone, Default)]
pub struct ScriptedAnalysis {
    script: Arc<Script>,
}

impl ScriptedAnalysis {
    /// Fail every call for the cell (or, with `entity|period|variant`, one lens).
    pub fn fail_fatally(&self, entity: &str, period: Period) -> &Self {
        self.script.fatal.lock().unwrap().insert(cell_key(entity, &period));
        self
    }

    pub fn fail_variant(&self, entity: &str, period: Period, variant: &str) -> &Self {
        self.script
            .fatal
            .lock()
            .unwrap()
            .insert(format!("{}|{variant}", cell_key(entity, &period)));
        self
    }

    pub fn fail_transiently(&self, entity: &str, period: Period, times: u32) -> &Self {
        self.script
            .transient
            .lock()
            .unwrap()
            .insert(cell_key(entity, &period), times);
        self
    }

    pub fn set_score(&self, entity: &str, period: Period, score: f64) -> &Self {
        self.script
            .scores
            .lock()
            .unwrap()
            .insert(cell_key(entity, &period), score);
        self
    }

    /// Forget every scripted fatal and transient failure.
    pub fn clear_failures(&self) {
        self.script.fatal.lock().unwrap().clear();
        self.script.transient.lock().unwrap().clear();
    }

    pub fn set_fail_all(&self, fail: bool) {
        self.script.fail_all.store(fail, Ordering::SeqCst);
    }

    pub fn disable_cache(&self) {
        self.script.cache_disabled.store(true, Ordering::SeqCst);
    }

    pub fn analyze_calls(&self) -> usize {
        self.script.analyze_calls.load(Ordering::SeqCst)
    }

    pub fn cache_hits(&self) -> usize {
        self.script.cache_hits.load(Ordering::SeqCst)
    }

    fn result_for(&self, request: &AnalysisRequest) -> AnalysisResult {
        let key = &request.key;
        let score = self
            .script
            .scores
            .lock()
            .unwrap()
            .get(&cell_key(&key.entity, &key.period))
            .copied()
            .unwrap_or(100.0);
        let detail = match &request.input {
            AnalysisInput::Document { document } => json!({ "document": document.uri }),
            AnalysisInput::Documents { documents } => json!({ "documents": documents.len() }),
            AnalysisInput::Payloads { items } => json!({ "members": items.len() }),
            AnalysisInput::Prompt { text } => json!({ "prompt": text }),
        };
        AnalysisResult {
            result_type: key.analysis_kind.clone(),
            run_id: format!(
                "ar-{}-{}-{}-{}",
                key.entity,
                key.period,
                key.analysis_kind,
                key.variant.as_deref().unwrap_or("base")
            ),
            data: json!({
                "entity": key.entity,
                "period": key.period.to_string(),
                "score": score,
                "detail": detail,
            }),
        }
    }
}

impl AnalysisService for ScriptedAnalysis {
    async fn find_existing(&self, key: &AnalysisKey) -> Result<Option<AnalysisResult>, AnalysisError> {
        if self.script.cache_disabled.load(Ordering::SeqCst) {
            return Ok(None);
        }
        let hit = self.script.cache.lock().unwrap().get(&key.fingerprint()).cloned();
        if hit.is_some() {
            self.script.cache_hits.fetch_add(1, Ordering::SeqCst);
        }
        Ok(hit)
    }

    async fn analyze(&self, request: &AnalysisRequest) -> Result<AnalysisResult, AnalysisError> {
        self.script.analyze_calls.fetch_add(1, Ordering::SeqCst);
        let key = &request.key;
        let cell = cell_key(&key.entity, &key.period);

        if self.script.fail_all.load(Ordering::SeqCst) {
            return Err(AnalysisError::Fatal("service disabled".into()));
        }
        {
            let fatal = self.script.fatal.lock().unwrap();
            let variant = key.variant.as_deref().map(|v| format!("{cell}|{v}"));
            if fatal.contains(&cell) || variant.is_some_and(|v| fatal.contains(&v)) {
                return Err(AnalysisError::Fatal(format!("cannot analyze {cell}")));
            }
        }
        {
            let mut transient = self.script.transient.lock().unwrap();
            if let Some(remaining) = transient.get_mut(&cell) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(AnalysisError::Transient(format!("rate limited on {cell}")));
                }
            }
        }

        let result = self.result_for(request);
        self.script
            .cache
            .lock()
            .unwrap()
            .insert(key.fingerprint(), result.clone());
        Ok(result)
    }

    fn concurrency_hint(&self) -> usize {
        4
    }
}

// ---------------------------------------------------------------------------
// Export
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
pub struct MemoryExportSink {
    files: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
}

impl MemoryExportSink {
    pub fn files(&self) -> Vec<(String, Vec<u8>)> {
        self.files.lock().unwrap().clone()
    }
}

impl ExportSink for MemoryExportSink {
    async fn write(&self, file_name: &str, contents: &[u8]) -> Result<String, ExportError> {
        self.files
            .lock()
            .unwrap()
            .push((file_name.to_string(), contents.to_vec()));
        Ok(format!("mem://exports/{file_name}"))
    }
}

// ---------------------------------------------------------------------------
// Repository
// ---------------------------------------------------------------------------

#[derive(Default)]
struct RepoState {
    definitions: Vec<WorkflowDefinition>,
    runs: HashMap<Uuid, WorkflowRun>,
    outputs: HashMap<(Uuid, String), DataContainer>,
    logs: Vec<StepLogEntry>,
    commits: usize,
}

#[derive(Clone, Default)]
pub struct MockWorkflowRepository {
    state: Arc<Mutex<RepoState>>,
}

impl MockWorkflowRepository {
    pub fn commits(&self) -> usize {
        self.state.lock().unwrap().commits
    }

    pub fn output_count(&self, run_id: &Uuid) -> usize {
        self.state
            .lock()
            .unwrap()
            .outputs
            .keys()
            .filter(|(id, _)| id == run_id)
            .count()
    }

    /// Overwrite lease fields directly, e.g. to simulate a crashed engine.
    pub fn force_lease(&self, run_id: &Uuid, owner: Option<Uuid>, heartbeat_at: Option<DateTime<Utc>>) {
        if let Some(run) = self.state.lock().unwrap().runs.get_mut(run_id) {
            run.lease_owner = owner;
            run.heartbeat_at = heartbeat_at;
        }
    }

    pub fn force_status(&self, run_id: &Uuid, status: RunStatus) {
        if let Some(run) = self.state.lock().unwrap().runs.get_mut(run_id) {
            run.status = status;
        }
    }
}

fn store_progress(stored: &mut WorkflowRun, run: &WorkflowRun) {
    stored.status = run.status;
    stored.current_step_index = run.current_step_index;
    stored.last_successful_step_id = run.last_successful_step_id.clone();
    stored.started_at = run.started_at;
    stored.completed_at = run.completed_at;
    stored.errors = run.errors.clone();
}

impl WorkflowRepository for MockWorkflowRepository {
    async fn save_definition(&self, def: &WorkflowDefinition) -> Result<(), RepositoryError> {
        let mut state = self.state.lock().unwrap();
        state.definitions.retain(|d| d.id != def.id);
        state.definitions.push(def.clone());
        Ok(())
    }

    async fn get_definition(&self, id: &Uuid) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        let state = self.state.lock().unwrap();
        Ok(state.definitions.iter().find(|d| d.id == *id).cloned())
    }

    async fn list_definitions(&self) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
        let mut defs = self.state.lock().unwrap().definitions.clone();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(defs)
    }

    async fn delete_definition(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        let mut state = self.state.lock().unwrap();
        let before = state.definitions.len();
        state.definitions.retain(|d| d.id != *id);
        Ok(state.definitions.len() != before)
    }

    async fn create_run(&self, run: &WorkflowRun) -> Result<(), RepositoryError> {
        let mut state = self.state.lock().unwrap();
        if state.runs.contains_key(&run.id) {
            return Err(RepositoryError::Conflict(format!("run {} exists", run.id)));
        }
        state.runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn update_run(&self, run: &WorkflowRun, owner: Option<&Uuid>) -> Result<(), RepositoryError> {
        let mut state = self.state.lock().unwrap();
        let stored = state.runs.get_mut(&run.id).ok_or(RepositoryError::NotFound)?;
        if stored.lease_owner.as_ref() != owner {
            return Err(RepositoryError::LeaseLost);
        }
        store_progress(stored, run);
        Ok(())
    }

    async fn get_run(&self, run_id: &Uuid) -> Result<Option<WorkflowRun>, RepositoryError> {
        Ok(self.state.lock().unwrap().runs.get(run_id).cloned())
    }

    async fn list_runs(&self, workflow_id: &Uuid, limit: u32) -> Result<Vec<WorkflowRun>, RepositoryError> {
        let state = self.state.lock().unwrap();
        let mut runs: Vec<WorkflowRun> = state
            .runs
            .values()
            .filter(|r| r.workflow_id == *workflow_id)
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.id.cmp(&a.id));
        runs.truncate(limit as usize);
        Ok(runs)
    }

    async fn set_control(&self, run_id: &Uuid, control: Option<RunControl>) -> Result<(), RepositoryError> {
        let mut state = self.state.lock().unwrap();
        let run = state.runs.get_mut(run_id).ok_or(RepositoryError::NotFound)?;
        run.control = control;
        Ok(())
    }

    async fn acquire_lease(
        &self,
        run_id: &Uuid,
        owner: &Uuid,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let mut state = self.state.lock().unwrap();
        let run = state.runs.get_mut(run_id).ok_or(RepositoryError::NotFound)?;
        let free = match (run.lease_owner, run.heartbeat_at) {
            (None, _) => true,
            (Some(holder), _) if holder == *owner => true,
            (Some(_), None) => true,
            (Some(_), Some(beat)) => beat < stale_before,
        };
        if free {
            run.lease_owner = Some(*owner);
            run.heartbeat_at = Some(now);
        }
        Ok(free)
    }

    async fn renew_lease(&self, run_id: &Uuid, owner: &Uuid, now: DateTime<Utc>) -> Result<bool, RepositoryError> {
        let mut state = self.state.lock().unwrap();
        let run = state.runs.get_mut(run_id).ok_or(RepositoryError::NotFound)?;
        if run.lease_owner == Some(*owner) {
            run.heartbeat_at = Some(now);
            return Ok(true);
        }
        Ok(false)
    }

    async fn release_lease(&self, run_id: &Uuid, owner: &Uuid) -> Result<(), RepositoryError> {
        let mut state = self.state.lock().unwrap();
        if let Some(run) = state.runs.get_mut(run_id) {
            if run.lease_owner == Some(*owner) {
                run.lease_owner = None;
                run.heartbeat_at = None;
            }
        }
        Ok(())
    }

    async fn list_stale_runs(&self, stale_before: DateTime<Utc>) -> Result<Vec<WorkflowRun>, RepositoryError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .runs
            .values()
            .filter(|r| r.status == RunStatus::Running)
            .filter(|r| r.heartbeat_at.is_none_or(|beat| beat < stale_before))
            .cloned()
            .collect())
    }

    async fn commit_step(
        &self,
        run: &WorkflowRun,
        owner: &Uuid,
        step_id: &str,
        output: &DataContainer,
    ) -> Result<(), RepositoryError> {
        let mut state = self.state.lock().unwrap();
        let stored = state.runs.get_mut(&run.id).ok_or(RepositoryError::NotFound)?;
        if stored.lease_owner != Some(*owner) {
            return Err(RepositoryError::LeaseLost);
        }
        store_progress(stored, run);
        state.outputs.insert((run.id, step_id.to_string()), output.clone());
        state.commits += 1;
        Ok(())
    }

    async fn get_step_output(&self, run_id: &Uuid, step_id: &str) -> Result<Option<DataContainer>, RepositoryError> {
        let state = self.state.lock().unwrap();
        Ok(state.outputs.get(&(*run_id, step_id.to_string())).cloned())
    }

    async fn append_step_logs(&self, entries: &[StepLogEntry]) -> Result<(), RepositoryError> {
        self.state.lock().unwrap().logs.extend_from_slice(entries);
        Ok(())
    }

    async fn list_step_logs(&self, run_id: &Uuid, step_id: Option<&str>) -> Result<Vec<StepLogEntry>, RepositoryError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .logs
            .iter()
            .filter(|e| e.run_id == *run_id)
            .filter(|e| step_id.is_none_or(|id| e.step_id == id))
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Engine config with millisecond backoffs so retry tests stay fast.
pub fn fast_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.retry.initial_backoff_ms = 1;
    config.retry.max_backoff_ms = 2;
    config.call_timeout_secs = 5;
    config
}

pub fn fast_settings() -> ExecutionSettings {
    let mut settings = ExecutionSettings::from_config(&fast_config());
    settings.retry = RetryPolicy {
        max_attempts: 3,
        initial_backoff: Duration::from_millis(1),
        multiplier: 1.0,
        max_backoff: Duration::from_millis(1),
    };
    settings
}

pub fn step_context(step_id: &str, kind: StepKind) -> StepContext {
    StepContext {
        run_id: Uuid::now_v7(),
        step_id: step_id.to_string(),
        kind,
        settings: Arc::new(fast_settings()),
    }
}

pub fn services(documents: StaticDocuments, analysis: ScriptedAnalysis, export: MemoryExportSink) -> Services {
    Services::new(documents, analysis, export)
}

/// A grid of document placeholders, as the Input step would produce.
pub fn document_grid(entities: &[&str], years: &[i32]) -> DataContainer {
    let mut c = DataContainer::new("load", StepKind::Input.as_str());
    for entity in entities {
        for year in years {
            let period = Period::Year(*year);
            c.insert_cell(
                *entity,
                period.clone(),
                gridflow_types::container::Cell {
                    payload: None,
                    document: Some(DocumentRef {
                        entity: entity.to_string(),
                        period,
                        kind: "annual_report".into(),
                        uri: format!("mem://{entity}/{year}/annual_report"),
                        checksum: None,
                    }),
                },
            );
        }
    }
    c
}
