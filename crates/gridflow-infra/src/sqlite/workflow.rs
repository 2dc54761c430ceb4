//! SQLite workflow repository implementation.
//!
//! Implements `WorkflowRepository` from `gridflow-core` using sqlx with split
//! read/write pools. Definitions, run snapshots, error lists and step outputs
//! are stored as JSON text. Timestamps are fixed-width RFC 3339 (microsecond
//! precision, `Z` suffix) so that lease staleness can be compared in SQL.

use chrono::{DateTime, SecondsFormat, Utc};
use gridflow_core::repository::workflow::WorkflowRepository;
use gridflow_types::container::DataContainer;
use gridflow_types::error::RepositoryError;
use gridflow_types::workflow::{
    LogLevel, RunControl, RunError, RunStatus, StepLogEntry, WorkflowDefinition, WorkflowRun,
};
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `WorkflowRepository`.
#[derive(Clone)]
pub struct SqliteWorkflowRepository {
    pool: DatabasePool,
}

impl SqliteWorkflowRepository {
    /// Create a new repository backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    async fn run_exists(&self, run_id: &Uuid) -> Result<bool, RepositoryError> {
        let row = sqlx::query("SELECT 1 FROM workflow_runs WHERE id = ?")
            .bind(run_id.to_string())
            .fetch_optional(&self.pool.writer)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        Ok(row.is_some())
    }

    /// Why a lease-guarded write matched no row.
    async fn guard_failure(&self, run_id: &Uuid) -> RepositoryError {
        match self.run_exists(run_id).await {
            Ok(true) => RepositoryError::LeaseLost,
            Ok(false) => RepositoryError::NotFound,
            Err(e) => e,
        }
    }
}

/// Progress write guarded by the lease holder; `IS` lets a NULL owner match
/// an unleased run.
const UPDATE_PROGRESS_SQL: &str = r#"UPDATE workflow_runs SET
       status = ?1,
       current_step_index = ?2,
       last_successful_step_id = ?3,
       errors = ?4,
       started_at = ?5,
       completed_at = ?6
     WHERE id = ?7 AND lease_owner IS ?8"#;

const RUN_COLUMNS: &str = "id, workflow_id, workflow_name, definition, status, current_step_index, \
     total_steps, last_successful_step_id, errors, control, lease_owner, heartbeat_at, \
     created_at, started_at, completed_at";

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct WorkflowDefRow {
    id: String,
    definition: String,
}

impl WorkflowDefRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            definition: row.try_get("definition")?,
        })
    }

    fn into_definition(self) -> Result<WorkflowDefinition, RepositoryError> {
        let mut def: WorkflowDefinition = serde_json::from_str(&self.definition)
            .map_err(|e| RepositoryError::Query(format!("invalid workflow definition JSON: {e}")))?;
        // The column is authoritative; the JSON copy may predate an id reassignment.
        def.id = parse_uuid(&self.id)?;
        Ok(def)
    }
}

struct WorkflowRunRow {
    id: String,
    workflow_id: String,
    workflow_name: String,
    definition: String,
    status: String,
    current_step_index: i64,
    total_steps: i64,
    last_successful_step_id: Option<String>,
    errors: String,
    control: Option<String>,
    lease_owner: Option<String>,
    heartbeat_at: Option<String>,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
}

impl WorkflowRunRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            workflow_id: row.try_get("workflow_id")?,
            workflow_name: row.try_get("workflow_name")?,
            definition: row.try_get("definition")?,
            status: row.try_get("status")?,
            current_step_index: row.try_get("current_step_index")?,
            total_steps: row.try_get("total_steps")?,
            last_successful_step_id: row.try_get("last_successful_step_id")?,
            errors: row.try_get("errors")?,
            control: row.try_get("control")?,
            lease_owner: row.try_get("lease_owner")?,
            heartbeat_at: row.try_get("heartbeat_at")?,
            created_at: row.try_get("created_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }

    fn into_run(self) -> Result<WorkflowRun, RepositoryError> {
        let status: RunStatus = parse_tag(&self.status, "run status")?;
        let control: Option<RunControl> = self
            .control
            .as_deref()
            .map(|c| parse_tag(c, "run control"))
            .transpose()?;

        let definition: WorkflowDefinition = serde_json::from_str(&self.definition)
            .map_err(|e| RepositoryError::Query(format!("invalid run definition JSON: {e}")))?;
        let errors: Vec<RunError> = serde_json::from_str(&self.errors)
            .map_err(|e| RepositoryError::Query(format!("invalid run errors JSON: {e}")))?;

        Ok(WorkflowRun {
            id: parse_uuid(&self.id)?,
            workflow_id: parse_uuid(&self.workflow_id)?,
            workflow_name: self.workflow_name,
            definition,
            status,
            current_step_index: parse_count(self.current_step_index)?,
            total_steps: parse_count(self.total_steps)?,
            last_successful_step_id: self.last_successful_step_id,
            created_at: parse_datetime(&self.created_at)?,
            started_at: self.started_at.as_deref().map(parse_datetime).transpose()?,
            completed_at: self.completed_at.as_deref().map(parse_datetime).transpose()?,
            errors,
            control,
            lease_owner: self.lease_owner.as_deref().map(parse_uuid).transpose()?,
            heartbeat_at: self.heartbeat_at.as_deref().map(parse_datetime).transpose()?,
        })
    }
}

struct StepLogRow {
    run_id: String,
    step_id: String,
    level: String,
    message: String,
    created_at: String,
}

impl StepLogRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            run_id: row.try_get("run_id")?,
            step_id: row.try_get("step_id")?,
            level: row.try_get("level")?,
            message: row.try_get("message")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_entry(self) -> Result<StepLogEntry, RepositoryError> {
        Ok(StepLogEntry {
            run_id: parse_uuid(&self.run_id)?,
            step_id: self.step_id,
            level: parse_tag::<LogLevel>(&self.level, "log level")?,
            message: self.message,
            created_at: parse_datetime(&self.created_at)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_count(n: i64) -> Result<usize, RepositoryError> {
    usize::try_from(n).map_err(|_| RepositoryError::Query(format!("invalid step count: {n}")))
}

/// Decode a snake_case enum stored as its serde tag.
fn parse_tag<T: serde::de::DeserializeOwned>(s: &str, what: &str) -> Result<T, RepositoryError> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|_| RepositoryError::Query(format!("invalid {what}: {s}")))
}

/// Encode a snake_case enum as its serde tag.
fn tag_of<T: serde::Serialize>(value: &T) -> Result<String, RepositoryError> {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(s)) => Ok(s),
        Ok(other) => Err(RepositoryError::Query(format!("expected string tag, got {other}"))),
        Err(e) => Err(RepositoryError::Query(e.to_string())),
    }
}

fn to_json<T: serde::Serialize>(value: &T, what: &str) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(|e| RepositoryError::Query(format!("serialize {what}: {e}")))
}

// ---------------------------------------------------------------------------
// WorkflowRepository impl
// ---------------------------------------------------------------------------

impl WorkflowRepository for SqliteWorkflowRepository {
    async fn save_definition(&self, def: &WorkflowDefinition) -> Result<(), RepositoryError> {
        let definition_json = to_json(def, "definition")?;
        let now = format_datetime(&Utc::now());

        sqlx::query(
            r#"INSERT INTO workflows (id, name, description, definition, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 description = excluded.description,
                 definition = excluded.definition,
                 updated_at = excluded.updated_at"#,
        )
        .bind(def.id.to_string())
        .bind(&def.name)
        .bind(&def.description)
        .bind(&definition_json)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(())
    }

    async fn get_definition(&self, id: &Uuid) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        let row = sqlx::query("SELECT id, definition FROM workflows WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => {
                let r = WorkflowDefRow::from_row(&row)
                    .map_err(|e| RepositoryError::Query(e.to_string()))?;
                Ok(Some(r.into_definition()?))
            }
            None => Ok(None),
        }
    }

    async fn list_definitions(&self) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
        let rows = sqlx::query("SELECT id, definition FROM workflows ORDER BY name ASC, id ASC")
            .fetch_all(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        rows.iter()
            .map(|row| {
                WorkflowDefRow::from_row(row)
                    .map_err(|e| RepositoryError::Query(e.to_string()))?
                    .into_definition()
            })
            .collect()
    }

    async fn delete_definition(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM workflows WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    async fn create_run(&self, run: &WorkflowRun) -> Result<(), RepositoryError> {
        let control = run.control.as_ref().map(tag_of).transpose()?;

        sqlx::query(
            r#"INSERT INTO workflow_runs
               (id, workflow_id, workflow_name, definition, status, current_step_index,
                total_steps, last_successful_step_id, errors, control, lease_owner,
                heartbeat_at, created_at, started_at, completed_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(run.id.to_string())
        .bind(run.workflow_id.to_string())
        .bind(&run.workflow_name)
        .bind(to_json(&run.definition, "run definition")?)
        .bind(run.status.as_str())
        .bind(run.current_step_index as i64)
        .bind(run.total_steps as i64)
        .bind(&run.last_successful_step_id)
        .bind(to_json(&run.errors, "run errors")?)
        .bind(&control)
        .bind(run.lease_owner.map(|o| o.to_string()))
        .bind(run.heartbeat_at.as_ref().map(format_datetime))
        .bind(format_datetime(&run.created_at))
        .bind(run.started_at.as_ref().map(format_datetime))
        .bind(run.completed_at.as_ref().map(format_datetime))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                RepositoryError::Conflict(format!("workflow run {} already exists", run.id))
            }
            _ => RepositoryError::Query(e.to_string()),
        })?;

        Ok(())
    }

    async fn update_run(&self, run: &WorkflowRun, owner: Option<&Uuid>) -> Result<(), RepositoryError> {
        let result = sqlx::query(UPDATE_PROGRESS_SQL)
            .bind(run.status.as_str())
            .bind(run.current_step_index as i64)
            .bind(&run.last_successful_step_id)
            .bind(to_json(&run.errors, "run errors")?)
            .bind(run.started_at.as_ref().map(format_datetime))
            .bind(run.completed_at.as_ref().map(format_datetime))
            .bind(run.id.to_string())
            .bind(owner.map(Uuid::to_string))
            .execute(&self.pool.writer)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(self.guard_failure(&run.id).await);
        }
        Ok(())
    }

    async fn get_run(&self, run_id: &Uuid) -> Result<Option<WorkflowRun>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {RUN_COLUMNS} FROM workflow_runs WHERE id = ?"))
            .bind(run_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => {
                let r = WorkflowRunRow::from_row(&row)
                    .map_err(|e| RepositoryError::Query(e.to_string()))?;
                Ok(Some(r.into_run()?))
            }
            None => Ok(None),
        }
    }

    async fn list_runs(&self, workflow_id: &Uuid, limit: u32) -> Result<Vec<WorkflowRun>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM workflow_runs WHERE workflow_id = ? \
             ORDER BY created_at DESC, id DESC LIMIT ?"
        ))
        .bind(workflow_id.to_string())
        .bind(i64::from(limit))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        rows.iter()
            .map(|row| {
                WorkflowRunRow::from_row(row)
                    .map_err(|e| RepositoryError::Query(e.to_string()))?
                    .into_run()
            })
            .collect()
    }

    async fn set_control(&self, run_id: &Uuid, control: Option<RunControl>) -> Result<(), RepositoryError> {
        let control = control.as_ref().map(tag_of).transpose()?;

        let result = sqlx::query("UPDATE workflow_runs SET control = ? WHERE id = ?")
            .bind(&control)
            .bind(run_id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Lease
    // -----------------------------------------------------------------------

    async fn acquire_lease(
        &self,
        run_id: &Uuid,
        owner: &Uuid,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        // Single conditional UPDATE: the writer connection serializes
        // competing engines, and only one of them can match the predicate.
        let result = sqlx::query(
            r#"UPDATE workflow_runs SET lease_owner = ?1, heartbeat_at = ?2
               WHERE id = ?3
                 AND (lease_owner IS NULL
                      OR lease_owner = ?1
                      OR heartbeat_at IS NULL
                      OR heartbeat_at < ?4)"#,
        )
        .bind(owner.to_string())
        .bind(format_datetime(&now))
        .bind(run_id.to_string())
        .bind(format_datetime(&stale_before))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        if !self.run_exists(run_id).await? {
            return Err(RepositoryError::NotFound);
        }
        Ok(false)
    }

    async fn renew_lease(&self, run_id: &Uuid, owner: &Uuid, now: DateTime<Utc>) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "UPDATE workflow_runs SET heartbeat_at = ? WHERE id = ? AND lease_owner = ?",
        )
        .bind(format_datetime(&now))
        .bind(run_id.to_string())
        .bind(owner.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn release_lease(&self, run_id: &Uuid, owner: &Uuid) -> Result<(), RepositoryError> {
        sqlx::query(
            "UPDATE workflow_runs SET lease_owner = NULL, heartbeat_at = NULL WHERE id = ? AND lease_owner = ?",
        )
        .bind(run_id.to_string())
        .bind(owner.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(())
    }

    async fn list_stale_runs(&self, stale_before: DateTime<Utc>) -> Result<Vec<WorkflowRun>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM workflow_runs \
             WHERE status = 'running' AND (heartbeat_at IS NULL OR heartbeat_at < ?) \
             ORDER BY created_at ASC"
        ))
        .bind(format_datetime(&stale_before))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        rows.iter()
            .map(|row| {
                WorkflowRunRow::from_row(row)
                    .map_err(|e| RepositoryError::Query(e.to_string()))?
                    .into_run()
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Step outputs
    // -----------------------------------------------------------------------

    async fn commit_step(
        &self,
        run: &WorkflowRun,
        owner: &Uuid,
        step_id: &str,
        output: &DataContainer,
    ) -> Result<(), RepositoryError> {
        let output_json = to_json(output, "step output")?;
        let now = format_datetime(&Utc::now());

        let mut tx = self
            .pool
            .writer
            .begin()
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        sqlx::query(
            r#"INSERT INTO workflow_step_outputs (run_id, step_id, output, item_count, created_at)
               VALUES (?, ?, ?, ?, ?)
               ON CONFLICT(run_id, step_id) DO UPDATE SET
                 output = excluded.output,
                 item_count = excluded.item_count,
                 created_at = excluded.created_at"#,
        )
        .bind(run.id.to_string())
        .bind(step_id)
        .bind(&output_json)
        .bind(output.total_items() as i64)
        .bind(&now)
        .execute(&mut *tx)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let result = sqlx::query(UPDATE_PROGRESS_SQL)
            .bind(run.status.as_str())
            .bind(run.current_step_index as i64)
            .bind(&run.last_successful_step_id)
            .bind(to_json(&run.errors, "run errors")?)
            .bind(run.started_at.as_ref().map(format_datetime))
            .bind(run.completed_at.as_ref().map(format_datetime))
            .bind(run.id.to_string())
            .bind(owner.to_string())
            .execute(&mut *tx)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            // Undo the output row before the writer connection is reused.
            tx.rollback()
                .await
                .map_err(|e| RepositoryError::Query(e.to_string()))?;
            return Err(self.guard_failure(&run.id).await);
        }

        tx.commit()
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        Ok(())
    }

    async fn get_step_output(&self, run_id: &Uuid, step_id: &str) -> Result<Option<DataContainer>, RepositoryError> {
        let row = sqlx::query("SELECT output FROM workflow_step_outputs WHERE run_id = ? AND step_id = ?")
            .bind(run_id.to_string())
            .bind(step_id)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => {
                let json: String = row
                    .try_get("output")
                    .map_err(|e| RepositoryError::Query(e.to_string()))?;
                let output = serde_json::from_str(&json)
                    .map_err(|e| RepositoryError::Query(format!("invalid step output JSON: {e}")))?;
                Ok(Some(output))
            }
            None => Ok(None),
        }
    }

    // -----------------------------------------------------------------------
    // Step logs
    // -----------------------------------------------------------------------

    async fn append_step_logs(&self, entries: &[StepLogEntry]) -> Result<(), RepositoryError> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut tx = self
            .pool
            .writer
            .begin()
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        for entry in entries {
            sqlx::query(
                r#"INSERT INTO workflow_step_logs (run_id, step_id, level, message, created_at)
                   VALUES (?, ?, ?, ?, ?)"#,
            )
            .bind(entry.run_id.to_string())
            .bind(&entry.step_id)
            .bind(tag_of(&entry.level)?)
            .bind(&entry.message)
            .bind(format_datetime(&entry.created_at))
            .execute(&mut *tx)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        Ok(())
    }

    async fn list_step_logs(&self, run_id: &Uuid, step_id: Option<&str>) -> Result<Vec<StepLogEntry>, RepositoryError> {
        let rows = match step_id {
            Some(step_id) => sqlx::query(
                "SELECT run_id, step_id, level, message, created_at FROM workflow_step_logs \
                 WHERE run_id = ? AND step_id = ? ORDER BY id ASC",
            )
            .bind(run_id.to_string())
            .bind(step_id)
            .fetch_all(&self.pool.reader)
            .await,
            None => sqlx::query(
                "SELECT run_id, step_id, level, message, created_at FROM workflow_step_logs \
                 WHERE run_id = ? ORDER BY id ASC",
            )
            .bind(run_id.to_string())
            .fetch_all(&self.pool.reader)
            .await,
        }
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        rows.iter()
            .map(|row| {
                StepLogRow::from_row(row)
                    .map_err(|e| RepositoryError::Query(e.to_string()))?
                    .into_entry()
            })
            .collect()
    }
}
