//! Composition root.
//!
//! `App` pins the generic `WorkflowService` to the concrete adapters in this
//! crate: SQLite persistence, filesystem documents and exports, and the HTTP
//! analysis client. Embedders call [`bootstrap`] once at startup, or
//! [`App::open`] when tracing is already set up.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use gridflow_core::service::workflow::WorkflowService;
use gridflow_core::workflow::steps::{ExecutorRegistry, Services};
use gridflow_types::config::GridflowConfig;

use crate::analysis::HttpAnalysisService;
use crate::config::{load_config, resolve_data_dir, resolve_dir};
use crate::document::FsDocumentSource;
use crate::export::FsExportSink;
use crate::sqlite::pool::DatabasePool;
use crate::sqlite::workflow::SqliteWorkflowRepository;

/// The workflow service pinned to SQLite storage.
pub type SqliteWorkflowService = WorkflowService<SqliteWorkflowRepository>;

/// Wired application state.
#[derive(Clone)]
pub struct App {
    pub data_dir: PathBuf,
    pub config: GridflowConfig,
    pub db_pool: DatabasePool,
    pub workflows: Arc<SqliteWorkflowService>,
}

/// Resolve the data directory, load its config, install tracing, and open
/// the application.
pub async fn bootstrap() -> anyhow::Result<App> {
    let data_dir = resolve_data_dir();
    tokio::fs::create_dir_all(&data_dir)
        .await
        .with_context(|| format!("failed to create data directory {}", data_dir.display()))?;

    let config = load_config(&data_dir).await;
    gridflow_observe::tracing_setup::init_tracing(&config.logging)
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    App::open(data_dir, config).await
}

impl App {
    /// Open the database under `data_dir` and wire the default adapters.
    pub async fn open(data_dir: PathBuf, config: GridflowConfig) -> anyhow::Result<Self> {
        let analysis = HttpAnalysisService::new(
            &config.analysis,
            Duration::from_secs(config.engine.call_timeout_secs.max(1)),
        );
        let services = Services::new(
            FsDocumentSource::new(resolve_dir(&data_dir, &config.documents.dir)),
            analysis,
            FsExportSink::new(resolve_dir(&data_dir, &config.export.dir)),
        );
        Self::open_with_services(data_dir, config, services).await
    }

    /// Open with caller-supplied adapters.
    ///
    /// Runs left `running` by an engine that stopped heartbeating are parked
    /// as `paused` before the service is handed out.
    pub async fn open_with_services(
        data_dir: PathBuf,
        config: GridflowConfig,
        services: Services,
    ) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("failed to create data directory {}", data_dir.display()))?;

        let db_pool = DatabasePool::open_in(&data_dir)
            .await
            .with_context(|| format!("failed to open database in {}", data_dir.display()))?;

        let repo = SqliteWorkflowRepository::new(db_pool.clone());
        let registry = ExecutorRegistry::standard(&services);
        let workflows = WorkflowService::new(repo, registry, &config.engine);

        let recovered = workflows
            .recover_stale_runs()
            .await
            .context("failed to recover stale workflow runs")?;
        if !recovered.is_empty() {
            tracing::warn!(count = recovered.len(), "paused stale workflow runs");
        }

        tracing::info!(data_dir = %data_dir.display(), "gridflow ready");
        Ok(Self {
            data_dir,
            config,
            db_pool,
            workflows: Arc::new(workflows),
        })
    }
}
