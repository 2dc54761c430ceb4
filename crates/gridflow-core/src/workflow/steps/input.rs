//! Input executor: resolves the requested entity × period documents.
//!
//! The output grid always has every requested address. Resolved documents
//! are attached to placeholder cells, so the step contributes zero items and
//! its shape is `(entities, periods)` even when some documents are missing.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{Datelike, Utc};
use gridflow_types::container::{Cell, DataContainer, Warning};
use gridflow_types::payload::DocumentRef;
use gridflow_types::period::Period;
use gridflow_types::step::{InputConfig, StepConfig, StepKind};

use crate::provider::analysis::DEFAULT_CONCURRENCY;
use crate::provider::document::DocumentSourceDyn;
use crate::workflow::pool::run_bounded;
use crate::workflow::retry::{CallFailure, call_with_retry};

use super::{StepContext, StepError, StepExecutor};

pub struct InputExecutor {
    documents: Arc<dyn DocumentSourceDyn>,
}

impl InputExecutor {
    pub fn new(documents: Arc<dyn DocumentSourceDyn>) -> Self {
        Self { documents }
    }

    async fn load(&self, ctx: &StepContext, cfg: &InputConfig) -> Result<DataContainer, StepError> {
        let mut entities: Vec<String> = Vec::with_capacity(cfg.entities.len());
        for entity in &cfg.entities {
            let entity = entity.trim();
            if !entity.is_empty() && !entities.iter().any(|e| e == entity) {
                entities.push(entity.to_string());
            }
        }
        if entities.is_empty() {
            return Err(StepError::InvalidConfig("input step needs at least one entity".into()));
        }
        let periods = cfg.periods.resolve(Utc::now().year());
        if periods.is_empty() {
            return Err(StepError::InvalidConfig("input step resolved no periods".into()));
        }

        let addresses: Vec<(String, Period)> = entities
            .iter()
            .flat_map(|e| periods.iter().map(move |p| (e.clone(), p.clone())))
            .collect();

        let documents = self.documents.clone();
        let settings = ctx.settings.clone();
        let kind = cfg.document_kind.clone();
        let limit = ctx.settings.concurrency(cfg.concurrency, DEFAULT_CONCURRENCY);
        let fetched = run_bounded(addresses.clone(), limit, move |(entity, period): (String, Period)| {
            let documents = documents.clone();
            let settings = settings.clone();
            let kind = kind.clone();
            async move {
                call_with_retry(&settings.retry, settings.call_timeout, || {
                    documents.fetch_boxed(&entity, &period, &kind)
                })
                .await
            }
        })
        .await;

        let mut out = DataContainer::new(ctx.step_id.clone(), ctx.kind.as_str());
        let mut resolved = 0usize;
        let mut failures: Vec<String> = Vec::new();
        for ((entity, period), result) in addresses.into_iter().zip(fetched) {
            let outcome: Result<Option<DocumentRef>, String> = match result {
                Ok(Ok(doc)) => Ok(doc),
                Ok(Err(CallFailure { message, .. })) => Err(message),
                Err(message) => Err(message),
            };
            let cell = match outcome {
                Ok(Some(document)) => {
                    resolved += 1;
                    Cell {
                        payload: None,
                        document: Some(document),
                    }
                }
                Ok(None) => {
                    out.warnings.push(Warning::Missing {
                        entity: entity.clone(),
                        period: period.clone(),
                        reason: format!("no {} document", cfg.document_kind),
                    });
                    Cell::placeholder()
                }
                Err(reason) => {
                    failures.push(reason.clone());
                    tracing::warn!(
                        run_id = %ctx.run_id,
                        step_id = %ctx.step_id,
                        entity = %entity,
                        period = %period,
                        error = %reason,
                        "document fetch failed"
                    );
                    out.warnings.push(Warning::Missing {
                        entity: entity.clone(),
                        period: period.clone(),
                        reason,
                    });
                    Cell::placeholder()
                }
            };
            out.insert_cell(entity, period, cell);
        }

        if failures.len() == out.cells().count() {
            let reason = failures.swap_remove(0);
            return Err(StepError::Service(format!("every document fetch failed: {reason}")));
        }

        tracing::info!(
            run_id = %ctx.run_id,
            step_id = %ctx.step_id,
            shape = %out.shape(),
            resolved,
            missing = out.warnings.len(),
            "input documents resolved"
        );
        Ok(out)
    }
}

impl StepExecutor for InputExecutor {
    fn kind(&self) -> StepKind {
        StepKind::Input
    }

    /// Input starts a pipeline; whatever came before is ignored.
    fn validate_input(&self, _input: Option<&DataContainer>) -> Result<(), StepError> {
        Ok(())
    }

    fn execute<'a>(
        &'a self,
        ctx: &'a StepContext,
        config: &'a StepConfig,
        _input: Option<&'a DataContainer>,
    ) -> Pin<Box<dyn Future<Output = Result<DataContainer, StepError>> + Send + 'a>> {
        Box::pin(async move {
            let StepConfig::Input(cfg) = config else {
                return Err(StepError::mismatch(StepKind::Input, config));
            };
            self.load(ctx, cfg).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{StaticDocuments, step_context};
    use gridflow_types::container::Shape;
    use gridflow_types::step::PeriodSpec;

    fn config(entities: &[&str], years: &[i32]) -> StepConfig {
        StepConfig::Input(InputConfig {
            entities: entities.iter().map(|e| e.to_string()).collect(),
            periods: PeriodSpec::List(years.iter().copied().map(Period::Year).collect()),
            document_kind: "annual_report".into(),
            concurrency: None,
        })
    }

    #[tokio::test]
    async fn test_input_grid_has_requested_shape_and_no_items() {
        let executor = InputExecutor::new(Arc::new(StaticDocuments::default()));
        let ctx = step_context("load", StepKind::Input);
        let out = executor
            .execute(&ctx, &config(&["A", "B"], &[2022, 2023, 2024]), None)
            .await
            .unwrap();

        assert_eq!(out.shape(), Shape::new(2, 3));
        assert_eq!(out.total_items(), 0);
        let cell = out.get("B", &Period::Year(2023)).unwrap();
        assert_eq!(cell.source_document().unwrap().uri, "mem://B/2023/annual_report");
    }

    #[tokio::test]
    async fn test_missing_document_becomes_warning() {
        let documents = StaticDocuments::default().with_missing("A", Period::Year(2023));
        let executor = InputExecutor::new(Arc::new(documents));
        let ctx = step_context("load", StepKind::Input);
        let out = executor
            .execute(&ctx, &config(&["A"], &[2023, 2024]), None)
            .await
            .unwrap();

        assert_eq!(out.shape(), Shape::new(1, 2));
        assert!(out.get("A", &Period::Year(2023)).unwrap().source_document().is_none());
        assert!(matches!(
            out.warnings.as_slice(),
            [Warning::Missing { entity, .. }] if entity == "A"
        ));
    }

    #[tokio::test]
    async fn test_input_is_idempotent() {
        let documents = StaticDocuments::default();
        let executor = InputExecutor::new(Arc::new(documents.clone()));
        let ctx = step_context("load", StepKind::Input);
        let cfg = config(&["A", "B", "A"], &[2024]);

        let first = executor.execute(&ctx, &cfg, None).await.unwrap();
        let second = executor.execute(&ctx, &cfg, None).await.unwrap();
        assert_eq!(first.data, second.data);
        assert_eq!(first.shape(), Shape::new(2, 1));
        assert_eq!(documents.fetches(), 4);
    }

    #[derive(Default)]
    struct DownDocuments;

    impl crate::provider::document::DocumentSource for DownDocuments {
        async fn fetch(
            &self,
            _entity: &str,
            _period: &Period,
            _kind: &str,
        ) -> Result<Option<DocumentRef>, crate::provider::document::DocumentError> {
            Err(crate::provider::document::DocumentError::Invalid("store offline".into()))
        }
    }

    #[tokio::test]
    async fn test_unreachable_store_fails_step() {
        let executor = InputExecutor::new(Arc::new(DownDocuments));
        let ctx = step_context("load", StepKind::Input);
        let err = executor.execute(&ctx, &config(&["A", "B"], &[2024]), None).await.unwrap_err();
        assert!(matches!(err, StepError::Service(ref msg) if msg.contains("store offline")));
    }

    #[tokio::test]
    async fn test_empty_entity_list_is_rejected() {
        let executor = InputExecutor::new(Arc::new(StaticDocuments::default()));
        let ctx = step_context("load", StepKind::Input);
        let err = executor.execute(&ctx, &config(&[], &[2024]), None).await.unwrap_err();
        assert!(matches!(err, StepError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_wrong_config_kind() {
        let executor = InputExecutor::new(Arc::new(StaticDocuments::default()));
        let ctx = step_context("load", StepKind::Input);
        let cfg = StepConfig::Export(gridflow_types::step::ExportConfig { formats: vec![] });
        let err = executor.execute(&ctx, &cfg, None).await.unwrap_err();
        assert!(matches!(
            err,
            StepError::ConfigMismatch {
                expected: StepKind::Input,
                actual: StepKind::Export
            }
        ));
    }
}
