//! Primary analysis: one analysis call per document cell, or per entity in
//! aggregated mode.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use gridflow_types::container::{Cell, DataContainer};
use gridflow_types::payload::DocumentRef;
use gridflow_types::period::Period;
use gridflow_types::step::{PrimaryAnalysisConfig, RunMode, StepConfig, StepKind};

use crate::provider::analysis::{AnalysisInput, AnalysisKey, AnalysisRequest, AnalysisServiceDyn};

use super::work::{analyze_units, apply_outcomes, require_documents};
use super::{StepContext, StepError, StepExecutor, require_input};

pub struct PrimaryAnalysisExecutor {
    analysis: Arc<dyn AnalysisServiceDyn>,
}

impl PrimaryAnalysisExecutor {
    pub fn new(analysis: Arc<dyn AnalysisServiceDyn>) -> Self {
        Self { analysis }
    }

    async fn run(
        &self,
        ctx: &StepContext,
        cfg: &PrimaryAnalysisConfig,
        input: &DataContainer,
    ) -> Result<DataContainer, StepError> {
        let mut out = input.derive(ctx.step_id.clone(), ctx.kind.as_str());
        let mut requests = Vec::new();

        match cfg.run_mode {
            RunMode::PerItem => {
                for (entity, period, cell) in input.cells() {
                    out.insert_cell(entity, period.clone(), Cell::placeholder());
                    if let Some(document) = cell.source_document() {
                        requests.push(AnalysisRequest {
                            key: key_for(cfg, entity, period.clone(), document),
                            input: AnalysisInput::Document {
                                document: document.clone(),
                            },
                        });
                    }
                }
            }
            RunMode::Aggregated => {
                for (entity, periods) in &input.data {
                    out.insert_cell(entity.clone(), Period::All, Cell::placeholder());
                    let documents: Vec<DocumentRef> = periods
                        .values()
                        .filter_map(Cell::source_document)
                        .cloned()
                        .collect();
                    if let Some(first) = documents.first() {
                        requests.push(AnalysisRequest {
                            key: key_for(cfg, entity, Period::All, first),
                            input: AnalysisInput::Documents { documents },
                        });
                    }
                }
            }
        }

        let concurrency = ctx
            .settings
            .concurrency(cfg.concurrency, self.analysis.concurrency_hint());
        let outcomes = analyze_units(self.analysis.clone(), requests, concurrency, ctx.settings.clone()).await;
        let tally = apply_outcomes(ctx, &mut out, outcomes);
        tally.check(ctx.settings.threshold(cfg.failure_threshold))?;
        Ok(out)
    }
}

fn key_for(cfg: &PrimaryAnalysisConfig, entity: &str, period: Period, document: &DocumentRef) -> AnalysisKey {
    AnalysisKey {
        entity: entity.to_string(),
        period,
        analysis_kind: cfg.analysis_kind.clone(),
        document_kind: Some(document.kind.clone()),
        variant: cfg.prompt_variant.clone(),
        params: cfg.params.clone(),
    }
}

impl StepExecutor for PrimaryAnalysisExecutor {
    fn kind(&self) -> StepKind {
        StepKind::PrimaryAnalysis
    }

    fn validate_input(&self, input: Option<&DataContainer>) -> Result<(), StepError> {
        require_documents(input)
    }

    fn execute<'a>(
        &'a self,
        ctx: &'a StepContext,
        config: &'a StepConfig,
        input: Option<&'a DataContainer>,
    ) -> Pin<Box<dyn Future<Output = Result<DataContainer, StepError>> + Send + 'a>> {
        Box::pin(async move {
            let StepConfig::PrimaryAnalysis(cfg) = config else {
                return Err(StepError::mismatch(StepKind::PrimaryAnalysis, config));
            };
            let input = require_input(input)?;
            self.run(ctx, cfg, input).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedAnalysis, document_grid, step_context};
    use gridflow_types::container::{ItemErrorKind, Shape};
    use gridflow_types::payload::{AnalysisResult, Payload};
    use serde_json::{Value, json};

    fn config(run_mode: RunMode) -> StepConfig {
        StepConfig::PrimaryAnalysis(PrimaryAnalysisConfig {
            analysis_kind: "health".into(),
            run_mode,
            prompt_variant: None,
            failure_threshold: None,
            concurrency: Some(3),
            params: Value::Null,
        })
    }

    const TEN: [&str; 10] = ["A", "B", "C", "D", "E", "F", "G", "H", "I", "J"];

    #[tokio::test]
    async fn test_per_item_mirrors_input_grid() {
        let analysis = ScriptedAnalysis::default();
        let executor = PrimaryAnalysisExecutor::new(Arc::new(analysis.clone()));
        let ctx = step_context("score", StepKind::PrimaryAnalysis);
        let input = document_grid(&["A", "B"], &[2023, 2024]);

        let out = executor.execute(&ctx, &config(RunMode::PerItem), Some(&input)).await.unwrap();
        assert_eq!(out.shape(), Shape::new(2, 2));
        assert_eq!(out.total_items(), 4);
        assert_eq!(out.step_id, "score");
        assert_eq!(out.source_run_ids.len(), 4);
        let payload = out.get("A", &Period::Year(2024)).unwrap().payload.as_ref().unwrap();
        assert_eq!(payload.result_type(), "health");
        assert_eq!(analysis.analyze_calls(), 4);
    }

    #[tokio::test]
    async fn test_aggregated_mode_collapses_periods() {
        let executor = PrimaryAnalysisExecutor::new(Arc::new(ScriptedAnalysis::default()));
        let ctx = step_context("score", StepKind::PrimaryAnalysis);
        let input = document_grid(&["A", "B", "C"], &[2022, 2023, 2024]);

        let out = executor.execute(&ctx, &config(RunMode::Aggregated), Some(&input)).await.unwrap();
        assert_eq!(out.shape(), Shape::new(3, 1));
        let payload = out.get("C", &Period::All).unwrap().payload.as_ref().unwrap();
        assert_eq!(payload.lookup("detail.documents"), Some(json!(3)));
    }

    #[tokio::test]
    async fn test_isolated_failures_are_tolerated() {
        let analysis = ScriptedAnalysis::default();
        for entity in ["B", "E", "H"] {
            analysis.fail_fatally(entity, Period::Year(2024));
        }
        let executor = PrimaryAnalysisExecutor::new(Arc::new(analysis));
        let ctx = step_context("score", StepKind::PrimaryAnalysis);
        let input = document_grid(&TEN, &[2024]);

        let out = executor.execute(&ctx, &config(RunMode::PerItem), Some(&input)).await.unwrap();
        assert_eq!(out.shape(), Shape::new(10, 1));
        assert_eq!(out.total_items(), 7);
        assert_eq!(out.errors.len(), 3);
        assert!(out.get("E", &Period::Year(2024)).unwrap().is_nil());
        assert!(out.errors.iter().all(|e| e.kind == ItemErrorKind::Fatal && e.attempts == 1));
    }

    #[tokio::test]
    async fn test_systemic_failure_fails_step() {
        let analysis = ScriptedAnalysis::default();
        for entity in &TEN[..6] {
            analysis.fail_fatally(entity, Period::Year(2024));
        }
        let executor = PrimaryAnalysisExecutor::new(Arc::new(analysis));
        let ctx = step_context("score", StepKind::PrimaryAnalysis);
        let input = document_grid(&TEN, &[2024]);

        let err = executor
            .execute(&ctx, &config(RunMode::PerItem), Some(&input))
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::Systemic { failed: 6, total: 10, .. }));
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let analysis = ScriptedAnalysis::default();
        analysis.fail_transiently("A", Period::Year(2024), 2);
        let executor = PrimaryAnalysisExecutor::new(Arc::new(analysis.clone()));
        let ctx = step_context("score", StepKind::PrimaryAnalysis);
        let input = document_grid(&["A"], &[2024]);

        let out = executor.execute(&ctx, &config(RunMode::PerItem), Some(&input)).await.unwrap();
        assert_eq!(out.total_items(), 1);
        assert!(out.errors.is_empty());
        assert_eq!(analysis.analyze_calls(), 3);
    }

    #[tokio::test]
    async fn test_second_pass_hits_cache() {
        let analysis = ScriptedAnalysis::default();
        let executor = PrimaryAnalysisExecutor::new(Arc::new(analysis.clone()));
        let ctx = step_context("score", StepKind::PrimaryAnalysis);
        let input = document_grid(&["A", "B"], &[2024]);

        let first = executor.execute(&ctx, &config(RunMode::PerItem), Some(&input)).await.unwrap();
        let second = executor.execute(&ctx, &config(RunMode::PerItem), Some(&input)).await.unwrap();
        assert_eq!(first.data, second.data);
        assert_eq!(analysis.analyze_calls(), 2);
        assert_eq!(analysis.cache_hits(), 2);
    }

    #[test]
    fn test_rejects_non_document_input() {
        let executor = PrimaryAnalysisExecutor::new(Arc::new(ScriptedAnalysis::default()));
        let mut input = DataContainer::new("prev", "primary_analysis");
        input.set_payload(
            "A",
            Period::Year(2024),
            Some(Payload::Analysis(AnalysisResult {
                result_type: "health".into(),
                run_id: "r1".into(),
                data: json!({}),
            })),
        );
        assert!(matches!(
            executor.validate_input(Some(&input)),
            Err(StepError::Validation { .. })
        ));
        assert!(executor.validate_input(None).is_err());
        assert!(executor.validate_input(Some(&document_grid(&["A"], &[2024]))).is_ok());
    }
}
