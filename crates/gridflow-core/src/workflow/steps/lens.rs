//! Lens analysis: several named analysis variants over the same document,
//! merged into one composite result per cell.
//!
//! A cell fails only when every lens fails. Individual lens failures are
//! still recorded as item errors on the output.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures_util::future::join_all;
use gridflow_types::container::{Cell, DataContainer, ItemErrorKind};
use gridflow_types::payload::{AnalysisResult, DocumentRef, Payload};
use gridflow_types::period::Period;
use gridflow_types::step::{LensConfig, StepConfig, StepKind};
use serde_json::{Map, Value};

use crate::provider::analysis::{AnalysisInput, AnalysisKey, AnalysisRequest, AnalysisServiceDyn};
use crate::workflow::pool::run_bounded;
use crate::workflow::retry::CallFailure;

use super::work::{Tally, analyze_one, item_error, require_documents};
use super::{StepContext, StepError, StepExecutor, require_input};

type LensOutcome = (String, Result<(AnalysisResult, bool), CallFailure>);

pub struct LensExecutor {
    analysis: Arc<dyn AnalysisServiceDyn>,
}

impl LensExecutor {
    pub fn new(analysis: Arc<dyn AnalysisServiceDyn>) -> Self {
        Self { analysis }
    }

    async fn run(&self, ctx: &StepContext, cfg: &LensConfig, input: &DataContainer) -> Result<DataContainer, StepError> {
        if cfg.lenses.is_empty() {
            return Err(StepError::InvalidConfig("lens step needs at least one lens".into()));
        }

        let mut out = input.derive(ctx.step_id.clone(), ctx.kind.as_str());
        let mut jobs: Vec<(String, Period, DocumentRef)> = Vec::new();
        for (entity, period, cell) in input.cells() {
            out.insert_cell(entity, period.clone(), Cell::placeholder());
            if let Some(document) = cell.source_document() {
                jobs.push((entity.to_string(), period.clone(), document.clone()));
            }
        }
        let addresses: Vec<(String, Period)> = jobs.iter().map(|(e, p, _)| (e.clone(), p.clone())).collect();

        let analysis = self.analysis.clone();
        let settings = ctx.settings.clone();
        let cfg_shared = Arc::new(cfg.clone());
        let concurrency = ctx
            .settings
            .concurrency(cfg.concurrency, self.analysis.concurrency_hint());

        let joined = run_bounded(jobs, concurrency, move |(entity, period, document): (String, Period, DocumentRef)| {
            let analysis = analysis.clone();
            let settings = settings.clone();
            let cfg = cfg_shared.clone();
            async move {
                let requests: Vec<(String, AnalysisRequest)> = cfg
                    .lenses
                    .iter()
                    .map(|lens| {
                        let request = AnalysisRequest {
                            key: AnalysisKey {
                                entity: entity.clone(),
                                period: period.clone(),
                                analysis_kind: cfg.analysis_kind.clone(),
                                document_kind: Some(document.kind.clone()),
                                variant: Some(lens.clone()),
                                params: cfg.params.clone(),
                            },
                            input: AnalysisInput::Document {
                                document: document.clone(),
                            },
                        };
                        (lens.clone(), request)
                    })
                    .collect();

                let mut outcomes: Vec<LensOutcome> = Vec::with_capacity(requests.len());
                if cfg.parallel {
                    let results = join_all(
                        requests
                            .iter()
                            .map(|(_, request)| analyze_one(analysis.as_ref(), request, &settings)),
                    )
                    .await;
                    for ((lens, _), result) in requests.iter().zip(results) {
                        outcomes.push((lens.clone(), result));
                    }
                } else {
                    for (lens, request) in &requests {
                        outcomes.push((lens.clone(), analyze_one(analysis.as_ref(), request, &settings).await));
                    }
                }
                outcomes
            }
        })
        .await;

        let mut tally = Tally::default();
        for ((entity, period), joined) in addresses.into_iter().zip(joined) {
            tally.attempted += 1;
            let outcomes = match joined {
                Ok(outcomes) => outcomes,
                Err(message) => {
                    tally.failed += 1;
                    out.errors.push(item_error(
                        entity,
                        period,
                        CallFailure {
                            kind: ItemErrorKind::Internal,
                            message,
                            attempts: 0,
                        },
                    ));
                    continue;
                }
            };

            let mut composite = Map::new();
            let mut run_ids = Vec::new();
            for (lens, result) in outcomes {
                match result {
                    Ok((result, cached)) => {
                        if cached {
                            tally.cache_hits += 1;
                        }
                        out.record_source_run(result.run_id.clone());
                        run_ids.push(result.run_id);
                        composite.insert(lens, result.data);
                    }
                    Err(mut failure) => {
                        tracing::warn!(
                            run_id = %ctx.run_id,
                            step_id = %ctx.step_id,
                            entity = %entity,
                            period = %period,
                            lens = %lens,
                            error = %failure.message,
                            "lens failed"
                        );
                        failure.message = format!("lens '{lens}': {}", failure.message);
                        out.errors.push(item_error(entity.clone(), period.clone(), failure));
                    }
                }
            }

            if composite.is_empty() {
                tally.failed += 1;
                continue;
            }
            let payload = Payload::Analysis(AnalysisResult {
                result_type: cfg.analysis_kind.clone(),
                run_id: run_ids.join("+"),
                data: Value::Object(composite),
            });
            out.set_payload(entity, period, Some(payload));
        }

        tracing::debug!(
            run_id = %ctx.run_id,
            step_id = %ctx.step_id,
            cells = tally.attempted,
            failed = tally.failed,
            lenses = cfg.lenses.len(),
            "lens analysis finished"
        );
        tally.check(ctx.settings.threshold(cfg.failure_threshold))?;
        Ok(out)
    }
}

impl StepExecutor for LensExecutor {
    fn kind(&self) -> StepKind {
        StepKind::LensAnalysis
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
            let StepConfig::LensAnalysis(cfg) = config else {
                return Err(StepError::mismatch(StepKind::LensAnalysis, config));
            };
            let input = require_input(input)?;
            self.run(ctx, cfg, input).await
        })
    }
}
