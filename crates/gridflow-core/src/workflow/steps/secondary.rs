//! Secondary aggregation analysis: groups prior results along an axis and
//! asks the analysis service for one combined result per group.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use gridflow_types::container::{Cell, DataContainer};
use gridflow_types::payload::BundleItem;
use gridflow_types::period::Period;
use gridflow_types::step::{SecondaryAnalysisConfig, StepConfig, StepKind};
use serde_json::json;

use crate::provider::analysis::{AnalysisInput, AnalysisKey, AnalysisRequest, AnalysisServiceDyn};

use super::work::{analyze_units, apply_outcomes, member_fingerprint};
use super::{StepContext, StepError, StepExecutor, require_input};

pub struct SecondaryAnalysisExecutor {
    analysis: Arc<dyn AnalysisServiceDyn>,
}

impl SecondaryAnalysisExecutor {
    pub fn new(analysis: Arc<dyn AnalysisServiceDyn>) -> Self {
        Self { analysis }
    }
}

impl StepExecutor for SecondaryAnalysisExecutor {
    fn kind(&self) -> StepKind {
        StepKind::SecondaryAggregationAnalysis
    }

    /// Needs analyzed cells, not raw documents.
    fn validate_input(&self, input: Option<&DataContainer>) -> Result<(), StepError> {
        let input = require_input(input)?;
        if let Some((entity, period, _)) = input.items().find(|(_, _, p)| p.as_document().is_some()) {
            return Err(StepError::validation(
                "analysis results",
                format!("document payload at {entity}/{period}"),
            ));
        }
        Ok(())
    }

    fn execute<'a>(
        &'a self,
        ctx: &'a StepContext,
        config: &'a StepConfig,
        input: Option<&'a DataContainer>,
    ) -> Pin<Box<dyn Future<Output = Result<DataContainer, StepError>> + Send + 'a>> {
        Box::pin(async move {
            let StepConfig::SecondaryAggregationAnalysis(cfg) = config else {
                return Err(StepError::mismatch(StepKind::SecondaryAggregationAnalysis, config));
            };
            let input = require_input(input)?;
            let mut out = input.derive(ctx.step_id.clone(), ctx.kind.as_str());

            let mut requests = Vec::new();
            for group in input.group_cells(cfg.group_by) {
                out.insert_cell(group.entity.clone(), group.period.clone(), Cell::placeholder());
                if group.members.is_empty() {
                    continue;
                }
                let key = group_key(cfg, &group.entity, group.period, &group.members);
                requests.push(AnalysisRequest {
                    key,
                    input: AnalysisInput::Payloads { items: group.members },
                });
            }

            let concurrency = ctx
                .settings
                .concurrency(cfg.concurrency, self.analysis.concurrency_hint());
            let outcomes = analyze_units(self.analysis.clone(), requests, concurrency, ctx.settings.clone()).await;
            let tally = apply_outcomes(ctx, &mut out, outcomes);
            tally.check(ctx.settings.threshold(cfg.failure_threshold))?;
            Ok(out)
        })
    }
}

/// The members are part of the key: the same group over a different set of
/// results is a different synthesis.
fn group_key(cfg: &SecondaryAnalysisConfig, entity: &str, period: Period, members: &[BundleItem]) -> AnalysisKey {
    AnalysisKey {
        entity: entity.to_string(),
        period,
        analysis_kind: cfg.analysis_kind.clone(),
        document_kind: None,
        variant: cfg.prompt_variant.clone(),
        params: json!({ "params": cfg.params, "members": member_fingerprint(members) }),
    }
}
