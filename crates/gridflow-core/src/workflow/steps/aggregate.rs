//! Aggregate: shape-changing operations over the grid.
//!
//! - `merge_all`, `group_by_entity`, `group_by_period` combine cells along
//!   an axis, either by synthesis through the analysis service or by
//!   bundling the members.
//! - `top_n` ranks by a numeric score field and truncates one axis.
//! - `average_metrics` folds groups into numeric [`Report`]s without any
//!   service call.

use std::cmp::Ordering;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use gridflow_types::container::{Cell, DataContainer, GroupAxis, bundle_members};
use gridflow_types::payload::{BundleItem, Payload, Report};
use gridflow_types::period::Period;
use gridflow_types::step::{AggregateConfig, CombineMode, RankAxis, StepConfig, StepKind};
use indexmap::IndexMap;
use serde_json::{Value, json};

use crate::provider::analysis::{AnalysisInput, AnalysisKey, AnalysisRequest, AnalysisServiceDyn};

use super::filter::numeric;
use super::work::{analyze_units, apply_outcomes, member_fingerprint};
use super::{StepContext, StepError, StepExecutor, require_input};

pub struct AggregateExecutor {
    analysis: Arc<dyn AnalysisServiceDyn>,
}

impl AggregateExecutor {
    pub fn new(analysis: Arc<dyn AnalysisServiceDyn>) -> Self {
        Self { analysis }
    }

    async fn combine(
        &self,
        ctx: &StepContext,
        input: &DataContainer,
        axis: GroupAxis,
        mode: CombineMode,
        synthesis_kind: &str,
    ) -> Result<DataContainer, StepError> {
        let mut out = input.derive(ctx.step_id.clone(), ctx.kind.as_str());
        let mut requests = Vec::new();

        for group in input.group_cells(axis) {
            if mode == CombineMode::Synthesize && group.members.len() > 1 {
                out.insert_cell(group.entity.clone(), group.period.clone(), Cell::placeholder());
                let members = member_fingerprint(&group.members);
                requests.push(AnalysisRequest {
                    key: AnalysisKey {
                        entity: group.entity,
                        period: group.period,
                        analysis_kind: synthesis_kind.to_string(),
                        document_kind: None,
                        variant: None,
                        params: json!({ "members": members }),
                    },
                    input: AnalysisInput::Payloads { items: group.members },
                });
            } else {
                let payload = bundle_members(group.members);
                out.insert_cell(group.entity, group.period, Cell { payload, document: None });
            }
        }

        if requests.is_empty() {
            return Ok(out);
        }
        let concurrency = ctx.settings.concurrency(None, self.analysis.concurrency_hint());
        let outcomes = analyze_units(self.analysis.clone(), requests, concurrency, ctx.settings.clone()).await;
        let tally = apply_outcomes(ctx, &mut out, outcomes);
        tally.check(ctx.settings.threshold(None))?;
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// top_n
// ---------------------------------------------------------------------------

fn score_of(payload: &Payload, field: &str) -> Option<f64> {
    payload.lookup(field).as_ref().and_then(numeric)
}

/// Descending by score; `sort_by` is stable so ties keep grid order.
fn by_score_desc(a: f64, b: f64) -> Ordering {
    b.partial_cmp(&a).unwrap_or(Ordering::Equal)
}

fn top_n(ctx: &StepContext, input: &DataContainer, n: usize, field: &str, axis: RankAxis) -> Result<DataContainer, StepError> {
    if n == 0 {
        return Err(StepError::InvalidConfig("top_n needs n >= 1".into()));
    }
    let mut out = input.derive(ctx.step_id.clone(), ctx.kind.as_str());

    match axis {
        RankAxis::Entity => {
            let mut ranked: Vec<(&str, f64)> = input
                .data
                .iter()
                .filter_map(|(entity, periods)| {
                    periods
                        .values()
                        .filter_map(|cell| cell.payload.as_ref())
                        .filter_map(|payload| score_of(payload, field))
                        .max_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal))
                        .map(|best| (entity.as_str(), best))
                })
                .collect();
            ranked.sort_by(|a, b| by_score_desc(a.1, b.1));

            for (entity, _) in ranked.into_iter().take(n) {
                for (period, cell) in &input.data[entity] {
                    if !cell.is_nil() {
                        out.insert_cell(entity, period.clone(), cell.clone());
                    }
                }
            }
        }
        RankAxis::Period => {
            for (entity, periods) in &input.data {
                let mut ranked: Vec<(&Period, &Cell, f64)> = periods
                    .iter()
                    .filter_map(|(period, cell)| {
                        let score = score_of(cell.payload.as_ref()?, field)?;
                        Some((period, cell, score))
                    })
                    .collect();
                ranked.sort_by(|a, b| by_score_desc(a.2, b.2));
                for (period, cell, _) in ranked.into_iter().take(n) {
                    out.insert_cell(entity.clone(), period.clone(), cell.clone());
                }
            }
        }
    }

    let unscored = input.total_items().saturating_sub(out.total_items());
    tracing::debug!(run_id = %ctx.run_id, step_id = %ctx.step_id, n, kept = out.total_items(), dropped = unscored, "top_n applied");
    Ok(out)
}

// ---------------------------------------------------------------------------
// average_metrics
// ---------------------------------------------------------------------------

fn average_metrics(ctx: &StepContext, input: &DataContainer, fields: &[String], axis: GroupAxis) -> Result<DataContainer, StepError> {
    if fields.is_empty() {
        return Err(StepError::InvalidConfig("average_metrics needs at least one field".into()));
    }
    let mut out = input.derive(ctx.step_id.clone(), ctx.kind.as_str());
    for group in input.group_cells(axis) {
        let payload = (!group.members.is_empty()).then(|| Payload::Report(report(&group.members, fields)));
        out.insert_cell(group.entity, group.period, Cell { payload, document: None });
    }
    Ok(out)
}

/// Mean of every numeric value of each field. A field with no numeric
/// values reports its first non-null value, or null.
fn report(members: &[BundleItem], fields: &[String]) -> Report {
    let mut metrics = IndexMap::with_capacity(fields.len());
    for field in fields {
        let values: Vec<Value> = members
            .iter()
            .filter_map(|item| item.payload.lookup(field))
            .filter(|v| !v.is_null())
            .collect();
        let numbers: Vec<f64> = values.iter().filter_map(numeric).collect();
        let metric = if numbers.is_empty() {
            values.into_iter().next().unwrap_or(Value::Null)
        } else {
            let mean = numbers.iter().sum::<f64>() / numbers.len() as f64;
            serde_json::Number::from_f64(mean).map_or(Value::Null, Value::Number)
        };
        metrics.insert(field.clone(), metric);
    }
    Report {
        metrics,
        member_count: members.len(),
    }
}

impl StepExecutor for AggregateExecutor {
    fn kind(&self) -> StepKind {
        StepKind::Aggregate
    }

    fn validate_input(&self, input: Option<&DataContainer>) -> Result<(), StepError> {
        require_input(input).map(|_| ())
    }

    fn execute<'a>(
        &'a self,
        ctx: &'a StepContext,
        config: &'a StepConfig,
        input: Option<&'a DataContainer>,
    ) -> Pin<Box<dyn Future<Output = Result<DataContainer, StepError>> + Send + 'a>> {
        Box::pin(async move {
            let StepConfig::Aggregate(cfg) = config else {
                return Err(StepError::mismatch(StepKind::Aggregate, config));
            };
            let input = require_input(input)?;
            match cfg {
                AggregateConfig::MergeAll { combine, synthesis_kind } => {
                    self.combine(ctx, input, GroupAxis::All, *combine, synthesis_kind).await
                }
                AggregateConfig::GroupByEntity { combine, synthesis_kind } => {
                    self.combine(ctx, input, GroupAxis::Entity, *combine, synthesis_kind).await
                }
                AggregateConfig::GroupByPeriod { combine, synthesis_kind } => {
                    self.combine(ctx, input, GroupAxis::Period, *combine, synthesis_kind).await
                }
                AggregateConfig::TopN { n, score_field, axis } => top_n(ctx, input, *n, score_field, *axis),
                AggregateConfig::AverageMetrics { fields, group_by } => {
                    average_metrics(ctx, input, fields, *group_by)
                }
            }
        })
    }
}
