//! Analysis work units shared by the analysis and aggregation executors.
//!
//! A unit is one [`AnalysisRequest`]. Units run on the bounded pool; each one
//! tries the service cache first, then analyzes with retry. Outcomes are
//! folded back into the step's output container and tallied against the
//! step's failure threshold.

use std::sync::Arc;

use gridflow_types::container::{DataContainer, ItemError, ItemErrorKind};
use gridflow_types::payload::{AnalysisResult, BundleItem, Payload};
use gridflow_types::period::Period;
use serde_json::{Value, json};

use crate::provider::analysis::{AnalysisRequest, AnalysisServiceDyn};
use crate::workflow::pool::run_bounded;
use crate::workflow::retry::{CallFailure, call_with_retry};

use super::{ExecutionSettings, StepContext, StepError, require_input};

pub(super) struct UnitOutcome {
    pub entity: String,
    pub period: Period,
    pub result: Result<AnalysisResult, CallFailure>,
    pub cached: bool,
}

/// Counts for one step's work units.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(super) struct Tally {
    pub attempted: usize,
    pub failed: usize,
    pub cache_hits: usize,
}

impl Tally {
    /// Fail the step when the failed fraction exceeds `threshold`.
    pub fn check(&self, threshold: f64) -> Result<(), StepError> {
        if self.attempted == 0 {
            return Ok(());
        }
        let rate = self.failed as f64 / self.attempted as f64;
        if rate > threshold {
            return Err(StepError::Systemic {
                failed: self.failed,
                total: self.attempted,
                threshold,
            });
        }
        Ok(())
    }
}

/// Identity of the members a synthesis combines, for its cache key.
///
/// Analysis members are named by the invocation that produced them and
/// documents by checksum (or location); anything else by its full content.
/// The same group over different members therefore never shares a key.
pub(super) fn member_fingerprint(members: &[BundleItem]) -> Value {
    Value::Array(
        members
            .iter()
            .map(|member| {
                let source = match &member.payload {
                    Payload::Analysis(a) => Value::String(a.run_id.clone()),
                    Payload::Document(d) => Value::String(d.checksum.clone().unwrap_or_else(|| d.uri.clone())),
                    other => serde_json::to_value(other).unwrap_or(Value::Null),
                };
                json!({
                    "entity": member.entity,
                    "period": member.period.to_string(),
                    "source": source,
                })
            })
            .collect(),
    )
}

/// Cache lookup, then analysis with retry. Returns the result and whether it
/// was a cache hit.
pub(super) async fn analyze_one(
    analysis: &dyn AnalysisServiceDyn,
    request: &AnalysisRequest,
    settings: &ExecutionSettings,
) -> Result<(AnalysisResult, bool), CallFailure> {
    let key = &request.key;
    match tokio::time::timeout(settings.call_timeout, analysis.find_existing_boxed(key)).await {
        Ok(Ok(Some(hit))) => return Ok((hit, true)),
        Ok(Ok(None)) => {}
        Ok(Err(err)) => {
            tracing::warn!(entity = %key.entity, period = %key.period, error = %err, "analysis cache lookup failed");
        }
        Err(_) => {
            tracing::warn!(entity = %key.entity, period = %key.period, "analysis cache lookup timed out");
        }
    }

    let result = call_with_retry(&settings.retry, settings.call_timeout, || {
        analysis.analyze_boxed(request)
    })
    .await?;
    Ok((result, false))
}

/// Run every request on the bounded pool. Outcomes are in request order.
pub(super) async fn analyze_units(
    analysis: Arc<dyn AnalysisServiceDyn>,
    requests: Vec<AnalysisRequest>,
    concurrency: usize,
    settings: Arc<ExecutionSettings>,
) -> Vec<UnitOutcome> {
    let addresses: Vec<(String, Period)> = requests
        .iter()
        .map(|r| (r.key.entity.clone(), r.key.period.clone()))
        .collect();

    let joined = run_bounded(requests, concurrency, move |request: AnalysisRequest| {
        let analysis = analysis.clone();
        let settings = settings.clone();
        async move { analyze_one(analysis.as_ref(), &request, &settings).await }
    })
    .await;

    addresses
        .into_iter()
        .zip(joined)
        .map(|((entity, period), joined)| {
            let (result, cached) = match joined {
                Ok(Ok((result, cached))) => (Ok(result), cached),
                Ok(Err(failure)) => (Err(failure), false),
                Err(message) => (
                    Err(CallFailure {
                        kind: ItemErrorKind::Internal,
                        message,
                        attempts: 0,
                    }),
                    false,
                ),
            };
            UnitOutcome {
                entity,
                period,
                result,
                cached,
            }
        })
        .collect()
}

/// Fold outcomes into `out`: successes become analysis payloads, failures
/// become nil cells plus an [`ItemError`].
pub(super) fn apply_outcomes(
    ctx: &StepContext,
    out: &mut DataContainer,
    outcomes: Vec<UnitOutcome>,
) -> Tally {
    let mut tally = Tally::default();
    for outcome in outcomes {
        tally.attempted += 1;
        match outcome.result {
            Ok(result) => {
                if outcome.cached {
                    tally.cache_hits += 1;
                }
                out.record_source_run(result.run_id.clone());
                out.set_payload(outcome.entity, outcome.period, Some(Payload::Analysis(result)));
            }
            Err(failure) => {
                tally.failed += 1;
                tracing::warn!(
                    run_id = %ctx.run_id,
                    step_id = %ctx.step_id,
                    entity = %outcome.entity,
                    period = %outcome.period,
                    attempts = failure.attempts,
                    error = %failure.message,
                    "work unit failed"
                );
                out.set_payload(outcome.entity.clone(), outcome.period.clone(), None);
                out.errors.push(item_error(outcome.entity, outcome.period, failure));
            }
        }
    }

    tracing::debug!(
        run_id = %ctx.run_id,
        step_id = %ctx.step_id,
        attempted = tally.attempted,
        failed = tally.failed,
        cache_hits = tally.cache_hits,
        "work units finished"
    );
    tally
}

pub(super) fn item_error(entity: String, period: Period, failure: CallFailure) -> ItemError {
    ItemError {
        entity,
        period,
        kind: failure.kind,
        message: failure.message,
        attempts: failure.attempts,
    }
}

/// Input validation for steps that analyze documents: every non-nil cell
/// must hold a document reference.
pub(super) fn require_documents(input: Option<&DataContainer>) -> Result<(), StepError> {
    let input = require_input(input)?;
    if let Some((entity, period, payload)) = input.items().find(|(_, _, p)| p.as_document().is_none()) {
        return Err(StepError::validation(
            "document references or document placeholders",
            format!("{} payload at {entity}/{period}", payload.kind()),
        ));
    }
    Ok(())
}
