//! Filter: keeps the cells whose payload field satisfies a comparison.
//!
//! Values are compared numerically when both sides read as numbers (numeric
//! strings included), otherwise as strings. A cell whose payload lacks the
//! field is dropped.

use std::cmp::Ordering;
use std::future::Future;
use std::pin::Pin;

use gridflow_types::container::DataContainer;
use gridflow_types::step::{FilterConfig, FilterOperator, StepConfig, StepKind};
use serde_json::Value;

use super::{StepContext, StepError, StepExecutor, require_input};

pub struct FilterExecutor;

impl FilterExecutor {
    fn run(ctx: &StepContext, cfg: &FilterConfig, input: &DataContainer) -> Result<DataContainer, StepError> {
        let out = input
            .relabel(ctx.step_id.clone(), ctx.kind.as_str())
            .filter_by(|_, _, payload| {
                payload
                    .lookup(&cfg.field_path)
                    .is_some_and(|actual| satisfies(&actual, cfg.operator, &cfg.value))
            });

        tracing::debug!(
            run_id = %ctx.run_id,
            step_id = %ctx.step_id,
            field = %cfg.field_path,
            before = input.total_items(),
            after = out.total_items(),
            "filter applied"
        );

        let fail_on_empty = cfg.fail_on_empty.unwrap_or(ctx.settings.fail_on_empty);
        if fail_on_empty && out.is_empty() {
            return Err(StepError::EmptyResult);
        }
        Ok(out)
    }
}

impl StepExecutor for FilterExecutor {
    fn kind(&self) -> StepKind {
        StepKind::Filter
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
            let StepConfig::Filter(cfg) = config else {
                return Err(StepError::mismatch(StepKind::Filter, config));
            };
            Self::run(ctx, cfg, require_input(input)?)
        })
    }
}

// ---------------------------------------------------------------------------
// Comparison
// ---------------------------------------------------------------------------

/// Read a JSON value as a number; numeric strings count.
pub(super) fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
        _ => None,
    }
}

fn compare(actual: &Value, expected: &Value) -> Option<Ordering> {
    if let (Some(a), Some(b)) = (numeric(actual), numeric(expected)) {
        return a.partial_cmp(&b);
    }
    match (actual, expected) {
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn equals(actual: &Value, expected: &Value) -> bool {
    match (numeric(actual), numeric(expected)) {
        (Some(a), Some(b)) => a == b,
        _ => actual == expected,
    }
}

pub fn satisfies(actual: &Value, operator: FilterOperator, expected: &Value) -> bool {
    match operator {
        FilterOperator::Gt => compare(actual, expected) == Some(Ordering::Greater),
        FilterOperator::Gte => matches!(compare(actual, expected), Some(Ordering::Greater | Ordering::Equal)),
        FilterOperator::Lt => compare(actual, expected) == Some(Ordering::Less),
        FilterOperator::Lte => matches!(compare(actual, expected), Some(Ordering::Less | Ordering::Equal)),
        FilterOperator::Eq => equals(actual, expected),
        FilterOperator::Neq => !equals(actual, expected),
        FilterOperator::Contains => match actual {
            Value::String(haystack) => match expected {
                Value::String(needle) => haystack.contains(needle.as_str()),
                other => haystack.contains(&other.to_string()),
            },
            Value::Array(items) => items.iter().any(|item| equals(item, expected)),
            Value::Object(map) => expected.as_str().is_some_and(|key| map.contains_key(key)),
            _ => false,
        },
    }
}
