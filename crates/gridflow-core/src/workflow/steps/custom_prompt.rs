//! Custom prompt analysis.
//!
//! The template is rendered against the input and sent to the analysis
//! service as a prompt. Supported slots:
//!
//! | slot             | value                                              |
//! |------------------|----------------------------------------------------|
//! | `{{data}}`       | pretty JSON of the items in scope                  |
//! | `{{entities}}`   | comma-separated entities in scope                  |
//! | `{{periods}}`    | comma-separated periods in scope                   |
//! | `{{item_count}}` | number of items in scope                           |
//! | `{{entity}}`     | the item's entity (per-item scope), `ALL` otherwise |
//! | `{{period}}`     | the item's period (per-item scope), `ALL` otherwise |
//!
//! With the default `all` scope the step makes one call and its output is the
//! single cell `(ALL, ALL)`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use gridflow_types::container::{Cell, DataContainer, Warning};
use gridflow_types::payload::Payload;
use gridflow_types::period::{ALL_KEY, Period};
use gridflow_types::step::{CustomPromptConfig, PromptScope, StepConfig, StepKind};
use serde_json::{Value, json};

use crate::provider::analysis::{AnalysisInput, AnalysisKey, AnalysisRequest, AnalysisServiceDyn};

use super::work::{analyze_units, apply_outcomes};
use super::{StepContext, StepError, StepExecutor, require_input};

pub struct CustomPromptExecutor {
    analysis: Arc<dyn AnalysisServiceDyn>,
}

impl CustomPromptExecutor {
    pub fn new(analysis: Arc<dyn AnalysisServiceDyn>) -> Self {
        Self { analysis }
    }

    async fn run(
        &self,
        ctx: &StepContext,
        cfg: &CustomPromptConfig,
        input: &DataContainer,
    ) -> Result<DataContainer, StepError> {
        if cfg.template.trim().is_empty() {
            return Err(StepError::InvalidConfig("prompt template is empty".into()));
        }

        let mut out = input.derive(ctx.step_id.clone(), ctx.kind.as_str());
        let mut requests = Vec::new();

        match cfg.scope {
            PromptScope::All => {
                out.insert_cell(ALL_KEY, Period::All, Cell::placeholder());
                let items: Vec<(&str, &Period, &Payload)> = input.items().collect();
                if items.is_empty() {
                    out.warnings.push(Warning::Note {
                        message: format!("step '{}' had no input items to prompt with", ctx.step_id),
                    });
                } else {
                    let text = render(&cfg.template, &scope_slots(&items));
                    requests.push(prompt_request(cfg, ALL_KEY, Period::All, text));
                }
            }
            PromptScope::PerItem => {
                for (entity, period, cell) in input.cells() {
                    out.insert_cell(entity, period.clone(), Cell::placeholder());
                    if let Some(payload) = &cell.payload {
                        let text = render(&cfg.template, &scope_slots(&[(entity, period, payload)]));
                        requests.push(prompt_request(cfg, entity, period.clone(), text));
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

/// The rendered prompt is part of the key so a changed upstream result is
/// never answered from a stale cache entry.
fn prompt_request(cfg: &CustomPromptConfig, entity: &str, period: Period, text: String) -> AnalysisRequest {
    AnalysisRequest {
        key: AnalysisKey {
            entity: entity.to_string(),
            period,
            analysis_kind: cfg.analysis_kind.clone(),
            document_kind: None,
            variant: None,
            params: json!({ "params": cfg.params, "prompt": text }),
        },
        input: AnalysisInput::Prompt { text },
    }
}

fn scope_slots(items: &[(&str, &Period, &Payload)]) -> Vec<(&'static str, String)> {
    let mut entities: Vec<&str> = Vec::new();
    let mut periods: Vec<String> = Vec::new();
    let mut data = Vec::with_capacity(items.len());
    for (entity, period, payload) in items {
        if !entities.contains(entity) {
            entities.push(*entity);
        }
        let period_label = period.to_string();
        if !periods.contains(&period_label) {
            periods.push(period_label.clone());
        }
        data.push(json!({
            "entity": entity,
            "period": period_label,
            "type": payload.result_type(),
            "data": payload.field_view().into_owned(),
        }));
    }

    let (entity, period) = match items {
        [(entity, period, _)] => (entity.to_string(), period.to_string()),
        _ => (ALL_KEY.to_string(), ALL_KEY.to_string()),
    };
    let data = match data.as_slice() {
        [single] => single.clone(),
        _ => Value::Array(data),
    };

    vec![
        ("data", serde_json::to_string_pretty(&data).unwrap_or_default()),
        ("entities", entities.join(", ")),
        ("periods", periods.join(", ")),
        ("item_count", items.len().to_string()),
        ("entity", entity),
        ("period", period),
    ]
}

/// Fill `{{slot}}` placeholders in one pass; substituted text is never
/// scanned again, and unknown slots are left as written.
fn render(template: &str, slots: &[(&str, String)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let filled = after.find("}}").and_then(|end| {
            let name = &after[..end];
            slots
                .iter()
                .find(|(slot, _)| *slot == name)
                .map(|(_, value)| (value, end))
        });
        match filled {
            Some((value, end)) => {
                out.push_str(value);
                rest = &after[end + 2..];
            }
            None => {
                out.push('{');
                rest = &rest[start + 1..];
            }
        }
    }
    out.push_str(rest);
    out
}

impl StepExecutor for CustomPromptExecutor {
    fn kind(&self) -> StepKind {
        StepKind::CustomPromptAnalysis
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
            let StepConfig::CustomPromptAnalysis(cfg) = config else {
                return Err(StepError::mismatch(StepKind::CustomPromptAnalysis, config));
            };
            let input = require_input(input)?;
            self.run(ctx, cfg, input).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedAnalysis, step_context};
    use gridflow_types::container::Shape;
    use gridflow_types::payload::AnalysisResult;

    fn analyzed() -> DataContainer {
        let mut c = DataContainer::new("score", "primary_analysis");
        for (entity, score) in [("A", 10), ("B", 20)] {
            c.set_payload(
                entity,
                Period::Year(2024),
                Some(Payload::Analysis(AnalysisResult {
                    result_type: "health".into(),
                    run_id: format!("r-{entity}"),
                    data: json!({ "score": score }),
                })),
            );
        }
        c
    }

    fn config(scope: PromptScope) -> StepConfig {
        StepConfig::CustomPromptAnalysis(CustomPromptConfig {
            template: "Compare {{entities}} over {{periods}} ({{item_count}} items) for {{entity}}".into(),
            analysis_kind: "custom_prompt".into(),
            scope,
            failure_threshold: None,
            concurrency: None,
            params: Value::Null,
        })
    }

    #[test]
    fn test_render_fills_slots() {
        let input = analyzed();
        let items: Vec<_> = input.items().collect();
        let text = render("{{entities}} | {{periods}} | {{item_count}} | {{unknown}}", &scope_slots(&items));
        assert_eq!(text, "A, B | 2024 | 2 | {{unknown}}");

        let data = render("{{data}}", &scope_slots(&items[..1]));
        let parsed: Value = serde_json::from_str(&data).unwrap();
        assert_eq!(parsed["data"]["score"], json!(10));
        assert_eq!(parsed["entity"], json!("A"));
    }

    #[test]
    fn test_render_does_not_rescan_substituted_text() {
        let slots = vec![
            ("data", "note: {{entity}} / {{period}}".to_string()),
            ("entity", "A".to_string()),
            ("period", "2024".to_string()),
        ];
        assert_eq!(
            render("{{data}} for {{entity}} in {{period}}", &slots),
            "note: {{entity}} / {{period}} for A in 2024"
        );
        assert_eq!(render("{{{entity}}} {{entity", &slots), "{A} {{entity");
    }

    #[tokio::test]
    async fn test_all_scope_collapses_to_single_cell() {
        let analysis = ScriptedAnalysis::default();
        let executor = CustomPromptExecutor::new(Arc::new(analysis.clone()));
        let ctx = step_context("synth", StepKind::CustomPromptAnalysis);

        let out = executor.execute(&ctx, &config(PromptScope::All), Some(&analyzed())).await.unwrap();
        assert_eq!(out.shape(), Shape::new(1, 1));
        let payload = out.get(ALL_KEY, &Period::All).unwrap().payload.as_ref().unwrap();
        assert_eq!(
            payload.lookup("detail.prompt"),
            Some(json!("Compare A, B over 2024 (2 items) for ALL"))
        );
        assert_eq!(analysis.analyze_calls(), 1);
    }

    #[tokio::test]
    async fn test_per_item_scope_keeps_grid() {
        let executor = CustomPromptExecutor::new(Arc::new(ScriptedAnalysis::default()));
        let ctx = step_context("synth", StepKind::CustomPromptAnalysis);

        let out = executor
            .execute(&ctx, &config(PromptScope::PerItem), Some(&analyzed()))
            .await
            .unwrap();
        assert_eq!(out.shape(), Shape::new(2, 1));
        let payload = out.get("B", &Period::Year(2024)).unwrap().payload.as_ref().unwrap();
        assert_eq!(
            payload.lookup("detail.prompt"),
            Some(json!("Compare B over 2024 (1 items) for B"))
        );
    }

    #[tokio::test]
    async fn test_empty_input_makes_no_call() {
        let analysis = ScriptedAnalysis::default();
        let executor = CustomPromptExecutor::new(Arc::new(analysis.clone()));
        let ctx = step_context("synth", StepKind::CustomPromptAnalysis);
        let empty = DataContainer::new("filter", "filter");

        let out = executor.execute(&ctx, &config(PromptScope::All), Some(&empty)).await.unwrap();
        assert_eq!(out.shape(), Shape::new(1, 1));
        assert_eq!(out.total_items(), 0);
        assert_eq!(analysis.analyze_calls(), 0);
    }
}
