//! Export: writes the incoming container to each configured format and
//! passes it through with the written paths appended to `artifacts`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::Utc;
use gridflow_types::container::DataContainer;
use gridflow_types::step::{ExportConfig, ExportFormat, StepConfig, StepKind};
use indexmap::IndexSet;
use serde_json::Value;

use crate::provider::export::ExportSinkDyn;

use super::{StepContext, StepError, StepExecutor, require_input};

pub struct ExportExecutor {
    sink: Arc<dyn ExportSinkDyn>,
}

impl ExportExecutor {
    pub fn new(sink: Arc<dyn ExportSinkDyn>) -> Self {
        Self { sink }
    }

    async fn run(&self, ctx: &StepContext, cfg: &ExportConfig, input: &DataContainer) -> Result<DataContainer, StepError> {
        if cfg.formats.is_empty() {
            return Err(StepError::InvalidConfig("export step needs at least one format".into()));
        }

        let stamp = Utc::now().format("%Y%m%dT%H%M%S%3fZ").to_string();
        let mut out = input.clone();
        let mut written: Vec<ExportFormat> = Vec::new();
        for format in &cfg.formats {
            if written.contains(format) {
                continue;
            }
            written.push(*format);

            let contents = match format {
                ExportFormat::Json => render_json(input)?,
                ExportFormat::Csv => render_csv(input).into_bytes(),
            };
            let file_name = format!("{}-{stamp}.{}", ctx.step_id, format.extension());
            let path = self
                .sink
                .write_boxed(&file_name, &contents)
                .await
                .map_err(|e| StepError::Export(e.to_string()))?;

            tracing::info!(
                run_id = %ctx.run_id,
                step_id = %ctx.step_id,
                path = %path,
                bytes = contents.len(),
                "export written"
            );
            out.artifacts.push(path);
        }
        Ok(out)
    }
}

fn render_json(input: &DataContainer) -> Result<Vec<u8>, StepError> {
    serde_json::to_vec_pretty(input).map_err(|e| StepError::Export(e.to_string()))
}

/// One row per item: `entity,period,kind` followed by the union of the
/// top-level fields of every payload, in first-seen order.
fn render_csv(input: &DataContainer) -> String {
    let views: Vec<(&str, String, &str, Value)> = input
        .items()
        .map(|(entity, period, payload)| (entity, period.to_string(), payload.result_type(), payload.field_view().into_owned()))
        .collect();

    let mut columns: IndexSet<&str> = IndexSet::new();
    for (_, _, _, view) in &views {
        if let Value::Object(map) = view {
            columns.extend(map.keys().map(String::as_str));
        }
    }

    let mut out = String::new();
    let header: Vec<String> = ["entity", "period", "kind"]
        .into_iter()
        .chain(columns.iter().copied())
        .map(csv_field)
        .collect();
    out.push_str(&header.join(","));
    out.push('\n');

    for (entity, period, kind, view) in &views {
        let mut row = vec![csv_field(entity), csv_field(period), csv_field(kind)];
        for column in &columns {
            let cell = match view.get(*column) {
                None | Some(Value::Null) => String::new(),
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
            };
            row.push(csv_field(&cell));
        }
        out.push_str(&row.join(","));
        out.push('\n');
    }
    out
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

impl StepExecutor for ExportExecutor {
    fn kind(&self) -> StepKind {
        StepKind::Export
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
            let StepConfig::Export(cfg) = config else {
                return Err(StepError::mismatch(StepKind::Export, config));
            };
            let input = require_input(input)?;
            self.run(ctx, cfg, input).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MemoryExportSink, step_context};
    use gridflow_types::payload::{AnalysisResult, Payload};
    use gridflow_types::period::Period;
    use serde_json::json;

    fn analyzed() -> DataContainer {
        let mut c = DataContainer::new("score", "primary_analysis");
        c.set_payload(
            "A",
            Period::Year(2024),
            Some(Payload::Analysis(AnalysisResult {
                result_type: "health".into(),
                run_id: "r-a".into(),
                data: json!({"score": 5, "note": "ok, fine"}),
            })),
        );
        c.set_payload(
            "B",
            Period::Year(2024),
            Some(Payload::Analysis(AnalysisResult {
                result_type: "health".into(),
                run_id: "r-b".into(),
                data: json!({"score": 7, "rating": "buy"}),
            })),
        );
        c
    }

    #[test]
    fn test_csv_union_of_columns() {
        let csv = render_csv(&analyzed());
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], "entity,period,kind,note,score,rating");
        assert_eq!(lines[1], "A,2024,health,\"ok, fine\",5,");
        assert_eq!(lines[2], "B,2024,health,,7,buy");
    }

    #[tokio::test]
    async fn test_export_passes_data_through() {
        let sink = MemoryExportSink::default();
        let executor = ExportExecutor::new(Arc::new(sink.clone()));
        let ctx = step_context("out", StepKind::Export);
        let input = analyzed();
        let cfg = StepConfig::Export(ExportConfig {
            formats: vec![ExportFormat::Json, ExportFormat::Csv, ExportFormat::Json],
        });

        let out = executor.execute(&ctx, &cfg, Some(&input)).await.unwrap();
        assert_eq!(out.data, input.data);
        assert_eq!(out.shape(), input.shape());
        assert_eq!(out.artifacts.len(), 2);
        assert!(out.artifacts[0].starts_with("mem://exports/out-"));
        assert!(out.artifacts[1].ends_with(".csv"));

        let files = sink.files();
        let json: DataContainer = serde_json::from_slice(&files[0].1).unwrap();
        assert_eq!(json.data, input.data);
    }

    #[tokio::test]
    async fn test_no_formats_is_invalid() {
        let executor = ExportExecutor::new(Arc::new(MemoryExportSink::default()));
        let ctx = step_context("out", StepKind::Export);
        let cfg = StepConfig::Export(ExportConfig { formats: vec![] });
        let err = executor.execute(&ctx, &cfg, Some(&analyzed())).await.unwrap_err();
        assert!(matches!(err, StepError::InvalidConfig(_)));
    }
}
