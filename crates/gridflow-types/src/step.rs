//! Step kinds and their typed configuration.
//!
//! A workflow definition stores each step's `type` as a string and its
//! `config` as a free-form JSON object. Both are resolved into a
//! [`StepKind`] and a [`StepConfig`] when the workflow is loaded, so an
//! unknown tag or a malformed config is rejected before any step runs.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::container::GroupAxis;
use crate::period::Period;

// ---------------------------------------------------------------------------
// StepKind
// ---------------------------------------------------------------------------

/// The closed set of executor kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Input,
    PrimaryAnalysis,
    SecondaryAggregationAnalysis,
    LensAnalysis,
    CustomPromptAnalysis,
    Filter,
    Aggregate,
    Export,
}

impl StepKind {
    pub const ALL: [StepKind; 8] = [
        StepKind::Input,
        StepKind::PrimaryAnalysis,
        StepKind::SecondaryAggregationAnalysis,
        StepKind::LensAnalysis,
        StepKind::CustomPromptAnalysis,
        StepKind::Filter,
        StepKind::Aggregate,
        StepKind::Export,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Input => "input",
            StepKind::PrimaryAnalysis => "primary_analysis",
            StepKind::SecondaryAggregationAnalysis => "secondary_aggregation_analysis",
            StepKind::LensAnalysis => "lens_analysis",
            StepKind::CustomPromptAnalysis => "custom_prompt_analysis",
            StepKind::Filter => "filter",
            StepKind::Aggregate => "aggregate",
            StepKind::Export => "export",
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error for a `type` tag that names no executor.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown step type '{0}'")]
pub struct UnknownStepKind(pub String);

impl FromStr for StepKind {
    type Err = UnknownStepKind;

    /// Accepts `primary_analysis`, `PrimaryAnalysis`, and `primaryAnalysis`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .collect::<String>()
            .to_ascii_lowercase();
        StepKind::ALL
            .into_iter()
            .find(|kind| kind.as_str().replace('_', "") == normalized)
            .ok_or_else(|| UnknownStepKind(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Shared config pieces
// ---------------------------------------------------------------------------

/// Upper bound on `{"last": n}`.
pub const MAX_LAST_PERIODS: u32 = 200;

/// Which periods the Input step requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PeriodSpec {
    /// Explicit periods, in order.
    List(Vec<Period>),
    /// The last `last` fiscal years ending at `as_of` (default: current year).
    Last {
        last: u32,
        #[serde(default, alias = "asOf")]
        as_of: Option<i32>,
    },
}

impl PeriodSpec {
    /// Expand into concrete periods, oldest first, without duplicates.
    pub fn resolve(&self, current_year: i32) -> Vec<Period> {
        match self {
            PeriodSpec::List(periods) => {
                let mut out: Vec<Period> = Vec::with_capacity(periods.len());
                for p in periods {
                    if !out.contains(p) {
                        out.push(p.clone());
                    }
                }
                out
            }
            PeriodSpec::Last { last, as_of } => {
                let end = as_of.unwrap_or(current_year);
                let count = i32::try_from(*last).unwrap_or(i32::MAX);
                let start = end.saturating_sub(count).saturating_add(1);
                (start..=end).map(Period::Year).collect()
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// One analysis call per non-nil cell.
    #[default]
    #[serde(alias = "perItem")]
    PerItem,
    /// One analysis call per entity over all of its periods.
    Aggregated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptScope {
    /// Render the whole input into one prompt; output is `(ALL, ALL)`.
    #[default]
    All,
    /// Render one prompt per non-nil cell.
    #[serde(alias = "perItem")]
    PerItem,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOperator {
    #[serde(alias = ">")]
    Gt,
    #[serde(alias = ">=")]
    Gte,
    #[serde(alias = "<")]
    Lt,
    #[serde(alias = "<=")]
    Lte,
    #[serde(alias = "==", alias = "=")]
    Eq,
    #[serde(alias = "!=")]
    Neq,
    Contains,
}

/// How grouped cells are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CombineMode {
    /// Ask the analysis service to synthesize groups of two or more cells.
    #[default]
    Synthesize,
    /// Keep the members side by side in a bundle payload.
    Bundle,
}

/// Axis that `top_n` truncates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RankAxis {
    /// Keep the best `n` entities (ranked by their best-scoring period).
    #[default]
    Entity,
    /// Keep the best `n` periods within every entity.
    Period,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportFormat {
    Json,
    Csv,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::Csv => "csv",
        }
    }
}

fn default_document_kind() -> String {
    "annual_report".to_string()
}

fn default_primary_kind() -> String {
    "primary".to_string()
}

fn default_secondary_kind() -> String {
    "secondary".to_string()
}

fn default_lens_kind() -> String {
    "lens".to_string()
}

fn default_prompt_kind() -> String {
    "custom_prompt".to_string()
}

fn default_synthesis_kind() -> String {
    "synthesis".to_string()
}

fn default_true() -> bool {
    true
}

fn default_formats() -> Vec<ExportFormat> {
    vec![ExportFormat::Json]
}

// ---------------------------------------------------------------------------
// Per-kind configs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputConfig {
    #[serde(alias = "tickers")]
    pub entities: Vec<String>,
    pub periods: PeriodSpec,
    #[serde(default = "default_document_kind", alias = "documentKind")]
    pub document_kind: String,
    #[serde(default)]
    pub concurrency: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrimaryAnalysisConfig {
    #[serde(default = "default_primary_kind", alias = "analysisKind")]
    pub analysis_kind: String,
    #[serde(default, alias = "runMode")]
    pub run_mode: RunMode,
    #[serde(default, alias = "promptVariant")]
    pub prompt_variant: Option<String>,
    #[serde(default, alias = "failureThreshold")]
    pub failure_threshold: Option<f64>,
    #[serde(default)]
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub params: Value,
}

/// Second-pass analysis over per-cell results, one call per group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecondaryAnalysisConfig {
    #[serde(default = "default_secondary_kind", alias = "analysisKind")]
    pub analysis_kind: String,
    #[serde(default, alias = "groupBy")]
    pub group_by: GroupAxis,
    #[serde(default, alias = "promptVariant")]
    pub prompt_variant: Option<String>,
    #[serde(default, alias = "failureThreshold")]
    pub failure_threshold: Option<f64>,
    #[serde(default)]
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LensConfig {
    pub lenses: Vec<String>,
    #[serde(default = "default_lens_kind", alias = "analysisKind")]
    pub analysis_kind: String,
    /// Run the lenses of one cell concurrently.
    #[serde(default = "default_true")]
    pub parallel: bool,
    #[serde(default, alias = "failureThreshold")]
    pub failure_threshold: Option<f64>,
    #[serde(default)]
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomPromptConfig {
    /// Template with `{{data}}`, `{{entities}}`, `{{periods}}`,
    /// `{{item_count}}` (and per-item `{{entity}}`, `{{period}}`) slots.
    pub template: String,
    #[serde(default = "default_prompt_kind", alias = "analysisKind")]
    pub analysis_kind: String,
    #[serde(default)]
    pub scope: PromptScope,
    #[serde(default, alias = "failureThreshold")]
    pub failure_threshold: Option<f64>,
    #[serde(default)]
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterConfig {
    #[serde(alias = "fieldPath")]
    pub field_path: String,
    pub operator: FilterOperator,
    pub value: Value,
    /// Overrides the engine-wide empty-result policy.
    #[serde(default, alias = "failOnEmpty")]
    pub fail_on_empty: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum AggregateConfig {
    #[serde(alias = "mergeAll")]
    MergeAll {
        #[serde(default)]
        combine: CombineMode,
        #[serde(default = "default_synthesis_kind", alias = "synthesisKind")]
        synthesis_kind: String,
    },
    #[serde(alias = "groupByEntity")]
    GroupByEntity {
        #[serde(default)]
        combine: CombineMode,
        #[serde(default = "default_synthesis_kind", alias = "synthesisKind")]
        synthesis_kind: String,
    },
    #[serde(alias = "groupByPeriod")]
    GroupByPeriod {
        #[serde(default)]
        combine: CombineMode,
        #[serde(default = "default_synthesis_kind", alias = "synthesisKind")]
        synthesis_kind: String,
    },
    #[serde(rename = "top_n", alias = "topN")]
    TopN {
        n: usize,
        #[serde(alias = "scoreField")]
        score_field: String,
        #[serde(default)]
        axis: RankAxis,
    },
    #[serde(alias = "averageMetrics")]
    AverageMetrics {
        fields: Vec<String>,
        #[serde(default, alias = "groupBy")]
        group_by: GroupAxis,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportConfig {
    #[serde(default = "default_formats")]
    pub formats: Vec<ExportFormat>,
}

// ---------------------------------------------------------------------------
// StepConfig
// ---------------------------------------------------------------------------

/// A step's config resolved against its kind.
#[derive(Debug, Clone, PartialEq)]
pub enum StepConfig {
    Input(InputConfig),
    PrimaryAnalysis(PrimaryAnalysisConfig),
    SecondaryAggregationAnalysis(SecondaryAnalysisConfig),
    LensAnalysis(LensConfig),
    CustomPromptAnalysis(CustomPromptConfig),
    Filter(FilterConfig),
    Aggregate(AggregateConfig),
    Export(ExportConfig),
}

impl StepConfig {
    /// Parse the raw JSON config of a step of the given kind. A missing
    /// (`null`) config is read as an empty object.
    pub fn parse(kind: StepKind, raw: &Value) -> Result<Self, serde_json::Error> {
        let raw = match raw {
            Value::Null => Value::Object(serde_json::Map::new()),
            other => other.clone(),
        };
        Ok(match kind {
            StepKind::Input => {
                let cfg: InputConfig = serde_json::from_value(raw)?;
                if let PeriodSpec::Last { last, .. } = cfg.periods {
                    if last > MAX_LAST_PERIODS {
                        return Err(serde::de::Error::custom(format!(
                            "periods.last = {last} exceeds the limit of {MAX_LAST_PERIODS}"
                        )));
                    }
                }
                StepConfig::Input(cfg)
            }
            StepKind::PrimaryAnalysis => StepConfig::PrimaryAnalysis(serde_json::from_value(raw)?),
            StepKind::SecondaryAggregationAnalysis => {
                StepConfig::SecondaryAggregationAnalysis(serde_json::from_value(raw)?)
            }
            StepKind::LensAnalysis => StepConfig::LensAnalysis(serde_json::from_value(raw)?),
            StepKind::CustomPromptAnalysis => {
                StepConfig::CustomPromptAnalysis(serde_json::from_value(raw)?)
            }
            StepKind::Filter => StepConfig::Filter(serde_json::from_value(raw)?),
            StepKind::Aggregate => StepConfig::Aggregate(serde_json::from_value(raw)?),
            StepKind::Export => StepConfig::Export(serde_json::from_value(raw)?),
        })
    }

    pub fn kind(&self) -> StepKind {
        match self {
            StepConfig::Input(_) => StepKind::Input,
            StepConfig::PrimaryAnalysis(_) => StepKind::PrimaryAnalysis,
            StepConfig::SecondaryAggregationAnalysis(_) => StepKind::SecondaryAggregationAnalysis,
            StepConfig::LensAnalysis(_) => StepKind::LensAnalysis,
            StepConfig::CustomPromptAnalysis(_) => StepKind::CustomPromptAnalysis,
            StepConfig::Filter(_) => StepKind::Filter,
            StepConfig::Aggregate(_) => StepKind::Aggregate,
            StepConfig::Export(_) => StepKind::Export,
        }
    }
}
