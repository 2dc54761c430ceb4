//! Cell payloads.
//!
//! Every non-nil cell of a [`DataContainer`](crate::container::DataContainer)
//! holds one [`Payload`]. On the wire a payload is a JSON object tagged with a
//! `kind` field. Known kinds map onto typed variants; any other tag is kept
//! verbatim as [`Payload::Opaque`] so that containers written by a newer
//! version pass through an older engine untouched.
//!
//! Documents carry a `kind` of their own, so their body is nested:
//! `{"kind": "document", "document": {...}}`.

use std::borrow::Cow;

use indexmap::IndexMap;
use serde::de::Error as _;
use serde::ser::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::period::Period;

const KIND_FIELD: &str = "kind";
const KIND_DOCUMENT: &str = "document";
const KIND_ANALYSIS: &str = "analysis";
const KIND_REPORT: &str = "report";
const KIND_BUNDLE: &str = "bundle";

// ---------------------------------------------------------------------------
// Variant bodies
// ---------------------------------------------------------------------------

/// Reference to a retrieved source document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRef {
    pub entity: String,
    pub period: Period,
    /// Document kind tag (e.g. `annual_report`).
    pub kind: String,
    /// Where the document can be read from (path or URL).
    pub uri: String,
    /// Content checksum when the source provides one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

/// Structured output of one analysis service invocation.
///
/// `data` is opaque to the engine; only Filter and Aggregate look inside it,
/// through [`walk_path`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    /// Declared logical result type (e.g. `financial_health`).
    pub result_type: String,
    /// Identifier of the external invocation that produced this result.
    pub run_id: String,
    #[serde(default)]
    pub data: Value,
}

/// Scalar/aggregate report produced by metric averaging.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Report {
    #[serde(default)]
    pub metrics: IndexMap<String, Value>,
    /// Number of cells that contributed to this report.
    #[serde(default)]
    pub member_count: usize,
}

/// One member of a combined cell, remembering where it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleItem {
    pub entity: String,
    pub period: Period,
    pub payload: Payload,
}

#[derive(Serialize, Deserialize)]
struct BundleBody {
    items: Vec<BundleItem>,
}

#[derive(Serialize, Deserialize)]
struct DocumentBody {
    document: DocumentRef,
}

// ---------------------------------------------------------------------------
// Payload
// ---------------------------------------------------------------------------

/// Discriminated union of everything a cell can hold.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Document(DocumentRef),
    Analysis(AnalysisResult),
    Report(Report),
    /// Several payloads combined without synthesis.
    Bundle(Vec<BundleItem>),
    /// A payload with a tag this version does not know. `body` is the full
    /// wire value and is written back unchanged.
    Opaque { kind: String, body: Value },
}

impl Payload {
    /// The logical result-type tag of this payload.
    pub fn result_type(&self) -> &str {
        match self {
            Payload::Document(_) => KIND_DOCUMENT,
            Payload::Analysis(a) => &a.result_type,
            Payload::Report(_) => KIND_REPORT,
            Payload::Bundle(_) => KIND_BUNDLE,
            Payload::Opaque { kind, .. } => kind,
        }
    }

    /// The wire tag of this payload.
    pub fn kind(&self) -> &str {
        match self {
            Payload::Document(_) => KIND_DOCUMENT,
            Payload::Analysis(_) => KIND_ANALYSIS,
            Payload::Report(_) => KIND_REPORT,
            Payload::Bundle(_) => KIND_BUNDLE,
            Payload::Opaque { kind, .. } => kind,
        }
    }

    pub fn as_document(&self) -> Option<&DocumentRef> {
        match self {
            Payload::Document(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_analysis(&self) -> Option<&AnalysisResult> {
        match self {
            Payload::Analysis(a) => Some(a),
            _ => None,
        }
    }

    /// The generic value tree that field paths are resolved against.
    ///
    /// Analysis results expose their `data`, reports their `metrics`, bundles
    /// an array of member views, and opaque payloads their raw body.
    pub fn field_view(&self) -> Cow<'_, Value> {
        match self {
            Payload::Analysis(a) => Cow::Borrowed(&a.data),
            Payload::Opaque { body, .. } => Cow::Borrowed(body),
            Payload::Report(r) => Cow::Owned(Value::Object(
                r.metrics.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            )),
            Payload::Document(d) => Cow::Owned(serde_json::to_value(d).unwrap_or(Value::Null)),
            Payload::Bundle(items) => Cow::Owned(Value::Array(
                items
                    .iter()
                    .map(|item| item.payload.field_view().into_owned())
                    .collect(),
            )),
        }
    }

    /// Resolve a dot-notation path against [`field_view`](Self::field_view).
    pub fn lookup(&self, path: &str) -> Option<Value> {
        let view = self.field_view();
        walk_path(&view, path).cloned()
    }

    fn to_wire(&self) -> Result<Value, serde_json::Error> {
        let (kind, mut body) = match self {
            Payload::Document(d) => (
                KIND_DOCUMENT,
                serde_json::to_value(DocumentBody { document: d.clone() })?,
            ),
            Payload::Analysis(a) => (KIND_ANALYSIS, serde_json::to_value(a)?),
            Payload::Report(r) => (KIND_REPORT, serde_json::to_value(r)?),
            Payload::Bundle(items) => (
                KIND_BUNDLE,
                serde_json::to_value(BundleBody {
                    items: items.clone(),
                })?,
            ),
            Payload::Opaque { kind, body } => {
                let mut body = body.clone();
                if let Value::Object(map) = &mut body {
                    map.entry(KIND_FIELD)
                        .or_insert_with(|| Value::String(kind.clone()));
                }
                return Ok(body);
            }
        };
        if let Value::Object(map) = &mut body {
            map.insert(KIND_FIELD.to_string(), Value::String(kind.to_string()));
        }
        Ok(body)
    }

    fn from_wire(value: Value) -> Result<Self, serde_json::Error> {
        let kind = value
            .get(KIND_FIELD)
            .and_then(Value::as_str)
            .map(str::to_string);

        match kind.as_deref() {
            Some(KIND_DOCUMENT) => {
                let body: DocumentBody = serde_json::from_value(value)?;
                Ok(Payload::Document(body.document))
            }
            Some(KIND_ANALYSIS) => Ok(Payload::Analysis(serde_json::from_value(value)?)),
            Some(KIND_REPORT) => Ok(Payload::Report(serde_json::from_value(value)?)),
            Some(KIND_BUNDLE) => {
                let body: BundleBody = serde_json::from_value(value)?;
                Ok(Payload::Bundle(body.items))
            }
            Some(other) => Ok(Payload::Opaque {
                kind: other.to_string(),
                body: value,
            }),
            None => Ok(Payload::Opaque {
                kind: "unknown".to_string(),
                body: value,
            }),
        }
    }
}

impl Serialize for Payload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_wire()
            .map_err(S::Error::custom)?
            .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Payload {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Payload::from_wire(value).map_err(D::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Path walking
// ---------------------------------------------------------------------------

/// Resolve a dot-notation path (`metrics.revenue`, `segments.0.name`) in a
/// JSON value tree. Numeric segments index into arrays. An empty path
/// resolves to the root.
pub fn walk_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let path = path.trim();
    if path.is_empty() {
        return Some(root);
    }
    path.split('.').try_fold(root, |node, segment| match node {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn analysis(score: i64) -> Payload {
        Payload::Analysis(AnalysisResult {
            result_type: "financial_health".into(),
            run_id: "run-1".into(),
            data: json!({"score": score, "segments": [{"name": "cloud"}]}),
        })
    }

    #[test]
    fn test_analysis_payload_is_tagged_on_the_wire() {
        let value = serde_json::to_value(analysis(420)).unwrap();
        assert_eq!(value["kind"], "analysis");
        assert_eq!(value["result_type"], "financial_health");
        let back: Payload = serde_json::from_value(value).unwrap();
        assert_eq!(back, analysis(420));
    }

    #[test]
    fn test_document_keeps_its_own_kind() {
        let doc = Payload::Document(DocumentRef {
            entity: "ACME".into(),
            period: Period::Year(2024),
            kind: "annual_report".into(),
            uri: "filings/ACME/2024/annual_report.pdf".into(),
            checksum: Some("abc123".into()),
        });
        let value = serde_json::to_value(&doc).unwrap();
        assert_eq!(value["kind"], "document");
        assert_eq!(value["document"]["kind"], "annual_report");

        let back: Payload = serde_json::from_value(value).unwrap();
        assert_eq!(back, doc);
        assert_eq!(back.as_document().unwrap().kind, "annual_report");
    }

    #[test]
    fn test_unknown_kind_survives_as_opaque() {
        let wire = json!({"kind": "sentiment_v9", "tone": "upbeat", "nested": {"a": 1}});
        let payload: Payload = serde_json::from_value(wire.clone()).unwrap();
        match &payload {
            Payload::Opaque { kind, .. } => assert_eq!(kind, "sentiment_v9"),
            other => panic!("expected opaque payload, got {other:?}"),
        }
        assert_eq!(serde_json::to_value(&payload).unwrap(), wire);
    }

    #[test]
    fn test_bundle_nests_member_payloads() {
        let bundle = Payload::Bundle(vec![BundleItem {
            entity: "A".into(),
            period: Period::Year(2024),
            payload: analysis(1),
        }]);
        let value = serde_json::to_value(&bundle).unwrap();
        assert_eq!(value["kind"], "bundle");
        assert_eq!(value["items"][0]["payload"]["kind"], "analysis");
        let back: Payload = serde_json::from_value(value).unwrap();
        assert_eq!(back, bundle);
    }

    #[test]
    fn test_walk_path_handles_objects_and_arrays() {
        let v = json!({"a": {"b": [10, {"c": "x"}]}});
        assert_eq!(walk_path(&v, "a.b.0"), Some(&json!(10)));
        assert_eq!(walk_path(&v, "a.b.1.c"), Some(&json!("x")));
        assert_eq!(walk_path(&v, "a.missing"), None);
        assert_eq!(walk_path(&v, "a.b.x"), None);
        assert_eq!(walk_path(&v, ""), Some(&v));
    }

    #[test]
    fn test_lookup_reads_analysis_data_and_report_metrics() {
        assert_eq!(analysis(7).lookup("score"), Some(json!(7)));
        assert_eq!(analysis(7).lookup("segments.0.name"), Some(json!("cloud")));

        let mut metrics = IndexMap::new();
        metrics.insert("margin".to_string(), json!(0.25));
        let report = Payload::Report(Report {
            metrics,
            member_count: 2,
        });
        assert_eq!(report.lookup("margin"), Some(json!(0.25)));
    }
}
