//! Analysis service port.
//!
//! An analysis call turns some input (a document, several documents, prior
//! results, or a rendered prompt) into an [`AnalysisResult`]. Every call is
//! addressed by an [`AnalysisKey`]; the service's `find_existing` lookup uses
//! the same key, which is what makes resuming a run cheap.

use std::future::Future;
use std::pin::Pin;

use gridflow_types::payload::{AnalysisResult, BundleItem, DocumentRef};
use gridflow_types::period::Period;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// Worker bound used when a service does not report its credential count.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Identity of one unit of analysis work, used as the cache key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisKey {
    pub entity: String,
    pub period: Period,
    pub analysis_kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

impl AnalysisKey {
    /// Stable string form, usable as a map key.
    pub fn fingerprint(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!("{}|{}|{}", self.entity, self.period, self.analysis_kind)
        })
    }
}

/// What the service is asked to analyze.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnalysisInput {
    Document { document: DocumentRef },
    /// Every period of one entity, combined.
    Documents { documents: Vec<DocumentRef> },
    /// Prior results to synthesize.
    Payloads { items: Vec<BundleItem> },
    Prompt { text: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisRequest {
    pub key: AnalysisKey,
    pub input: AnalysisInput,
}

#[derive(Debug, Clone, Error)]
pub enum AnalysisError {
    /// Rate limits, timeouts, upstream hiccups. Retried with backoff.
    #[error("transient analysis failure: {0}")]
    Transient(String),

    /// The request can never succeed as issued.
    #[error("analysis failed: {0}")]
    Fatal(String),
}

impl AnalysisError {
    pub fn is_transient(&self) -> bool {
        matches!(self, AnalysisError::Transient(_))
    }
}

/// The analysis service consumed by analysis and aggregation steps.
pub trait AnalysisService: Send + Sync {
    /// Idempotent cache lookup for a previously computed result.
    fn find_existing(
        &self,
        key: &AnalysisKey,
    ) -> impl Future<Output = Result<Option<AnalysisResult>, AnalysisError>> + Send;

    /// Run a fresh analysis.
    fn analyze(
        &self,
        request: &AnalysisRequest,
    ) -> impl Future<Output = Result<AnalysisResult, AnalysisError>> + Send;

    /// Number of calls the service can usefully serve at once (typically the
    /// number of API credentials behind its rate limiter).
    fn concurrency_hint(&self) -> usize {
        DEFAULT_CONCURRENCY
    }
}

/// Object-safe version of [`AnalysisService`].
pub trait AnalysisServiceDyn: Send + Sync {
    fn find_existing_boxed<'a>(
        &'a self,
        key: &'a AnalysisKey,
    ) -> Pin<Box<dyn Future<Output = Result<Option<AnalysisResult>, AnalysisError>> + Send + 'a>>;

    fn analyze_boxed<'a>(
        &'a self,
        request: &'a AnalysisRequest,
    ) -> Pin<Box<dyn Future<Output = Result<AnalysisResult, AnalysisError>> + Send + 'a>>;

    fn concurrency_hint(&self) -> usize;
}

impl<T: AnalysisService> AnalysisServiceDyn for T {
    fn find_existing_boxed<'a>(
        &'a self,
        key: &'a AnalysisKey,
    ) -> Pin<Box<dyn Future<Output = Result<Option<AnalysisResult>, AnalysisError>> + Send + 'a>> {
        Box::pin(self.find_existing(key))
    }

    fn analyze_boxed<'a>(
        &'a self,
        request: &'a AnalysisRequest,
    ) -> Pin<Box<dyn Future<Output = Result<AnalysisResult, AnalysisError>> + Send + 'a>> {
        Box::pin(self.analyze(request))
    }

    fn concurrency_hint(&self) -> usize {
        AnalysisService::concurrency_hint(self)
    }
}
