//! Document retrieval port.

use std::future::Future;
use std::pin::Pin;

use gridflow_types::payload::DocumentRef;
use gridflow_types::period::Period;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum DocumentError {
    /// The store could not be reached; worth retrying.
    #[error("document store unavailable: {0}")]
    Unavailable(String),

    #[error("invalid document request: {0}")]
    Invalid(String),
}

impl DocumentError {
    pub fn is_transient(&self) -> bool {
        matches!(self, DocumentError::Unavailable(_))
    }
}

/// Returns a cached or freshly fetched document, or `None` when the document
/// does not exist. Implementations must be idempotent.
pub trait DocumentSource: Send + Sync {
    fn fetch(
        &self,
        entity: &str,
        period: &Period,
        kind: &str,
    ) -> impl Future<Output = Result<Option<DocumentRef>, DocumentError>> + Send;
}

/// Object-safe version of [`DocumentSource`].
pub trait DocumentSourceDyn: Send + Sync {
    fn fetch_boxed<'a>(
        &'a self,
        entity: &'a str,
        period: &'a Period,
        kind: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<DocumentRef>, DocumentError>> + Send + 'a>>;
}

impl<T: DocumentSource> DocumentSourceDyn for T {
    fn fetch_boxed<'a>(
        &'a self,
        entity: &'a str,
        period: &'a Period,
        kind: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<DocumentRef>, DocumentError>> + Send + 'a>> {
        Box::pin(self.fetch(entity, period, kind))
    }
}
