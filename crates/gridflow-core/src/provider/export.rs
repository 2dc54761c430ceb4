//! Export file sink port.

use std::future::Future;
use std::pin::Pin;

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ExportError {
    #[error("export write failed: {0}")]
    Write(String),
}

/// Persists rendered export files.
pub trait ExportSink: Send + Sync {
    /// Write `contents` under `file_name` and return the full path (or URI)
    /// the file can be retrieved from.
    fn write(
        &self,
        file_name: &str,
        contents: &[u8],
    ) -> impl Future<Output = Result<String, ExportError>> + Send;
}

/// Object-safe version of [`ExportSink`].
pub trait ExportSinkDyn: Send + Sync {
    fn write_boxed<'a>(
        &'a self,
        file_name: &'a str,
        contents: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = Result<String, ExportError>> + Send + 'a>>;
}

impl<T: ExportSink> ExportSinkDyn for T {
    fn write_boxed<'a>(
        &'a self,
        file_name: &'a str,
        contents: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = Result<String, ExportError>> + Send + 'a>> {
        Box::pin(self.write(file_name, contents))
    }
}
