//! Filesystem export sink.
//!
//! Writes export files into one flat directory. Each file is written to a
//! temporary sibling first and renamed into place, so a reader never sees a
//! partially written export.

use std::path::{Path, PathBuf};

use gridflow_core::provider::export::{ExportError, ExportSink};

/// `ExportSink` writing into a local directory.
pub struct FsExportSink {
    dir: PathBuf,
}

impl FsExportSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn validate_file_name(file_name: &str) -> Result<(), ExportError> {
    let plain = !file_name.is_empty()
        && file_name != "."
        && file_name != ".."
        && !file_name.contains(['/', '\\'])
        && !file_name.starts_with('.');
    if plain {
        Ok(())
    } else {
        Err(ExportError::Write(format!("invalid export file name: {file_name:?}")))
    }
}

impl ExportSink for FsExportSink {
    async fn write(&self, file_name: &str, contents: &[u8]) -> Result<String, ExportError> {
        validate_file_name(file_name)?;

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| ExportError::Write(format!("create {}: {e}", self.dir.display())))?;

        let target = self.dir.join(file_name);
        let staging = self.dir.join(format!(".{file_name}.tmp"));

        tokio::fs::write(&staging, contents)
            .await
            .map_err(|e| ExportError::Write(format!("write {}: {e}", staging.display())))?;
        if let Err(e) = tokio::fs::rename(&staging, &target).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(ExportError::Write(format!("rename to {}: {e}", target.display())));
        }

        tracing::debug!(path = %target.display(), bytes = contents.len(), "export file written");
        Ok(target.display().to_string())
    }
}
