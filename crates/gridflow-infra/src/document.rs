//! Filesystem document source.
//!
//! Documents are laid out as `{root}/{entity}/{period}/{kind}.{ext}`, e.g.
//! `filings/ACME/2024/annual_report.pdf`. The returned `DocumentRef` carries
//! the file path as its URI and the SHA-256 of the file contents.

use std::path::{Path, PathBuf};

use gridflow_core::provider::document::{DocumentError, DocumentSource};
use gridflow_types::payload::DocumentRef;
use gridflow_types::period::Period;
use sha2::{Digest, Sha256};

/// `DocumentSource` reading from a local directory tree.
pub struct FsDocumentSource {
    root: PathBuf,
}

impl FsDocumentSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Find `{kind}` or `{kind}.*` inside `dir`. When several extensions
    /// exist, the lexicographically first file name wins.
    async fn locate(&self, dir: &Path, kind: &str) -> Result<Option<PathBuf>, DocumentError> {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(DocumentError::Unavailable(format!("read {}: {e}", dir.display())));
            }
        };

        let mut best: Option<(String, PathBuf)> = None;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| DocumentError::Unavailable(format!("read {}: {e}", dir.display())))?
        {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
                continue;
            };
            let stem = path.file_stem().and_then(|s| s.to_str());
            if name != kind && stem != Some(kind) {
                continue;
            }
            let is_file = entry
                .file_type()
                .await
                .map(|t| t.is_file())
                .unwrap_or(false);
            if !is_file {
                continue;
            }
            if best.as_ref().is_none_or(|(current, _)| name < *current) {
                best = Some((name, path));
            }
        }
        Ok(best.map(|(_, path)| path))
    }
}

fn check_segment(what: &str, value: &str) -> Result<(), DocumentError> {
    let ok = !value.trim().is_empty()
        && value != "."
        && value != ".."
        && !value.contains(['/', '\\']);
    if ok {
        Ok(())
    } else {
        Err(DocumentError::Invalid(format!("invalid {what}: {value:?}")))
    }
}

impl DocumentSource for FsDocumentSource {
    async fn fetch(&self, entity: &str, period: &Period, kind: &str) -> Result<Option<DocumentRef>, DocumentError> {
        let period_key = period.to_string();
        check_segment("entity", entity)?;
        check_segment("period", &period_key)?;
        check_segment("document kind", kind)?;

        let dir = self.root.join(entity).join(&period_key);
        let Some(path) = self.locate(&dir, kind).await? else {
            tracing::debug!(entity, period = %period, kind, "document not found");
            return Ok(None);
        };

        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| DocumentError::Unavailable(format!("read {}: {e}", path.display())))?;
        let checksum = format!("{:x}", Sha256::digest(&bytes));

        Ok(Some(DocumentRef {
            entity: entity.to_string(),
            period: period.clone(),
            kind: kind.to_string(),
            uri: path.display().to_string(),
            checksum: Some(checksum),
        }))
    }
}
