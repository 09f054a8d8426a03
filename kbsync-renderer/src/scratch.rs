//! Per-run scratch directory for staged documents.
//!
//! Documents are written to a private temp directory before upload so the
//! vendor multipart upload can stream from disk. The directory is removed
//! when the [`ScratchDir`] is dropped, on every exit path.

use std::path::{Path, PathBuf};

use tempfile::TempDir;

use crate::engine::GeneratedDocument;
use crate::error::{io_err, RenderError};

/// A generated document with its on-disk staging path.
#[derive(Debug, Clone)]
pub struct StagedDocument {
    pub document: GeneratedDocument,
    pub path: PathBuf,
}

/// RAII scratch area; dropping it deletes everything staged in it.
#[derive(Debug)]
pub struct ScratchDir {
    dir: TempDir,
}

impl ScratchDir {
    pub fn new() -> Result<Self, RenderError> {
        let dir = tempfile::Builder::new()
            .prefix("kbsync-")
            .tempdir()
            .map_err(|e| io_err(std::env::temp_dir(), e))?;
        Ok(ScratchDir { dir })
    }

    /// Create the scratch directory under `parent` instead of the system temp dir.
    pub fn new_in(parent: &Path) -> Result<Self, RenderError> {
        let dir = tempfile::Builder::new()
            .prefix("kbsync-")
            .tempdir_in(parent)
            .map_err(|e| io_err(parent, e))?;
        Ok(ScratchDir { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Write every document to the scratch directory under its own name.
    pub fn stage(&self, documents: &[GeneratedDocument]) -> Result<Vec<StagedDocument>, RenderError> {
        documents
            .iter()
            .map(|document| {
                let path = self.dir.path().join(&document.name);
                std::fs::write(&path, document.content.as_bytes()).map_err(|e| io_err(&path, e))?;
                Ok(StagedDocument {
                    document: document.clone(),
                    path,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kbsync_core::types::DocumentSection;

    fn doc(name: &str) -> GeneratedDocument {
        GeneratedDocument {
            section: DocumentSection::Faq,
            name: name.to_string(),
            content: "# FAQ\n".to_string(),
            mime_type: "text/markdown",
        }
    }

    #[test]
    fn staged_files_are_removed_on_drop() {
        let scratch = ScratchDir::new().expect("scratch");
        let staged = scratch.stage(&[doc("acme_faq.md")]).expect("stage");
        let path = staged[0].path.clone();
        assert_eq!(std::fs::read_to_string(&path).expect("read"), "# FAQ\n");

        let root = scratch.path().to_path_buf();
        drop(scratch);
        assert!(!path.exists());
        assert!(!root.exists());
    }

    #[test]
    fn new_in_uses_parent_directory() {
        let parent = tempfile::TempDir::new().expect("parent");
        let scratch = ScratchDir::new_in(parent.path()).expect("scratch");
        assert!(scratch.path().starts_with(parent.path()));
    }
}
