//! Unified diff of generated documents against their archived copies, for
//! `kbsync diff`.
//!
//! The object store holds the copy published by the last sync, so the diff
//! shows exactly what the next sync would change. Nothing is written.

use serde::{Deserialize, Serialize};
use similar::TextDiff;

use kbsync_core::types::{ConfigId, ConfigurationRecord};
use kbsync_renderer::GeneratedDocument;

use crate::object_store::{object_key, ObjectStore};
use crate::SyncError;

/// A single document diff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentDiff {
    pub name: String,
    pub object_key: String,
    /// `false` when no archived copy exists yet.
    pub archived: bool,
    pub unified_diff: String,
}

/// Diff result for a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigDiff {
    pub config_id: ConfigId,
    /// Documents whose content differs from the archive.
    pub diffs: Vec<DocumentDiff>,
    pub unchanged: usize,
}

impl ConfigDiff {
    pub fn is_clean(&self) -> bool {
        self.diffs.is_empty()
    }
}

/// Compare `documents` with the archived copy of each.
pub async fn diff_documents(
    record: &ConfigurationRecord,
    documents: &[GeneratedDocument],
    store: &dyn ObjectStore,
) -> Result<ConfigDiff, SyncError> {
    let mut diffs = Vec::new();
    let mut unchanged = 0;
    for doc in documents {
        let key = object_key(&record.business.id, &doc.name);
        let archived = store.get(&key).await?;
        let existing = archived
            .as_deref()
            .map(|bytes| normalize_line_endings(&String::from_utf8_lossy(bytes)))
            .unwrap_or_default();
        if archived.is_some() && existing == doc.content {
            unchanged += 1;
            continue;
        }

        let old_header = format!("a/{}", doc.name);
        let new_header = format!("b/{}", doc.name);
        let unified = TextDiff::from_lines(&existing, &doc.content)
            .unified_diff()
            .header(&old_header, &new_header)
            .context_radius(3)
            .to_string();

        diffs.push(DocumentDiff {
            name: doc.name.clone(),
            object_key: key,
            archived: archived.is_some(),
            unified_diff: unified,
        });
    }

    Ok(ConfigDiff {
        config_id: record.id.clone(),
        diffs,
        unchanged,
    })
}

fn normalize_line_endings(content: &str) -> String {
    content.replace("\r\n", "\n")
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use kbsync_core::types::{Business, BusinessId, DocumentSection, SyncState};
    use serde_json::json;

    use crate::fakes::MemoryObjectStore;

    use super::*;

    fn record() -> ConfigurationRecord {
        let now = Utc::now();
        ConfigurationRecord {
            id: ConfigId::from("cfg"),
            business: Business {
                id: BusinessId::from("acme"),
                name: "Acme".to_string(),
                assistant_id: None,
            },
            industry: None,
            version: 1,
            payload: json!({}),
            sync: SyncState::default(),
            created_at: now,
            updated_at: now,
        }
    }

    fn doc(content: &str) -> GeneratedDocument {
        GeneratedDocument {
            section: DocumentSection::Faq,
            name: "acme_faq.md".to_string(),
            content: content.to_string(),
            mime_type: "text/markdown",
        }
    }

    #[tokio::test]
    async fn archived_identical_copy_is_clean() {
        let store = MemoryObjectStore::default();
        store
            .put("archives/acme/acme_faq.md", b"# FAQ\r\n".to_vec(), "text/markdown")
            .await
            .expect("put");
        let diff = diff_documents(&record(), &[doc("# FAQ\n")], &store)
            .await
            .expect("diff");
        assert!(diff.is_clean());
        assert_eq!(diff.unchanged, 1);
    }

    #[tokio::test]
    async fn changed_content_produces_unified_diff() {
        let store = MemoryObjectStore::default();
        store
            .put("archives/acme/acme_faq.md", b"# FAQ\nold\n".to_vec(), "text/markdown")
            .await
            .expect("put");
        let diff = diff_documents(&record(), &[doc("# FAQ\nnew\n")], &store)
            .await
            .expect("diff");
        let d = &diff.diffs[0];
        assert!(d.archived);
        assert!(d.unified_diff.contains("--- a/acme_faq.md"));
        assert!(d.unified_diff.contains("+++ b/acme_faq.md"));
        assert!(d.unified_diff.contains("-old"));
        assert!(d.unified_diff.contains("+new"));
    }

    #[tokio::test]
    async fn missing_archive_shows_whole_document_as_added() {
        let store = MemoryObjectStore::default();
        let diff = diff_documents(&record(), &[doc("# FAQ\n")], &store)
            .await
            .expect("diff");
        assert!(!diff.diffs[0].archived);
        assert!(diff.diffs[0].unified_diff.contains("+# FAQ"));
    }
}
