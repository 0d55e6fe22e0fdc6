//! In-memory document cache: the client's source of truth.

use crate::clock::{LocalClock, Stamp};
use crate::constants::DEFAULT_DOCUMENT_TITLE;
use crate::error::{StoreError, SyncError};
use crate::models::{
    Document, DocumentId, DocumentPatch, DocumentRecord, DocumentSummary, Visibility,
};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Default)]
struct CacheState {
    documents: HashMap<DocumentId, Document>,
    current: Option<DocumentId>,
}

/// Known documents plus one "current document" slot.
///
/// Every write tags the entry with a stamp from the cache's [`LocalClock`].
/// The current pointer always names an entry present in the map.
#[derive(Default)]
pub struct DocumentCache {
    inner: Mutex<CacheState>,
    clock: LocalClock,
}

impl DocumentCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, CacheState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take a stamp from the cache clock.
    pub fn now(&self) -> Stamp {
        self.clock.now()
    }

    /// Replace the whole cache with `documents`.
    ///
    /// The current pointer survives only when its document is still present.
    pub fn load_all(&self, documents: Vec<Document>) {
        let mut state = self.state();
        state.documents.clear();
        for mut document in documents {
            document.local_stamp = self.clock.now();
            state.documents.insert(document.id.clone(), document);
        }
        if let Some(current) = state.current.clone() {
            if !state.documents.contains_key(&current) {
                state.current = None;
            }
        }
    }

    /// Insert or replace one document, as an external update.
    ///
    /// # Returns
    /// The fresh stamp assigned to the entry.
    pub fn upsert(&self, mut document: Document) -> Stamp {
        let stamp = self.clock.now();
        document.local_stamp = stamp;
        self.state().documents.insert(document.id.clone(), document);
        stamp
    }

    /// Replace one document, tagging it with a caller-chosen stamp.
    pub(crate) fn replace_with_stamp(&self, mut document: Document, stamp: Stamp) {
        document.local_stamp = stamp;
        self.state().documents.insert(document.id.clone(), document);
    }

    /// Apply `patch` to a cached document and tag it with `stamp`.
    ///
    /// # Errors
    /// Returns [`SyncError::UnknownDocument`] when `id` is not cached.
    pub(crate) fn apply_patch(
        &self,
        id: &DocumentId,
        patch: &DocumentPatch,
        stamp: Stamp,
    ) -> Result<Document, SyncError> {
        let mut state = self.state();
        let document = state
            .documents
            .get_mut(id)
            .ok_or_else(|| SyncError::UnknownDocument(id.to_string()))?;
        patch.apply_to(document);
        document.local_stamp = stamp;
        Ok(document.clone())
    }

    pub fn get(&self, id: &DocumentId) -> Option<Document> {
        self.state().documents.get(id).cloned()
    }

    pub fn contains(&self, id: &DocumentId) -> bool {
        self.state().documents.contains_key(id)
    }

    pub fn stamp_of(&self, id: &DocumentId) -> Option<Stamp> {
        self.state().documents.get(id).map(|doc| doc.local_stamp)
    }

    /// Remove a document, clearing the current pointer when it referenced it.
    pub fn remove(&self, id: &DocumentId) -> Option<Document> {
        let mut state = self.state();
        let removed = state.documents.remove(id);
        if state.current.as_ref() == Some(id) {
            state.current = None;
        }
        removed
    }

    /// Point the current slot at `id`, or clear it with `None`.
    ///
    /// # Errors
    /// Returns [`SyncError::UnknownDocument`] when `id` is not cached.
    pub fn set_current(&self, id: Option<&DocumentId>) -> Result<(), SyncError> {
        let mut state = self.state();
        match id {
            Some(id) if !state.documents.contains_key(id) => {
                Err(SyncError::UnknownDocument(id.to_string()))
            }
            Some(id) => {
                state.current = Some(id.clone());
                Ok(())
            }
            None => {
                state.current = None;
                Ok(())
            }
        }
    }

    pub fn current_id(&self) -> Option<DocumentId> {
        self.state().current.clone()
    }

    pub fn current(&self) -> Option<Document> {
        let state = self.state();
        state
            .current
            .as_ref()
            .and_then(|id| state.documents.get(id))
            .cloned()
    }

    /// All documents, most recently updated first.
    pub fn list(&self) -> Vec<Document> {
        let mut documents: Vec<Document> = self.state().documents.values().cloned().collect();
        documents.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        documents
    }

    pub fn summaries(&self) -> Vec<DocumentSummary> {
        self.list().iter().map(DocumentSummary::from).collect()
    }

    pub fn clear(&self) {
        let mut state = self.state();
        state.documents.clear();
        state.current = None;
    }

    pub fn len(&self) -> usize {
        self.state().documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Turn a remote record into a cache-ready document.
///
/// Missing optional fields get defaults and visibility is normalized.
///
/// # Errors
/// Returns [`StoreError::InvalidResponse`] when the record has no usable id or
/// no version.
pub fn standardize(record: DocumentRecord) -> Result<Document, StoreError> {
    let id = record
        .id
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| StoreError::InvalidResponse("document id is missing".to_string()))?;
    let version = record.version.ok_or_else(|| {
        StoreError::InvalidResponse(format!("document '{}' has no version", id))
    })?;
    let title = record
        .title
        .filter(|title| !title.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_DOCUMENT_TITLE.to_string());
    let created_at = record.created_at.unwrap_or_else(Utc::now);
    Ok(Document {
        id: DocumentId::new(id),
        title,
        author: record.author.unwrap_or_default(),
        description: record.description.unwrap_or_default(),
        visibility: record
            .visibility
            .as_deref()
            .map(Visibility::normalize)
            .unwrap_or_default(),
        content: record.content.unwrap_or_default(),
        version,
        created_at,
        updated_at: record.updated_at.unwrap_or(created_at),
        local_stamp: Stamp::default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Content;

    fn doc(id: &str, title: &str) -> Document {
        let mut document = Document::new(title, Content::text(""));
        document.id = DocumentId::from(id);
        document
    }

    #[test]
    fn upsert_assigns_increasing_stamps() {
        let cache = DocumentCache::new();
        let first = cache.upsert(doc("a", "A"));
        let second = cache.upsert(doc("a", "A2"));
        assert!(second > first);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&"a".into()).map(|d| d.title), Some("A2".into()));
        assert_eq!(cache.stamp_of(&"a".into()), Some(second));
    }

    #[test]
    fn current_pointer_tracks_membership() {
        let cache = DocumentCache::new();
        cache.upsert(doc("a", "A"));
        assert_eq!(
            cache.set_current(Some(&"missing".into())),
            Err(SyncError::UnknownDocument("missing".to_string()))
        );
        cache.set_current(Some(&"a".into())).expect("select");
        assert_eq!(cache.current().map(|d| d.id), Some("a".into()));

        cache.remove(&"a".into());
        assert!(cache.current_id().is_none());
    }

    #[test]
    fn load_all_drops_stale_current_pointer() {
        let cache = DocumentCache::new();
        cache.upsert(doc("a", "A"));
        cache.set_current(Some(&"a".into())).expect("select");
        cache.load_all(vec![doc("b", "B")]);
        assert!(cache.current_id().is_none());
        assert!(!cache.contains(&"a".into()));
        assert!(cache.stamp_of(&"b".into()).is_some());
    }

    #[test]
    fn apply_patch_updates_fields_and_current_view() {
        let cache = DocumentCache::new();
        cache.upsert(doc("a", "A"));
        cache.set_current(Some(&"a".into())).expect("select");
        let stamp = cache.now();
        cache
            .apply_patch(
                &"a".into(),
                &DocumentPatch::default().with_title("Renamed"),
                stamp,
            )
            .expect("apply");
        let current = cache.current().expect("current");
        assert_eq!(current.title, "Renamed");
        assert_eq!(current.local_stamp, stamp);

        assert!(matches!(
            cache.apply_patch(&"zzz".into(), &DocumentPatch::default(), stamp),
            Err(SyncError::UnknownDocument(_))
        ));
    }

    #[test]
    fn list_orders_newest_first() {
        let cache = DocumentCache::new();
        let mut older = doc("old", "Old");
        older.updated_at = Utc::now() - chrono::Duration::minutes(5);
        cache.upsert(older);
        cache.upsert(doc("new", "New"));
        let ids: Vec<String> = cache.list().into_iter().map(|d| d.id.to_string()).collect();
        assert_eq!(ids, vec!["new", "old"]);
    }

    #[test]
    fn standardize_fills_defaults_and_normalizes() {
        let document = standardize(DocumentRecord {
            id: Some("42".to_string()),
            visibility: Some(" Public ".to_string()),
            version: Some(3),
            ..DocumentRecord::default()
        })
        .expect("standardize");
        assert_eq!(document.title, DEFAULT_DOCUMENT_TITLE);
        assert_eq!(document.visibility, Visibility::Public);
        assert_eq!(document.content, Content::text(""));
        assert_eq!(document.updated_at, document.created_at);
    }

    #[test]
    fn standardize_rejects_missing_id_or_version() {
        let missing_id = standardize(DocumentRecord {
            id: Some("  ".to_string()),
            version: Some(1),
            ..DocumentRecord::default()
        });
        assert!(matches!(missing_id, Err(StoreError::InvalidResponse(_))));

        let missing_version = standardize(DocumentRecord {
            id: Some("42".to_string()),
            ..DocumentRecord::default()
        });
        assert!(matches!(missing_version, Err(StoreError::InvalidResponse(_))));
    }
}
