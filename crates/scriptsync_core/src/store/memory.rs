//! In-process document store with the same version rules as the server.

use super::DocumentStore;
use crate::error::StoreError;
use crate::models::{
    CreateDocumentRequest, Document, DocumentId, DocumentRecord, UpdateDocumentRequest,
};
use crate::text::normalize_optional_nonempty;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Version-checked store held entirely in memory.
///
/// Useful for offline sessions and tests that do not need a server.
#[derive(Default)]
pub struct MemoryStore {
    documents: Mutex<HashMap<DocumentId, Document>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn documents(&self) -> MutexGuard<'_, HashMap<DocumentId, Document>> {
        self.documents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Seed a document as-is, including its version.
    pub fn insert(&self, document: Document) {
        self.documents().insert(document.id.clone(), document);
    }

    pub fn snapshot(&self, id: &DocumentId) -> Option<Document> {
        self.documents().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.documents().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn list(&self) -> Result<Vec<DocumentRecord>, StoreError> {
        let mut documents: Vec<Document> = self.documents().values().cloned().collect();
        documents.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(documents.iter().map(DocumentRecord::from).collect())
    }

    async fn get(&self, id: &DocumentId) -> Result<DocumentRecord, StoreError> {
        self.documents()
            .get(id)
            .map(DocumentRecord::from)
            .ok_or(StoreError::NotFound)
    }

    async fn create(&self, request: &CreateDocumentRequest) -> Result<DocumentRecord, StoreError> {
        let mut document = Document::new(
            request.title.clone().unwrap_or_default(),
            request.content.clone().unwrap_or_default(),
        );
        document.author = normalize_optional_nonempty(request.author.clone()).unwrap_or_default();
        document.description = request.description.clone().unwrap_or_default();
        document.visibility = request.visibility.unwrap_or_default();
        let record = DocumentRecord::from(&document);
        self.insert(document);
        Ok(record)
    }

    async fn update(
        &self,
        id: &DocumentId,
        request: &UpdateDocumentRequest,
    ) -> Result<DocumentRecord, StoreError> {
        let mut documents = self.documents();
        let document = documents.get_mut(id).ok_or(StoreError::NotFound)?;
        if document.version != request.version {
            return Err(StoreError::Conflict {
                current_version: document.version,
            });
        }
        document.content = request.content.clone();
        document.title = request.title.clone();
        if let Some(author) = &request.author {
            document.author = author.clone();
        }
        if let Some(description) = &request.description {
            document.description = description.clone();
        }
        if let Some(visibility) = request.visibility {
            document.visibility = visibility;
        }
        document.version += 1;
        document.updated_at = Utc::now();
        Ok(DocumentRecord::from(&*document))
    }

    async fn delete(&self, id: &DocumentId) -> Result<(), StoreError> {
        self.documents()
            .remove(id)
            .map(|_| ())
            .ok_or(StoreError::NotFound)
    }
}
