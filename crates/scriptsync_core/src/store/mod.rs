//! Remote document store contract and its client-side implementations.

use crate::error::StoreError;
use crate::models::{CreateDocumentRequest, DocumentId, DocumentRecord, UpdateDocumentRequest};
use async_trait::async_trait;

#[cfg(feature = "http")]
pub mod http;
pub mod memory;

#[cfg(feature = "http")]
pub use http::HttpStore;
pub use memory::MemoryStore;

/// Remote document store the sync engine writes back to.
///
/// Implementations return lenient [`DocumentRecord`]s; callers standardize
/// them before caching so malformed responses surface as
/// [`StoreError::InvalidResponse`].
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn list(&self) -> Result<Vec<DocumentRecord>, StoreError>;

    async fn get(&self, id: &DocumentId) -> Result<DocumentRecord, StoreError>;

    async fn create(&self, request: &CreateDocumentRequest) -> Result<DocumentRecord, StoreError>;

    /// Write a new revision on top of `request.version`.
    ///
    /// # Errors
    /// [`StoreError::Conflict`] when the store is no longer at that version.
    async fn update(
        &self,
        id: &DocumentId,
        request: &UpdateDocumentRequest,
    ) -> Result<DocumentRecord, StoreError>;

    async fn delete(&self, id: &DocumentId) -> Result<(), StoreError>;
}
