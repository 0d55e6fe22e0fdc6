//! Data models for documents, patches, and API payloads.

/// Document, content, and request/response payloads.
pub mod document;
/// Partial updates and queue entries.
pub mod patch;


pub use document::{
    Content, CreateDocumentRequest, Document, DocumentId, DocumentRecord, DocumentSummary, Lines,
    ListQuery, ScriptLine, UpdateDocumentRequest, Visibility,
};
pub use patch::{DocumentPatch, PatchReason, PendingPatch};
