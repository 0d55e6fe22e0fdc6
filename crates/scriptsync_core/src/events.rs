//! Lifecycle notifications published on the session bus.

use crate::bus::{BusError, EventBus};
use crate::clock::Stamp;
use crate::error::FailureKind;
use crate::models::{Content, Document, DocumentId, PatchReason};
use std::time::Duration;
use tracing::warn;

pub const DOCUMENT_DIRTY: &str = "document:dirty";
pub const DOCUMENT_SAVING: &str = "document:saving";
pub const DOCUMENT_SAVED: &str = "document:saved";
pub const DOCUMENT_ERROR: &str = "document:error";
pub const DOCUMENT_CONFLICT: &str = "document:conflict";
pub const DOCUMENT_SELECTED: &str = "document:selected";
pub const DOCUMENT_UPDATED: &str = "document:updated";
pub const DOCUMENT_CREATED: &str = "document:created";
pub const DOCUMENT_DELETED: &str = "document:deleted";
pub const DOCUMENTS_LIST_UPDATED: &str = "documents:list-updated";
pub const CONTENT_CHANGED: &str = "content:changed";
pub const SESSION_LOGOUT: &str = "session:logout";

/// Payload carried by every topic on the sync bus.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// A patch was queued and applied locally.
    Dirty {
        id: DocumentId,
        reason: PatchReason,
        fields: Vec<&'static str>,
    },
    /// A flush started for the given base version.
    Saving { id: DocumentId, version: u64 },
    /// The document is in sync. `moot` marks a flush resolved without a write.
    Saved {
        id: DocumentId,
        version: u64,
        moot: bool,
    },
    /// A flush failed; the patch is still queued.
    Error {
        id: DocumentId,
        kind: FailureKind,
        message: String,
        /// Delay the queue recommends before the next attempt.
        retry_in: Duration,
    },
    Conflict {
        id: DocumentId,
        local_version: u64,
        server_version: u64,
    },
    Selected { id: Option<DocumentId> },
    Updated { id: DocumentId, stamp: Stamp },
    Created { document: Document },
    Deleted { id: DocumentId },
    ListUpdated { count: usize },
    /// Content produced outside direct typing, routed through the sync trigger.
    ContentChanged { id: DocumentId, content: Content },
    Logout { reason: String },
}

impl SyncEvent {
    /// Topic this event is published on.
    pub fn topic(&self) -> &'static str {
        match self {
            Self::Dirty { .. } => DOCUMENT_DIRTY,
            Self::Saving { .. } => DOCUMENT_SAVING,
            Self::Saved { .. } => DOCUMENT_SAVED,
            Self::Error { .. } => DOCUMENT_ERROR,
            Self::Conflict { .. } => DOCUMENT_CONFLICT,
            Self::Selected { .. } => DOCUMENT_SELECTED,
            Self::Updated { .. } => DOCUMENT_UPDATED,
            Self::Created { .. } => DOCUMENT_CREATED,
            Self::Deleted { .. } => DOCUMENT_DELETED,
            Self::ListUpdated { .. } => DOCUMENTS_LIST_UPDATED,
            Self::ContentChanged { .. } => CONTENT_CHANGED,
            Self::Logout { .. } => SESSION_LOGOUT,
        }
    }

    /// Document this event concerns, if any.
    pub fn document_id(&self) -> Option<&DocumentId> {
        match self {
            Self::Dirty { id, .. }
            | Self::Saving { id, .. }
            | Self::Saved { id, .. }
            | Self::Error { id, .. }
            | Self::Conflict { id, .. }
            | Self::Updated { id, .. }
            | Self::Deleted { id }
            | Self::ContentChanged { id, .. } => Some(id),
            Self::Created { document } => Some(&document.id),
            Self::Selected { id } => id.as_ref(),
            Self::ListUpdated { .. } | Self::Logout { .. } => None,
        }
    }
}

pub type SyncBus = EventBus<SyncEvent>;

/// Publish `event` on its topic.
///
/// A destroyed bus means the session is gone; the event is dropped with a
/// warning instead of failing the caller.
pub fn emit(bus: &SyncBus, event: SyncEvent) -> usize {
    let topic = event.topic();
    match bus.publish(topic, &event) {
        Ok(invoked) => invoked,
        Err(BusError::Destroyed) => {
            warn!(topic, "dropping event published after bus teardown");
            0
        }
        Err(err) => {
            warn!(topic, "failed to publish event: {}", err);
            0
        }
    }
}
