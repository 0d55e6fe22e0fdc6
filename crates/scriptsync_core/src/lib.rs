//! Core library for ScriptSync: the optimistic write-back sync engine,
//! document models, and server-side storage.

/// Topic-keyed publish/subscribe.
pub mod bus;
/// Client document cache.
pub mod cache;
/// Monotonic local stamps.
pub mod clock;
/// Configuration loading and defaults.
pub mod config;
/// Shared constants.
pub mod constants;
/// Server-side storage layer.
pub mod db;
/// Error types for storage, remote access, and validation.
pub mod error;
/// Lifecycle notifications.
pub mod events;
/// Data models for documents, patches, and API payloads.
pub mod models;
/// Persisted client preferences.
pub mod prefs;
/// Write-back patch queue.
pub mod queue;
/// Session composition root.
pub mod session;
/// Reactive key/value state.
pub mod state;
/// Remote document store contract and implementations.
pub mod store;
/// Text normalization helpers.
pub mod text;
/// Flush scheduling.
pub mod trigger;

#[cfg(test)]
pub(crate) mod test_support;

pub use bus::{BusError, EventBus, OwnerId, Subscription, SubscriptionId};
pub use cache::DocumentCache;
pub use config::{Config, SyncConfig};
pub use db::Database;
pub use error::{AppError, FailureKind, StoreError, SyncError};
pub use events::{SyncBus, SyncEvent};
pub use models::{Content, Document, DocumentId, DocumentPatch, PatchReason, Visibility};
pub use queue::{FlushOutcome, PatchQueue, QueueConfig};
pub use session::{Session, SessionError};
pub use state::StateStore;
pub use store::{DocumentStore, MemoryStore};
#[cfg(feature = "http")]
pub use store::HttpStore;
pub use trigger::{SyncTrigger, TriggerConfig, TriggerDecision};
