//! Root crate facade for the ScriptSync sync engine and document server.

pub use scriptsync_core::{
    bus, cache, clock, config, constants, events, models, prefs, queue, session, state, store,
    text, trigger, AppError, Config, Content, Database, Document, DocumentId, DocumentPatch,
    DocumentStore, EventBus, FlushOutcome, MemoryStore, PatchQueue, PatchReason, Session,
    SessionError, StoreError, SyncConfig, SyncError, SyncEvent, Visibility,
};
pub use scriptsync_server::{create_app, serve_router, AppState};
