//! Per-user session: owns one bus, cache, queue, trigger and state store.

use crate::bus::{BusError, OwnerId};
use crate::cache::{standardize, DocumentCache};
use crate::config::SyncConfig;
use crate::error::{StoreError, SyncError};
use crate::events::{
    emit, SyncBus, SyncEvent, DOCUMENTS_LIST_UPDATED, DOCUMENT_CONFLICT, DOCUMENT_CREATED,
    DOCUMENT_DELETED, DOCUMENT_DIRTY, DOCUMENT_SAVED, DOCUMENT_SELECTED, DOCUMENT_UPDATED,
    SESSION_LOGOUT,
};
use crate::models::{
    Content, CreateDocumentRequest, Document, DocumentId, DocumentPatch, DocumentSummary,
    PatchReason, Visibility,
};
use crate::prefs::{ClientPrefs, CursorSnapshot, PrefsStore};
use crate::queue::{FlushOutcome, PatchQueue, QueueConfig};
use crate::state::{StateStore, CURRENT_DOCUMENT, DOCUMENTS, DOCUMENT_FILTER};
use crate::store::DocumentStore;
use crate::text::contains_case_insensitive;
use crate::trigger::{SyncTrigger, TriggerConfig, TriggerDecision, TriggerError};
use serde_json::Value;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::Handle;


#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error(transparent)]
    Trigger(#[from] TriggerError),
}

/// Pushes cache snapshots into the reactive state store.
#[derive(Clone)]
struct StatePublisher {
    cache: Arc<DocumentCache>,
    state: Arc<StateStore>,
    filter: Arc<Mutex<String>>,
}

impl StatePublisher {
    fn publish(&self) {
        let current = self
            .cache
            .current()
            .and_then(|doc| serde_json::to_value(doc).ok())
            .unwrap_or(Value::Null);
        let filter = self
            .filter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let documents: Vec<DocumentSummary> = self
            .cache
            .summaries()
            .into_iter()
            .filter(|summary| contains_case_insensitive(&summary.title, &filter))
            .collect();
        let documents = serde_json::to_value(documents).unwrap_or(Value::Array(Vec::new()));

        for (key, value) in [
            (CURRENT_DOCUMENT, current),
            (DOCUMENTS, documents),
            (DOCUMENT_FILTER, Value::String(filter)),
        ] {
            if let Err(err) = self.state.set_state(key, value) {
                tracing::warn!(key, "failed to publish state: {}", err);
            }
        }
    }
}

/// Fetch the server copy of one document into the cache as an external update.
///
/// Pending local edits are layered back on top, so the returned document is
/// what the user sees.
async fn refresh_document(
    store: &dyn DocumentStore,
    cache: &DocumentCache,
    queue: &PatchQueue,
    bus: &SyncBus,
    id: &DocumentId,
) -> Result<Document, SessionError> {
    let document = standardize(store.get(id).await?)?;
    cache.upsert(document.clone());
    queue.rebase(id);
    let view = cache.get(id).unwrap_or(document);
    emit(
        bus,
        SyncEvent::Updated {
            id: id.clone(),
            stamp: view.local_stamp,
        },
    );
    Ok(view)
}

/// Composition root for one signed-in user.
///
/// Logout (explicit or after a 401) cancels every timer, drops every pending
/// patch and empties the cache before anything else can be loaded.
pub struct Session {
    bus: Arc<SyncBus>,
    cache: Arc<DocumentCache>,
    store: Arc<dyn DocumentStore>,
    queue: Arc<PatchQueue>,
    trigger: Arc<SyncTrigger>,
    state: Arc<StateStore>,
    prefs: Arc<dyn PrefsStore>,
    publisher: StatePublisher,
    owner: OwnerId,
}

impl Session {
    /// Wire up a session around `store`.
    ///
    /// # Errors
    /// Fails outside a tokio runtime.
    pub fn new(
        store: Arc<dyn DocumentStore>,
        prefs: Arc<dyn PrefsStore>,
        config: &SyncConfig,
    ) -> Result<Self, SessionError> {
        let runtime = Handle::try_current().map_err(|_| TriggerError::NoRuntime)?;
        let bus = Arc::new(SyncBus::new());
        let cache = Arc::new(DocumentCache::new());
        let queue = Arc::new(PatchQueue::new(
            Arc::clone(&cache),
            Arc::clone(&store),
            Arc::clone(&bus),
            QueueConfig::from(config),
        ));
        let trigger = Arc::new(SyncTrigger::new(
            Arc::clone(&queue),
            Arc::clone(&cache),
            Arc::clone(&bus),
            TriggerConfig::from(config),
        )?);
        let state = Arc::new(StateStore::new());
        let publisher = StatePublisher {
            cache: Arc::clone(&cache),
            state: Arc::clone(&state),
            filter: Arc::new(Mutex::new(String::new())),
        };
        let owner = OwnerId::new(format!("session-{}", uuid::Uuid::new_v4()));

        for topic in [
            DOCUMENT_DIRTY,
            DOCUMENT_SAVED,
            DOCUMENT_SELECTED,
            DOCUMENT_UPDATED,
            DOCUMENT_CREATED,
            DOCUMENT_DELETED,
            DOCUMENTS_LIST_UPDATED,
        ] {
            let publisher = publisher.clone();
            bus.subscribe(topic, move |_: &SyncEvent| publisher.publish(), Some(&owner))?;
        }

        {
            let state = Arc::clone(&state);
            let prefs = Arc::clone(&prefs);
            bus.subscribe(
                SESSION_LOGOUT,
                move |_: &SyncEvent| {
                    if let Err(err) = state.reset() {
                        tracing::warn!("failed to reset state on logout: {}", err);
                    }
                    if let Err(err) = prefs.save(&ClientPrefs::default()) {
                        tracing::warn!("failed to clear preferences on logout: {}", err);
                    }
                },
                Some(&owner),
            )?;
        }

        {
            let store = Arc::clone(&store);
            let cache = Arc::clone(&cache);
            let weak_bus = Arc::downgrade(&bus);
            let weak_queue: Weak<PatchQueue> = Arc::downgrade(&queue);
            let weak_trigger: Weak<SyncTrigger> = Arc::downgrade(&trigger);
            bus.subscribe(
                DOCUMENT_CONFLICT,
                move |event: &SyncEvent| {
                    let SyncEvent::Conflict { id, .. } = event else {
                        return;
                    };
                    let id = id.clone();
                    let store = Arc::clone(&store);
                    let cache = Arc::clone(&cache);
                    let weak_bus = weak_bus.clone();
                    let weak_queue = weak_queue.clone();
                    let weak_trigger = weak_trigger.clone();
                    runtime.spawn(async move {
                        let (Some(bus), Some(queue)) = (weak_bus.upgrade(), weak_queue.upgrade())
                        else {
                            return;
                        };
                        let refreshed =
                            refresh_document(store.as_ref(), &cache, &queue, &bus, &id).await;
                        let trigger = weak_trigger.upgrade();
                        match refreshed {
                            Ok(document) => {
                                tracing::info!(
                                    document = %id,
                                    version = document.version,
                                    "refreshed after conflict; retrying"
                                );
                                if let Some(trigger) = trigger {
                                    trigger.schedule_flush(&id, Duration::ZERO);
                                }
                            }
                            Err(SessionError::Store(StoreError::Unauthorized)) => {
                                tracing::warn!(
                                    document = %id,
                                    "store rejected credentials during conflict refresh; ending session"
                                );
                                if let Some(trigger) = trigger {
                                    trigger.cancel_all();
                                }
                                queue.teardown("unauthorized");
                            }
                            Err(SessionError::Store(StoreError::NotFound)) => {
                                tracing::warn!(
                                    document = %id,
                                    "document vanished during conflict refresh; dropping local edits"
                                );
                                if let Some(trigger) = trigger {
                                    trigger.cancel(&id);
                                }
                                queue.discard(&id);
                                cache.remove(&id);
                                emit(&bus, SyncEvent::Deleted { id: id.clone() });
                            }
                            Err(err) => {
                                let delay = queue.retry_delay(&id);
                                tracing::warn!(
                                    document = %id,
                                    retry_ms = delay.as_millis() as u64,
                                    "conflict refresh failed: {}",
                                    err
                                );
                                if let Some(trigger) = trigger {
                                    trigger.schedule_flush(&id, delay);
                                }
                            }
                        }
                    });
                },
                Some(&owner),
            )?;
        }

        Ok(Self {
            bus,
            cache,
            store,
            queue,
            trigger,
            state,
            prefs,
            publisher,
            owner,
        })
    }

    pub fn bus(&self) -> &Arc<SyncBus> {
        &self.bus
    }

    pub fn cache(&self) -> &Arc<DocumentCache> {
        &self.cache
    }

    pub fn queue(&self) -> &Arc<PatchQueue> {
        &self.queue
    }

    pub fn trigger(&self) -> &SyncTrigger {
        &self.trigger
    }

    pub fn state(&self) -> &Arc<StateStore> {
        &self.state
    }

    fn handle_store_error(&self, err: StoreError) -> SessionError {
        if err == StoreError::Unauthorized {
            self.logout("unauthorized");
        }
        SessionError::Store(err)
    }

    /// Load the document list and restore the last selection.
    ///
    /// # Returns
    /// Number of documents loaded.
    pub async fn start(&self) -> Result<usize, SessionError> {
        let count = self.refresh_list().await?;
        let prefs = self.prefs.load();
        if let Some(last) = prefs.last_document {
            if self.cache.contains(&last) {
                self.select(Some(&last))?;
                tracing::info!(document = %last, "restored last selected document");
            }
        }
        Ok(count)
    }

    /// Replace the cache with the store's document list.
    ///
    /// Records the store returns without an id or version are skipped.
    pub async fn refresh_list(&self) -> Result<usize, SessionError> {
        let records = self
            .store
            .list()
            .await
            .map_err(|err| self.handle_store_error(err))?;
        let mut documents = Vec::with_capacity(records.len());
        for record in records {
            match standardize(record) {
                Ok(document) => documents.push(document),
                Err(err) => tracing::warn!("skipping unusable document record: {}", err),
            }
        }
        let count = documents.len();
        self.cache.load_all(documents);
        emit(&self.bus, SyncEvent::ListUpdated { count });
        Ok(count)
    }

    /// Re-fetch one document from the store, keeping pending local edits on top.
    pub async fn refresh_document(&self, id: &DocumentId) -> Result<Document, SessionError> {
        let refreshed = refresh_document(
            self.store.as_ref(),
            &self.cache,
            &self.queue,
            &self.bus,
            id,
        )
        .await;
        match refreshed {
            Err(SessionError::Store(err)) => Err(self.handle_store_error(err)),
            other => other,
        }
    }

    /// Point the current slot at `id` (or clear it) and remember the choice.
    pub fn select(&self, id: Option<&DocumentId>) -> Result<(), SessionError> {
        self.cache.set_current(id)?;
        let mut prefs = self.prefs.load();
        prefs.last_document = id.cloned();
        if let Err(err) = self.prefs.save(&prefs) {
            tracing::warn!("failed to persist selection: {}", err);
        }
        emit(&self.bus, SyncEvent::Selected { id: id.cloned() });
        Ok(())
    }

    pub fn current(&self) -> Option<Document> {
        self.cache.current()
    }

    /// Create a document remotely, cache it and select it.
    pub async fn create(
        &self,
        title: Option<String>,
        content: Content,
        visibility: Visibility,
    ) -> Result<Document, SessionError> {
        let request = CreateDocumentRequest {
            title,
            content: Some(content),
            visibility: Some(visibility),
            ..CreateDocumentRequest::default()
        };
        let record = self
            .store
            .create(&request)
            .await
            .map_err(|err| self.handle_store_error(err))?;
        let document = standardize(record)?;
        self.cache.upsert(document.clone());
        tracing::info!(document = %document.id, "created document");
        emit(
            &self.bus,
            SyncEvent::Created {
                document: document.clone(),
            },
        );
        self.select(Some(&document.id))?;
        Ok(document)
    }

    /// Delete a document remotely and forget it locally.
    ///
    /// Pending edits and timers for the document are dropped first. A
    /// document the store no longer knows is treated as already deleted.
    pub async fn delete(&self, id: &DocumentId) -> Result<(), SessionError> {
        self.trigger.cancel(id);
        self.queue.discard(id);
        match self.store.delete(id).await {
            Ok(()) | Err(StoreError::NotFound) => {}
            Err(err) => return Err(self.handle_store_error(err)),
        }
        self.cache.remove(id);
        let mut prefs = self.prefs.load();
        if prefs.last_document.as_ref() == Some(id) {
            prefs.last_document = None;
            if let Err(err) = self.prefs.save(&prefs) {
                tracing::warn!("failed to persist preferences: {}", err);
            }
        }
        tracing::info!(document = %id, "deleted document");
        emit(&self.bus, SyncEvent::Deleted { id: id.clone() });
        emit(
            &self.bus,
            SyncEvent::ListUpdated {
                count: self.cache.len(),
            },
        );
        Ok(())
    }

    /// Queue a direct edit; the caller decides when to flush.
    pub fn edit(
        &self,
        id: &DocumentId,
        patch: DocumentPatch,
        reason: PatchReason,
    ) -> Result<bool, SessionError> {
        Ok(self.queue.queue_patch(id, patch, reason)?)
    }

    /// Route a content change through the sync trigger.
    pub fn set_content(
        &self,
        id: &DocumentId,
        content: Content,
    ) -> Result<TriggerDecision, SessionError> {
        Ok(self.trigger.on_content_changed(id, content)?)
    }

    pub async fn flush(&self, id: &DocumentId) -> FlushOutcome {
        self.queue.flush_patch(id).await
    }

    pub async fn flush_all(&self) -> Vec<(DocumentId, FlushOutcome)> {
        self.queue.flush_all().await
    }

    /// Narrow the list state to titles containing `filter`.
    pub fn set_filter(&self, filter: &str) {
        *self
            .publisher
            .filter
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = filter.trim().to_string();
        self.publisher.publish();
    }

    /// Remember the caret and scroll position for a document.
    pub fn save_cursor(&self, snapshot: CursorSnapshot) {
        let mut prefs = self.prefs.load();
        prefs.cursor = Some(snapshot);
        if let Err(err) = self.prefs.save(&prefs) {
            tracing::warn!("failed to persist cursor: {}", err);
        }
    }

    /// Last selected document remembered in preferences.
    pub fn last_document(&self) -> Option<DocumentId> {
        self.prefs.load().last_document
    }

    /// Stored cursor for `id`, if any.
    pub fn cursor_for(&self, id: &DocumentId) -> Option<CursorSnapshot> {
        self.prefs.load().cursor_for(id).cloned()
    }

    /// End the session: timers cancelled, edits discarded, cache emptied,
    /// `session:logout` published.
    pub fn logout(&self, reason: &str) {
        self.trigger.cancel_all();
        self.queue.teardown(reason);
    }

    /// Flush what is pending, then stop every timer.
    pub async fn shutdown(&self) -> Vec<(DocumentId, FlushOutcome)> {
        self.trigger.cancel_all();
        let outcomes = self.queue.flush_all().await;
        self.trigger.cancel_all();
        outcomes
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.trigger.cancel_all();
        if let Err(err) = self.bus.unsubscribe_all(&self.owner) {
            if err != BusError::Destroyed {
                tracing::warn!("failed to detach session: {}", err);
            }
        }
    }
}
