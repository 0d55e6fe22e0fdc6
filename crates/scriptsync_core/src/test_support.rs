//! Shared fixtures for crate unit tests.

use crate::cache::DocumentCache;
use crate::error::StoreError;
use crate::events::{SyncBus, SyncEvent};
use crate::models::{
    Content, CreateDocumentRequest, Document, DocumentId, DocumentRecord, UpdateDocumentRequest,
};
use crate::queue::{PatchQueue, QueueConfig};
use crate::store::{DocumentStore, MemoryStore};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};

pub(crate) const ALL_TOPICS: [&str; 12] = [
    crate::events::DOCUMENT_DIRTY,
    crate::events::DOCUMENT_SAVING,
    crate::events::DOCUMENT_SAVED,
    crate::events::DOCUMENT_ERROR,
    crate::events::DOCUMENT_CONFLICT,
    crate::events::DOCUMENT_SELECTED,
    crate::events::DOCUMENT_UPDATED,
    crate::events::DOCUMENT_CREATED,
    crate::events::DOCUMENT_DELETED,
    crate::events::DOCUMENTS_LIST_UPDATED,
    crate::events::CONTENT_CHANGED,
    crate::events::SESSION_LOGOUT,
];

/// Version-1 document with a fixed id.
pub(crate) fn document(id: &str, content: &str) -> Document {
    let mut document = Document::new(format!("Script {}", id), Content::text(content));
    document.id = DocumentId::from(id);
    document
}

/// Store double wrapping [`MemoryStore`] with failure injection and gating.
#[derive(Default)]
pub(crate) struct ScriptedStore {
    inner: MemoryStore,
    failures: Mutex<VecDeque<StoreError>>,
    get_failures: Mutex<VecDeque<StoreError>>,
    updates: Mutex<Vec<(DocumentId, UpdateDocumentRequest)>>,
    update_calls: AtomicUsize,
    gate: Mutex<Option<Arc<Semaphore>>>,
    entered: Notify,
    malformed: AtomicBool,
}

impl ScriptedStore {
    pub(crate) fn with_documents(documents: &[Document]) -> Arc<Self> {
        let store = Self::default();
        for document in documents {
            store.inner.insert(document.clone());
        }
        Arc::new(store)
    }

    /// Make the next `update` calls fail with these errors, in order.
    pub(crate) fn fail_next(&self, errors: impl IntoIterator<Item = StoreError>) {
        self.failures
            .lock()
            .expect("failures lock")
            .extend(errors);
    }

    /// Make the next `get` calls fail with these errors, in order.
    pub(crate) fn fail_next_get(&self, errors: impl IntoIterator<Item = StoreError>) {
        self.get_failures
            .lock()
            .expect("get failures lock")
            .extend(errors);
    }

    /// Answer updates with a record that has no id.
    pub(crate) fn answer_malformed(&self, malformed: bool) {
        self.malformed.store(malformed, Ordering::SeqCst);
    }

    /// Hold every `update` until the returned semaphore gets a permit.
    pub(crate) fn hold_updates(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.gate.lock().expect("gate lock") = Some(Arc::clone(&gate));
        gate
    }

    /// Resolve once an `update` call has started.
    pub(crate) async fn update_started(&self) {
        self.entered.notified().await;
    }

    pub(crate) fn update_calls(&self) -> usize {
        self.update_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn updates(&self) -> Vec<(DocumentId, UpdateDocumentRequest)> {
        self.updates.lock().expect("updates lock").clone()
    }

    pub(crate) fn stored(&self, id: &str) -> Option<Document> {
        self.inner.snapshot(&DocumentId::from(id))
    }

    /// Seed or overwrite a row behind the client's back.
    pub(crate) fn put(&self, document: Document) {
        self.inner.insert(document);
    }
}

#[async_trait]
impl DocumentStore for ScriptedStore {
    async fn list(&self) -> Result<Vec<DocumentRecord>, StoreError> {
        self.inner.list().await
    }

    async fn get(&self, id: &DocumentId) -> Result<DocumentRecord, StoreError> {
        let failure = self
            .get_failures
            .lock()
            .expect("get failures lock")
            .pop_front();
        if let Some(err) = failure {
            return Err(err);
        }
        self.inner.get(id).await
    }

    async fn create(&self, request: &CreateDocumentRequest) -> Result<DocumentRecord, StoreError> {
        self.inner.create(request).await
    }

    async fn update(
        &self,
        id: &DocumentId,
        request: &UpdateDocumentRequest,
    ) -> Result<DocumentRecord, StoreError> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        self.updates
            .lock()
            .expect("updates lock")
            .push((id.clone(), request.clone()));
        self.entered.notify_one();

        let gate = self.gate.lock().expect("gate lock").clone();
        if let Some(gate) = gate {
            gate.acquire().await.expect("gate open").forget();
        }

        let failure = self.failures.lock().expect("failures lock").pop_front();
        if let Some(err) = failure {
            return Err(err);
        }
        if self.malformed.load(Ordering::SeqCst) {
            return Ok(DocumentRecord {
                version: Some(request.version + 1),
                ..DocumentRecord::default()
            });
        }
        self.inner.update(id, request).await
    }

    async fn delete(&self, id: &DocumentId) -> Result<(), StoreError> {
        self.inner.delete(id).await
    }
}

/// Records every event published on a bus.
#[derive(Clone, Default)]
pub(crate) struct EventLog {
    events: Arc<Mutex<Vec<SyncEvent>>>,
}

impl EventLog {
    pub(crate) fn attach(bus: &SyncBus) -> Self {
        let log = Self::default();
        for topic in ALL_TOPICS {
            let events = Arc::clone(&log.events);
            bus.subscribe(
                topic,
                move |event: &SyncEvent| {
                    events.lock().expect("event log").push(event.clone());
                },
                None,
            )
            .expect("attach event log");
        }
        log
    }

    pub(crate) fn events(&self) -> Vec<SyncEvent> {
        self.events.lock().expect("event log").clone()
    }

    pub(crate) fn topics(&self) -> Vec<&'static str> {
        self.events().iter().map(SyncEvent::topic).collect()
    }

    pub(crate) fn count(&self, topic: &str) -> usize {
        self.events()
            .iter()
            .filter(|event| event.topic() == topic)
            .count()
    }

    pub(crate) fn clear(&self) {
        self.events.lock().expect("event log").clear();
    }
}

/// A queue wired to a scripted store, with every fixture document cached.
pub(crate) struct QueueFixture {
    pub(crate) cache: Arc<DocumentCache>,
    pub(crate) store: Arc<ScriptedStore>,
    pub(crate) bus: Arc<SyncBus>,
    pub(crate) queue: Arc<PatchQueue>,
    pub(crate) log: EventLog,
}

impl QueueFixture {
    pub(crate) fn new(documents: &[Document]) -> Self {
        Self::with_config(documents, QueueConfig::default())
    }

    pub(crate) fn with_config(documents: &[Document], config: QueueConfig) -> Self {
        let cache = Arc::new(DocumentCache::new());
        cache.load_all(documents.to_vec());
        let store = ScriptedStore::with_documents(documents);
        let bus = Arc::new(SyncBus::new());
        let log = EventLog::attach(&bus);
        let queue = Arc::new(PatchQueue::new(
            Arc::clone(&cache),
            Arc::clone(&store) as Arc<dyn DocumentStore>,
            Arc::clone(&bus),
            config,
        ));
        Self {
            cache,
            store,
            bus,
            queue,
            log,
        }
    }
}

pub(crate) fn backoff_config(base_ms: u64, max_ms: u64) -> QueueConfig {
    QueueConfig {
        retry_interval: Duration::from_millis(base_ms),
        max_retry_interval: Duration::from_millis(max_ms),
        ..QueueConfig::default()
    }
}
