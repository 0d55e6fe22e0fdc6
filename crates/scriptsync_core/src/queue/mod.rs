//! Write-back patch queue: optimistic local edits flushed to the remote store.
//!
//! Every accepted edit is applied to the [`DocumentCache`] immediately and
//! accumulated in a per-document pending patch. A flush sends the pending
//! fields together with the cached version; the store rejects the write when
//! that version is no longer current.
//!
//! The queue never schedules anything on its own. Callers (normally the
//! [`crate::trigger::SyncTrigger`]) decide when to call [`PatchQueue::flush_patch`]
//! and read [`PatchQueue::retry_delay`] to pace retries.

use crate::cache::{standardize, DocumentCache};
use crate::config::SyncConfig;
use crate::error::{FailureKind, StoreError, SyncError};
use crate::events::{emit, SyncBus, SyncEvent};
use crate::models::{
    Document, DocumentId, DocumentPatch, PatchReason, PendingPatch, UpdateDocumentRequest,
};
use crate::store::DocumentStore;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[cfg(test)]
mod tests;

/// Limits and backoff bounds used by [`PatchQueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    pub retry_interval: Duration,
    pub max_retry_interval: Duration,
    pub max_content_size: usize,
}

impl From<&SyncConfig> for QueueConfig {
    fn from(config: &SyncConfig) -> Self {
        Self {
            retry_interval: config.retry_interval,
            max_retry_interval: config.max_retry_interval.max(config.retry_interval),
            max_content_size: config.max_content_size,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::from(&SyncConfig::default())
    }
}

/// Result of one [`PatchQueue::flush_patch`] call.
#[derive(Debug, Clone, PartialEq)]
pub enum FlushOutcome {
    /// Nothing was pending for the document.
    Idle,
    /// A flush for the document is already in flight.
    AlreadyFlushing,
    /// The pending patch became redundant; no write was made.
    Moot,
    /// The store accepted the write.
    Saved(Document),
    /// The write failed; the patch is still queued.
    Failed(StoreError),
    /// The session was torn down.
    Unauthorized,
    /// The patch could not be sent and was dropped.
    Invalid(SyncError),
}

#[derive(Default)]
struct QueueState {
    pending: HashMap<DocumentId, PendingPatch>,
    active: HashSet<DocumentId>,
    retry_delays: HashMap<DocumentId, Duration>,
}

/// Clears the active-flush marker when a flush ends, including when the flush
/// future is dropped mid-flight.
struct ActiveFlush<'a> {
    queue: &'a PatchQueue,
    id: DocumentId,
    armed: bool,
}

impl ActiveFlush<'_> {
    fn finish(mut self, state: &mut QueueState) {
        state.active.remove(&self.id);
        self.armed = false;
    }
}

impl Drop for ActiveFlush<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.queue.state().active.remove(&self.id);
        }
    }
}

struct PreparedFlush {
    request: UpdateDocumentRequest,
    queued_at: crate::clock::Stamp,
}

/// Per-document pending-change accumulator in front of a [`DocumentStore`].
pub struct PatchQueue {
    cache: Arc<DocumentCache>,
    store: Arc<dyn DocumentStore>,
    bus: Arc<SyncBus>,
    config: QueueConfig,
    state: Mutex<QueueState>,
}

impl PatchQueue {
    pub fn new(
        cache: Arc<DocumentCache>,
        store: Arc<dyn DocumentStore>,
        bus: Arc<SyncBus>,
        config: QueueConfig,
    ) -> Self {
        Self {
            cache,
            store,
            bus,
            config,
            state: Mutex::new(QueueState::default()),
        }
    }

    // Lock order is queue state, then cache. The cache never calls back here.
    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> QueueConfig {
        self.config
    }

    /// Queue a partial update and apply it to the cache right away.
    ///
    /// Only fields that differ from the cached document are kept. The result
    /// is merged into any pending patch for the same document, newer values
    /// winning per field.
    ///
    /// # Returns
    /// `Ok(true)` when something was queued and `document:dirty` published;
    /// `Ok(false)` when the patch was a no-op.
    ///
    /// # Errors
    /// Validation failures are returned and nothing is queued.
    pub fn queue_patch(
        &self,
        id: &DocumentId,
        patch: DocumentPatch,
        reason: PatchReason,
    ) -> Result<bool, SyncError> {
        if id.is_blank() {
            return Err(SyncError::MissingId);
        }
        let document = self
            .cache
            .get(id)
            .ok_or_else(|| SyncError::UnknownDocument(id.to_string()))?;
        if document.version == 0 {
            return Err(SyncError::MissingVersion(id.to_string()));
        }
        if let Some(content) = &patch.content {
            let size = content.size_bytes();
            if size > self.config.max_content_size {
                return Err(SyncError::ContentTooLarge {
                    size,
                    max: self.config.max_content_size,
                });
            }
        }

        let effective = patch.effective_against(&document);
        if effective.is_empty() {
            tracing::debug!(document = %id, "ignoring no-op patch");
            return Ok(false);
        }

        {
            let mut state = self.state();
            let stamp = self.cache.now();
            self.cache.apply_patch(id, &effective, stamp)?;
            match state.pending.get_mut(id) {
                Some(pending) => {
                    pending.patch.merge(effective.clone());
                    pending.reason = reason.clone();
                    pending.queued_at = stamp;
                }
                None => {
                    state.pending.insert(
                        id.clone(),
                        PendingPatch {
                            patch: effective.clone(),
                            reason: reason.clone(),
                            queued_at: stamp,
                        },
                    );
                }
            }
        }

        let fields = effective.field_names();
        tracing::debug!(document = %id, %reason, ?fields, "queued patch");
        emit(
            &self.bus,
            SyncEvent::Dirty {
                id: id.clone(),
                reason,
                fields,
            },
        );
        Ok(true)
    }

    /// Send the pending patch for `id` to the store.
    ///
    /// Never fails: every outcome is reported through the returned
    /// [`FlushOutcome`] and the lifecycle events on the bus.
    pub async fn flush_patch(&self, id: &DocumentId) -> FlushOutcome {
        let (prepared, guard) = {
            let mut state = self.state();
            if state.active.contains(id) {
                return FlushOutcome::AlreadyFlushing;
            }
            let Some(pending) = state.pending.get(id).cloned() else {
                return FlushOutcome::Idle;
            };
            match self.prepare(&mut state, id, pending) {
                Ok(Some(prepared)) => {
                    state.active.insert(id.clone());
                    let guard = ActiveFlush {
                        queue: self,
                        id: id.clone(),
                        armed: true,
                    };
                    (prepared, guard)
                }
                Ok(None) => {
                    drop(state);
                    let version = self.cache.get(id).map(|doc| doc.version).unwrap_or(0);
                    tracing::debug!(document = %id, "pending patch became redundant");
                    emit(
                        &self.bus,
                        SyncEvent::Saved {
                            id: id.clone(),
                            version,
                            moot: true,
                        },
                    );
                    return FlushOutcome::Moot;
                }
                Err(err) => {
                    state.pending.remove(id);
                    drop(state);
                    tracing::warn!(document = %id, "dropping unsendable patch: {}", err);
                    return FlushOutcome::Invalid(err);
                }
            }
        };

        let base_version = prepared.request.version;
        emit(
            &self.bus,
            SyncEvent::Saving {
                id: id.clone(),
                version: base_version,
            },
        );

        let result = self
            .store
            .update(id, &prepared.request)
            .await
            .and_then(standardize);

        match result {
            Ok(document) => self.complete_success(id, document, prepared.queued_at, guard),
            Err(err) => self.complete_failure(id, err, base_version, guard),
        }
    }

    /// Revalidate a pending patch and build its request.
    ///
    /// Returns `Ok(None)` when the patch is redundant and has been dropped.
    fn prepare(
        &self,
        state: &mut QueueState,
        id: &DocumentId,
        mut pending: PendingPatch,
    ) -> Result<Option<PreparedFlush>, SyncError> {
        let mut document = self
            .cache
            .get(id)
            .ok_or_else(|| SyncError::UnknownDocument(id.to_string()))?;
        if document.version == 0 {
            return Err(SyncError::MissingVersion(id.to_string()));
        }

        if document.local_stamp > pending.queued_at {
            let narrowed = pending.patch.effective_against(&document);
            if narrowed.is_empty() {
                state.pending.remove(id);
                return Ok(None);
            }
            let stamp = self.cache.now();
            document = self.cache.apply_patch(id, &narrowed, stamp)?;
            tracing::debug!(
                document = %id,
                fields = ?narrowed.field_names(),
                "narrowed stale patch"
            );
            pending.patch = narrowed;
            pending.queued_at = stamp;
            state.pending.insert(id.clone(), pending.clone());
        }

        let mut layered = document.clone();
        pending.patch.apply_to(&mut layered);
        let request = UpdateDocumentRequest {
            content: layered.content,
            title: layered.title,
            version: document.version,
            author: pending.patch.author.clone(),
            description: pending.patch.description.clone(),
            visibility: pending.patch.visibility,
        };
        Ok(Some(PreparedFlush {
            request,
            queued_at: pending.queued_at,
        }))
    }

    fn complete_success(
        &self,
        id: &DocumentId,
        document: Document,
        sent_at: crate::clock::Stamp,
        guard: ActiveFlush<'_>,
    ) -> FlushOutcome {
        let saved = document.clone();
        {
            let mut state = self.state();
            guard.finish(&mut state);
            state.retry_delays.remove(id);

            if !self.cache.contains(id) {
                state.pending.remove(id);
                tracing::debug!(document = %id, "document left the cache during flush");
            } else {
                match state.pending.get(id).cloned() {
                    Some(pending) if pending.queued_at != sent_at => {
                        let remaining = pending.patch.effective_against(&document);
                        if remaining.is_empty() {
                            state.pending.remove(id);
                            let stamp = self.cache.now();
                            self.cache.replace_with_stamp(document, stamp);
                        } else {
                            let stamp = self.cache.now();
                            let mut layered = document;
                            remaining.apply_to(&mut layered);
                            self.cache.replace_with_stamp(layered, stamp);
                            state.pending.insert(
                                id.clone(),
                                PendingPatch {
                                    patch: remaining,
                                    reason: pending.reason,
                                    queued_at: stamp,
                                },
                            );
                        }
                    }
                    _ => {
                        state.pending.remove(id);
                        let stamp = self.cache.now();
                        self.cache.replace_with_stamp(document, stamp);
                    }
                }
            }
        }

        tracing::info!(document = %id, version = saved.version, "saved document");
        emit(
            &self.bus,
            SyncEvent::Saved {
                id: id.clone(),
                version: saved.version,
                moot: false,
            },
        );
        FlushOutcome::Saved(saved)
    }

    fn complete_failure(
        &self,
        id: &DocumentId,
        err: StoreError,
        base_version: u64,
        guard: ActiveFlush<'_>,
    ) -> FlushOutcome {
        let kind = err.kind();
        if kind == FailureKind::Unauthorized {
            {
                let mut state = self.state();
                guard.finish(&mut state);
            }
            tracing::warn!(document = %id, "store rejected credentials; ending session");
            self.teardown("unauthorized");
            return FlushOutcome::Unauthorized;
        }

        let retry_in = {
            let mut state = self.state();
            guard.finish(&mut state);
            let current = state
                .retry_delays
                .get(id)
                .copied()
                .unwrap_or(self.config.retry_interval);
            let next = match &err {
                StoreError::RateLimited { retry_after } => {
                    let doubled = current.saturating_mul(2);
                    let hinted = retry_after.map_or(doubled, |hint| doubled.max(hint));
                    hinted.min(self.config.max_retry_interval)
                }
                _ => current,
            };
            state.retry_delays.insert(id.clone(), next);
            next
        };

        tracing::warn!(
            document = %id,
            ?kind,
            retry_ms = retry_in.as_millis() as u64,
            "flush failed: {}",
            err
        );
        if let StoreError::Conflict { current_version } = &err {
            emit(
                &self.bus,
                SyncEvent::Conflict {
                    id: id.clone(),
                    local_version: base_version,
                    server_version: *current_version,
                },
            );
        }
        emit(
            &self.bus,
            SyncEvent::Error {
                id: id.clone(),
                kind,
                message: err.to_string(),
                retry_in,
            },
        );
        FlushOutcome::Failed(err)
    }

    /// Layer the pending patch for `id` over a freshly loaded cache entry.
    ///
    /// Fields the new server state already matches are dropped from the
    /// patch; when nothing is left the patch resolves as a moot save.
    ///
    /// # Returns
    /// `true` when local edits are still pending afterwards.
    pub fn rebase(&self, id: &DocumentId) -> bool {
        let resolved_version = {
            let mut state = self.state();
            let Some(pending) = state.pending.get(id).cloned() else {
                return false;
            };
            let Some(document) = self.cache.get(id) else {
                return false;
            };
            let narrowed = pending.patch.effective_against(&document);
            if narrowed.is_empty() {
                state.pending.remove(id);
                document.version
            } else {
                let stamp = self.cache.now();
                if let Err(err) = self.cache.apply_patch(id, &narrowed, stamp) {
                    tracing::warn!(document = %id, "failed to reapply pending edits: {}", err);
                    return true;
                }
                tracing::debug!(
                    document = %id,
                    fields = ?narrowed.field_names(),
                    "reapplied pending edits over refreshed document"
                );
                state.pending.insert(
                    id.clone(),
                    PendingPatch {
                        patch: narrowed,
                        reason: pending.reason,
                        queued_at: stamp,
                    },
                );
                return true;
            }
        };

        tracing::debug!(document = %id, "refreshed document already holds pending edits");
        emit(
            &self.bus,
            SyncEvent::Saved {
                id: id.clone(),
                version: resolved_version,
                moot: true,
            },
        );
        false
    }

    /// Clear every local trace of the session and publish `session:logout`.
    pub fn teardown(&self, reason: &str) {
        self.clear();
        self.cache.clear();
        tracing::info!(reason, "session torn down");
        emit(
            &self.bus,
            SyncEvent::Logout {
                reason: reason.to_string(),
            },
        );
    }

    /// Flush every pending document, one after another.
    pub async fn flush_all(&self) -> Vec<(DocumentId, FlushOutcome)> {
        let mut outcomes = Vec::new();
        for id in self.pending_ids() {
            let outcome = self.flush_patch(&id).await;
            let stop = outcome == FlushOutcome::Unauthorized;
            outcomes.push((id, outcome));
            if stop {
                break;
            }
        }
        outcomes
    }

    pub fn pending(&self, id: &DocumentId) -> Option<PendingPatch> {
        self.state().pending.get(id).cloned()
    }

    /// Ids with a pending patch, sorted.
    pub fn pending_ids(&self) -> Vec<DocumentId> {
        let mut ids: Vec<DocumentId> = self.state().pending.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn has_pending(&self) -> bool {
        !self.state().pending.is_empty()
    }

    pub fn is_flushing(&self, id: &DocumentId) -> bool {
        self.state().active.contains(id)
    }

    /// Delay to wait before retrying `id`; the base interval until a rate
    /// limit pushes it up.
    pub fn retry_delay(&self, id: &DocumentId) -> Duration {
        self.state()
            .retry_delays
            .get(id)
            .copied()
            .unwrap_or(self.config.retry_interval)
    }

    /// Drop the pending patch for one document, e.g. after deleting it.
    pub fn discard(&self, id: &DocumentId) -> Option<PendingPatch> {
        let mut state = self.state();
        state.retry_delays.remove(id);
        state.pending.remove(id)
    }

    /// Forget all pending patches, in-flight markers and retry delays.
    pub fn clear(&self) {
        let mut state = self.state();
        state.pending.clear();
        state.active.clear();
        state.retry_delays.clear();
    }
}
