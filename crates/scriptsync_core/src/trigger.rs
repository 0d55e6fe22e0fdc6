//! Debounce gate deciding when content changes are flushed.
//!
//! The trigger owns every timer of the sync engine: one slot per document
//! that holds either a debounced flush or a scheduled retry. Replacing a slot
//! aborts the task it held.

use crate::bus::{BusError, OwnerId};
use crate::cache::DocumentCache;
use crate::config::SyncConfig;
use crate::error::{FailureKind, SyncError};
use crate::events::{SyncBus, SyncEvent, CONTENT_CHANGED, DOCUMENT_ERROR, SESSION_LOGOUT};
use crate::models::{Content, DocumentId, DocumentPatch, PatchReason};
use crate::queue::{FlushOutcome, PatchQueue};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// What the trigger did with a content change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerDecision {
    /// Content matched the cache; nothing was queued.
    Ignored,
    /// A flush was started right away.
    Immediate,
    /// A flush was scheduled after the debounce window.
    Scheduled,
}

#[derive(Error, Debug)]
pub enum TriggerError {
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error("sync trigger requires a tokio runtime")]
    NoRuntime,
}

/// Debounce and pacing intervals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerConfig {
    pub debounce: Duration,
    pub min_flush_interval: Duration,
}

impl From<&SyncConfig> for TriggerConfig {
    fn from(config: &SyncConfig) -> Self {
        Self {
            debounce: config.flush_debounce,
            min_flush_interval: config.min_flush_interval,
        }
    }
}

struct Timer {
    generation: u64,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct TriggerState {
    timers: HashMap<DocumentId, Timer>,
    last_flush: HashMap<DocumentId, Instant>,
}

struct TriggerInner {
    queue: Arc<PatchQueue>,
    cache: Arc<DocumentCache>,
    config: TriggerConfig,
    runtime: Handle,
    generation: AtomicU64,
    state: Mutex<TriggerState>,
}

impl TriggerInner {
    fn state(&self) -> MutexGuard<'_, TriggerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn on_content_changed(
        self: &Arc<Self>,
        id: &DocumentId,
        content: Content,
    ) -> Result<TriggerDecision, SyncError> {
        let cached = self
            .cache
            .get(id)
            .ok_or_else(|| SyncError::UnknownDocument(id.to_string()))?;
        if cached.content.same_as(&content) {
            return Ok(TriggerDecision::Ignored);
        }
        let queued = self.queue.queue_patch(
            id,
            DocumentPatch::default().with_content(content),
            PatchReason::ContentSync,
        )?;
        if !queued {
            return Ok(TriggerDecision::Ignored);
        }

        let now = Instant::now();
        let recently_flushed = self
            .state()
            .last_flush
            .get(id)
            .is_some_and(|last| now.duration_since(*last) < self.config.min_flush_interval);
        if recently_flushed {
            self.schedule(id.clone(), self.config.debounce);
            tracing::debug!(document = %id, "debounced content flush");
            Ok(TriggerDecision::Scheduled)
        } else {
            self.state().last_flush.insert(id.clone(), now);
            self.schedule(id.clone(), Duration::ZERO);
            Ok(TriggerDecision::Immediate)
        }
    }

    /// Put a flush for `id` into its slot, aborting whatever the slot held.
    fn schedule(self: &Arc<Self>, id: DocumentId, delay: Duration) {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::clone(self);
        let task_id = id.clone();
        // Hold the slot table while spawning so the task cannot fire before
        // its entry exists.
        let mut state = self.state();
        let handle = self.runtime.spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            {
                let mut state = inner.state();
                if state
                    .timers
                    .get(&task_id)
                    .is_some_and(|timer| timer.generation == generation)
                {
                    state.timers.remove(&task_id);
                }
                state.last_flush.insert(task_id.clone(), Instant::now());
            }
            let outcome = inner.queue.flush_patch(&task_id).await;
            tracing::debug!(document = %task_id, ?outcome, "triggered flush finished");
            // The flush in flight may save only part of what is pending now.
            if outcome == FlushOutcome::AlreadyFlushing {
                let slot_free = !inner.state().timers.contains_key(&task_id);
                if slot_free && inner.queue.pending(&task_id).is_some() {
                    tracing::debug!(document = %task_id, "flush busy; re-arming timer");
                    inner.schedule(task_id, inner.config.debounce);
                }
            }
        });
        if let Some(previous) = state.timers.insert(id, Timer { generation, handle }) {
            previous.handle.abort();
        }
    }

    fn cancel_all(&self) -> usize {
        let mut state = self.state();
        let cancelled = state.timers.len();
        for (_, timer) in state.timers.drain() {
            timer.handle.abort();
        }
        state.last_flush.clear();
        cancelled
    }
}

/// Content-change channel in front of the [`PatchQueue`].
///
/// Subscribes to `content:changed` (queue and gate), `document:error`
/// (schedule a retry after the queue's per-document delay) and
/// `session:logout` (cancel every timer).
pub struct SyncTrigger {
    inner: Arc<TriggerInner>,
    bus: Arc<SyncBus>,
    owner: OwnerId,
}

impl SyncTrigger {
    /// Create a trigger and attach it to `bus`.
    ///
    /// # Errors
    /// Fails outside a tokio runtime or when the bus is destroyed.
    pub fn new(
        queue: Arc<PatchQueue>,
        cache: Arc<DocumentCache>,
        bus: Arc<SyncBus>,
        config: TriggerConfig,
    ) -> Result<Self, TriggerError> {
        let runtime = Handle::try_current().map_err(|_| TriggerError::NoRuntime)?;
        let inner = Arc::new(TriggerInner {
            queue,
            cache,
            config,
            runtime,
            generation: AtomicU64::new(1),
            state: Mutex::new(TriggerState::default()),
        });
        let owner = OwnerId::new(format!("sync-trigger-{}", uuid::Uuid::new_v4()));

        let weak = Arc::downgrade(&inner);
        bus.subscribe(
            CONTENT_CHANGED,
            move |event: &SyncEvent| {
                let (Some(inner), SyncEvent::ContentChanged { id, content }) =
                    (weak.upgrade(), event)
                else {
                    return;
                };
                if let Err(err) = inner.on_content_changed(id, content.clone()) {
                    tracing::warn!(document = %id, "content change rejected: {}", err);
                }
            },
            Some(&owner),
        )?;

        let weak = Arc::downgrade(&inner);
        bus.subscribe(
            DOCUMENT_ERROR,
            move |event: &SyncEvent| {
                let (Some(inner), SyncEvent::Error { id, kind, retry_in, .. }) =
                    (weak.upgrade(), event)
                else {
                    return;
                };
                // Conflicts wait for a refresh; retrying the same version fails again.
                if matches!(kind, FailureKind::Conflict | FailureKind::Unauthorized) {
                    return;
                }
                if inner.queue.pending(id).is_none() {
                    return;
                }
                tracing::debug!(
                    document = %id,
                    retry_ms = retry_in.as_millis() as u64,
                    "scheduling retry"
                );
                inner.schedule(id.clone(), *retry_in);
            },
            Some(&owner),
        )?;

        let weak = Arc::downgrade(&inner);
        bus.subscribe(
            SESSION_LOGOUT,
            move |_: &SyncEvent| {
                if let Some(inner) = weak.upgrade() {
                    inner.cancel_all();
                }
            },
            Some(&owner),
        )?;

        Ok(Self { inner, bus, owner })
    }

    /// Feed a content change through the gate.
    ///
    /// # Errors
    /// Validation errors from the queue, or an unknown document.
    pub fn on_content_changed(
        &self,
        id: &DocumentId,
        content: Content,
    ) -> Result<TriggerDecision, SyncError> {
        self.inner.on_content_changed(id, content)
    }

    /// Schedule a flush for `id` after `delay`, replacing any earlier timer.
    pub fn schedule_flush(&self, id: &DocumentId, delay: Duration) {
        self.inner.schedule(id.clone(), delay);
    }

    /// Abort one document's timer.
    pub fn cancel(&self, id: &DocumentId) -> bool {
        let mut state = self.inner.state();
        state.last_flush.remove(id);
        match state.timers.remove(id) {
            Some(timer) => {
                timer.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Abort every timer synchronously.
    ///
    /// # Returns
    /// Number of timers cancelled.
    pub fn cancel_all(&self) -> usize {
        self.inner.cancel_all()
    }

    /// Ids with a timer in their slot, sorted.
    pub fn scheduled_ids(&self) -> Vec<DocumentId> {
        let mut ids: Vec<DocumentId> = self.inner.state().timers.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn config(&self) -> TriggerConfig {
        self.inner.config
    }
}

impl Drop for SyncTrigger {
    fn drop(&mut self) {
        self.inner.cancel_all();
        if let Err(err) = self.bus.unsubscribe_all(&self.owner) {
            if err != BusError::Destroyed {
                tracing::warn!("failed to detach sync trigger: {}", err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::events::emit;
    use crate::test_support::{backoff_config, document, QueueFixture};

    const DEBOUNCE: Duration = Duration::from_millis(500);
    const MIN_INTERVAL: Duration = Duration::from_millis(2_000);

    fn trigger_for(fx: &QueueFixture) -> SyncTrigger {
        SyncTrigger::new(
            Arc::clone(&fx.queue),
            Arc::clone(&fx.cache),
            Arc::clone(&fx.bus),
            TriggerConfig {
                debounce: DEBOUNCE,
                min_flush_interval: MIN_INTERVAL,
            },
        )
        .expect("trigger")
    }

    async fn settle() {
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn first_change_flushes_immediately_then_debounces() {
        let fx = QueueFixture::new(&[document("7", "")]);
        let trigger = trigger_for(&fx);
        let id = DocumentId::from("7");

        assert_eq!(
            trigger
                .on_content_changed(&id, Content::text("one"))
                .expect("first"),
            TriggerDecision::Immediate
        );
        settle().await;
        assert_eq!(fx.store.update_calls(), 1);

        assert_eq!(
            trigger
                .on_content_changed(&id, Content::text("two"))
                .expect("second"),
            TriggerDecision::Scheduled
        );
        assert_eq!(trigger.scheduled_ids(), vec![id.clone()]);

        tokio::time::sleep(DEBOUNCE / 2).await;
        assert_eq!(
            trigger
                .on_content_changed(&id, Content::text("three"))
                .expect("third"),
            TriggerDecision::Scheduled
        );
        tokio::time::sleep(DEBOUNCE / 2 + Duration::from_millis(10)).await;
        settle().await;
        assert_eq!(fx.store.update_calls(), 1, "replaced timer must not fire");

        tokio::time::sleep(DEBOUNCE).await;
        settle().await;
        assert_eq!(fx.store.update_calls(), 2);
        assert_eq!(
            fx.store.updates()[1].1.content,
            Content::text("three"),
            "debounced flush sends the latest content"
        );
        assert!(trigger.scheduled_ids().is_empty());
        assert!(fx.queue.pending(&id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn debounced_flush_waits_out_an_in_flight_write() {
        let fx = QueueFixture::new(&[document("7", "")]);
        let trigger = trigger_for(&fx);
        let id = DocumentId::from("7");
        let gate = fx.store.hold_updates();

        assert_eq!(
            trigger
                .on_content_changed(&id, Content::text("one"))
                .expect("first"),
            TriggerDecision::Immediate
        );
        fx.store.update_started().await;
        assert_eq!(
            trigger
                .on_content_changed(&id, Content::text("two"))
                .expect("second"),
            TriggerDecision::Scheduled
        );

        // The debounce fires while "one" is still on the wire.
        tokio::time::sleep(DEBOUNCE + Duration::from_millis(10)).await;
        settle().await;
        assert_eq!(fx.store.update_calls(), 1);
        assert!(fx.queue.is_flushing(&id));
        assert_eq!(trigger.scheduled_ids(), vec![id.clone()]);

        gate.add_permits(2);
        settle().await;
        assert_eq!(
            fx.store.stored("7").map(|doc| doc.content),
            Some(Content::text("one"))
        );

        tokio::time::sleep(DEBOUNCE + Duration::from_millis(10)).await;
        settle().await;
        assert_eq!(fx.store.update_calls(), 2);
        let stored = fx.store.stored("7").expect("stored");
        assert_eq!(stored.content, Content::text("two"));
        assert_eq!(stored.version, 3);
        assert!(fx.queue.pending(&id).is_none());
        assert!(trigger.scheduled_ids().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn retry_timer_hitting_a_busy_flush_is_rearmed() {
        let fx = QueueFixture::new(&[document("7", "")]);
        let trigger = trigger_for(&fx);
        let id = DocumentId::from("7");
        fx.queue
            .queue_patch(
                &id,
                DocumentPatch::default().with_title("Act One"),
                PatchReason::Metadata,
            )
            .expect("queue");
        let gate = fx.store.hold_updates();

        let queue = Arc::clone(&fx.queue);
        let flight_id = id.clone();
        let in_flight = tokio::spawn(async move { queue.flush_patch(&flight_id).await });
        fx.store.update_started().await;
        fx.queue
            .queue_patch(
                &id,
                DocumentPatch::default().with_title("Act Two"),
                PatchReason::Metadata,
            )
            .expect("queue newer");

        trigger.schedule_flush(&id, Duration::from_millis(100));
        tokio::time::sleep(Duration::from_millis(150)).await;
        settle().await;
        assert_eq!(fx.store.update_calls(), 1);
        assert_eq!(trigger.scheduled_ids(), vec![id.clone()]);

        gate.add_permits(2);
        assert!(matches!(
            in_flight.await.expect("join"),
            FlushOutcome::Saved(ref doc) if doc.version == 2
        ));
        tokio::time::sleep(DEBOUNCE + Duration::from_millis(10)).await;
        settle().await;
        assert_eq!(
            fx.store.stored("7").map(|doc| doc.title),
            Some("Act Two".to_string())
        );
        assert!(fx.queue.pending(&id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn unchanged_content_is_ignored() {
        let fx = QueueFixture::new(&[document("7", "same\ntext")]);
        let trigger = trigger_for(&fx);
        assert_eq!(
            trigger
                .on_content_changed(&DocumentId::from("7"), Content::text("same\r\ntext"))
                .expect("change"),
            TriggerDecision::Ignored
        );
        assert!(fx.queue.pending_ids().is_empty());
        assert!(trigger.scheduled_ids().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn flush_is_immediate_again_after_min_interval() {
        let fx = QueueFixture::new(&[document("7", "")]);
        let trigger = trigger_for(&fx);
        let id = DocumentId::from("7");

        trigger
            .on_content_changed(&id, Content::text("one"))
            .expect("first");
        settle().await;
        tokio::time::sleep(MIN_INTERVAL + Duration::from_millis(1)).await;
        assert_eq!(
            trigger
                .on_content_changed(&id, Content::text("two"))
                .expect("second"),
            TriggerDecision::Immediate
        );
        settle().await;
        assert_eq!(fx.store.update_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_flush_schedules_retry_in_the_same_slot() {
        let fx = QueueFixture::with_config(&[document("7", "")], backoff_config(1_000, 8_000));
        let trigger = trigger_for(&fx);
        let id = DocumentId::from("7");
        fx.store
            .fail_next([StoreError::RateLimited { retry_after: None }]);

        trigger
            .on_content_changed(&id, Content::text("draft"))
            .expect("change");
        settle().await;
        assert_eq!(fx.store.update_calls(), 1);
        assert_eq!(fx.queue.retry_delay(&id), Duration::from_millis(2_000));
        assert_eq!(trigger.scheduled_ids(), vec![id.clone()]);

        tokio::time::sleep(Duration::from_millis(1_900)).await;
        settle().await;
        assert_eq!(fx.store.update_calls(), 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        settle().await;
        assert_eq!(fx.store.update_calls(), 2);
        assert!(fx.queue.pending(&id).is_none());
        assert!(trigger.scheduled_ids().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn conflicts_are_not_retried_automatically() {
        let fx = QueueFixture::new(&[document("7", "")]);
        let trigger = trigger_for(&fx);
        let id = DocumentId::from("7");
        fx.store.fail_next([StoreError::Conflict { current_version: 4 }]);

        trigger
            .on_content_changed(&id, Content::text("draft"))
            .expect("change");
        settle().await;
        assert!(trigger.scheduled_ids().is_empty());
        assert!(fx.queue.pending(&id).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn logout_cancels_every_timer() {
        let fx = QueueFixture::new(&[document("a", ""), document("b", "")]);
        let trigger = trigger_for(&fx);
        for id in ["a", "b"] {
            trigger.schedule_flush(&DocumentId::from(id), Duration::from_secs(5));
        }
        assert_eq!(trigger.scheduled_ids().len(), 2);

        fx.queue.teardown("user switched");
        assert!(trigger.scheduled_ids().is_empty());

        tokio::time::sleep(Duration::from_secs(10)).await;
        settle().await;
        assert_eq!(fx.store.update_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn bus_content_events_route_through_the_gate() {
        let fx = QueueFixture::new(&[document("7", "")]);
        let _trigger = trigger_for(&fx);
        emit(
            &fx.bus,
            SyncEvent::ContentChanged {
                id: DocumentId::from("7"),
                content: Content::text("from the bus"),
            },
        );
        settle().await;
        assert_eq!(
            fx.store.stored("7").map(|doc| doc.content),
            Some(Content::text("from the bus"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_trigger_detaches_it() {
        let fx = QueueFixture::new(&[document("7", "")]);
        let before = fx.bus.handler_count(CONTENT_CHANGED).expect("count");
        let trigger = trigger_for(&fx);
        assert_eq!(
            fx.bus.handler_count(CONTENT_CHANGED).expect("count"),
            before + 1
        );
        drop(trigger);
        assert_eq!(fx.bus.handler_count(CONTENT_CHANGED).expect("count"), before);
    }
}
