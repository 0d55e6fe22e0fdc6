//! Topic-keyed publish/subscribe with owner-scoped teardown.
//!
//! Handlers run outside the bus lock, so a handler may subscribe, unsubscribe,
//! or publish re-entrantly. A panicking handler is isolated: the panic is
//! logged and delivery continues with the remaining handlers.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use thiserror::Error;
use tracing::error;


/// Identifier of one registration, handed out by [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Stable owner id used to tear down a component's subscriptions in one call.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OwnerId(String);

impl OwnerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event bus runtime errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    /// The bus was destroyed; it accepts no further calls.
    #[error("event bus has been destroyed")]
    Destroyed,
    /// Internal mutex state is poisoned.
    #[error("event bus state is poisoned")]
    Poisoned,
}

type Handler<P> = Arc<dyn Fn(&P) + Send + Sync>;

struct BusState<P> {
    topics: HashMap<String, HashMap<SubscriptionId, Handler<P>>>,
    owners: HashMap<OwnerId, HashSet<(String, SubscriptionId)>>,
    owner_of: HashMap<SubscriptionId, OwnerId>,
    destroyed: bool,
}

impl<P> Default for BusState<P> {
    fn default() -> Self {
        Self {
            topics: HashMap::new(),
            owners: HashMap::new(),
            owner_of: HashMap::new(),
            destroyed: false,
        }
    }
}

impl<P> BusState<P> {
    fn remove(&mut self, topic: &str, id: SubscriptionId) -> bool {
        let removed = match self.topics.get_mut(topic) {
            Some(handlers) => {
                let removed = handlers.remove(&id).is_some();
                if handlers.is_empty() {
                    self.topics.remove(topic);
                }
                removed
            }
            None => false,
        };
        if let Some(owner) = self.owner_of.remove(&id) {
            if let Some(registrations) = self.owners.get_mut(&owner) {
                registrations.remove(&(topic.to_string(), id));
                if registrations.is_empty() {
                    self.owners.remove(&owner);
                }
            }
        }
        removed
    }

    fn is_registered(&self, topic: &str, id: SubscriptionId) -> bool {
        self.topics
            .get(topic)
            .map(|handlers| handlers.contains_key(&id))
            .unwrap_or(false)
    }

    fn reset(&mut self) {
        self.topics.clear();
        self.owners.clear();
        self.owner_of.clear();
    }
}

fn lock_state<P>(inner: &Mutex<BusState<P>>) -> Result<MutexGuard<'_, BusState<P>>, BusError> {
    let state = inner.lock().map_err(|_| BusError::Poisoned)?;
    if state.destroyed {
        return Err(BusError::Destroyed);
    }
    Ok(state)
}

/// Handle bound to exactly one registration.
pub struct Subscription<P> {
    bus: Weak<Mutex<BusState<P>>>,
    topic: String,
    id: SubscriptionId,
}

impl<P> fmt::Debug for Subscription<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("id", &self.id)
            .finish()
    }
}

impl<P> Subscription<P> {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn topic(&self) -> &str {
        self.topic.as_str()
    }

    /// Remove this registration.
    ///
    /// # Returns
    /// `Ok(true)` when the registration was still present, `Ok(false)` when it
    /// had already been removed (or the bus was dropped).
    ///
    /// # Errors
    /// Returns [`BusError::Destroyed`] when the bus was destroyed.
    pub fn unsubscribe(self) -> Result<bool, BusError> {
        let Some(inner) = self.bus.upgrade() else {
            return Ok(false);
        };
        let mut state = lock_state(&inner)?;
        Ok(state.remove(&self.topic, self.id))
    }
}

/// Topic-keyed publish/subscribe hub.
///
/// Delivery order between handlers of one topic is unspecified; every handler
/// registered at publish time is invoked exactly once per publish.
pub struct EventBus<P> {
    inner: Arc<Mutex<BusState<P>>>,
    next_id: AtomicU64,
}

impl<P> Default for EventBus<P> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(BusState::default())),
            next_id: AtomicU64::new(1),
        }
    }
}

impl<P: 'static> EventBus<P> {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate_id(&self) -> SubscriptionId {
        SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn register(
        &self,
        topic: &str,
        id: SubscriptionId,
        handler: Handler<P>,
        owner: Option<&OwnerId>,
    ) -> Result<Subscription<P>, BusError> {
        let mut state = lock_state(&self.inner)?;
        state
            .topics
            .entry(topic.to_string())
            .or_default()
            .insert(id, handler);
        if let Some(owner) = owner {
            state
                .owners
                .entry(owner.clone())
                .or_default()
                .insert((topic.to_string(), id));
            state.owner_of.insert(id, owner.clone());
        }
        Ok(Subscription {
            bus: Arc::downgrade(&self.inner),
            topic: topic.to_string(),
            id,
        })
    }

    /// Register `handler` for `topic`, optionally indexed under `owner`.
    ///
    /// # Returns
    /// A [`Subscription`] that removes exactly this registration.
    ///
    /// # Errors
    /// Returns [`BusError::Destroyed`] after [`EventBus::destroy`].
    pub fn subscribe<F>(
        &self,
        topic: &str,
        handler: F,
        owner: Option<&OwnerId>,
    ) -> Result<Subscription<P>, BusError>
    where
        F: Fn(&P) + Send + Sync + 'static,
    {
        let id = self.allocate_id();
        self.register(topic, id, Arc::new(handler), owner)
    }

    /// Register a handler that is delivered at most once, then removes itself.
    ///
    /// # Errors
    /// Returns [`BusError::Destroyed`] after [`EventBus::destroy`].
    pub fn once<F>(&self, topic: &str, handler: F) -> Result<Subscription<P>, BusError>
    where
        F: FnOnce(&P) + Send + 'static,
    {
        let id = self.allocate_id();
        let slot = Mutex::new(Some(handler));
        let bus = Arc::downgrade(&self.inner);
        let own_topic = topic.to_string();
        let wrapper = move |payload: &P| {
            let taken = match slot.lock() {
                Ok(mut guard) => guard.take(),
                Err(_) => None,
            };
            let Some(handler) = taken else {
                return;
            };
            if let Some(inner) = bus.upgrade() {
                if let Ok(mut state) = lock_state(&inner) {
                    state.remove(&own_topic, id);
                }
            }
            handler(payload);
        };
        self.register(topic, id, Arc::new(wrapper), None)
    }

    /// Remove one registration. Unknown topics and ids are a no-op.
    ///
    /// # Returns
    /// `Ok(true)` when a registration was removed.
    ///
    /// # Errors
    /// Returns [`BusError::Destroyed`] after [`EventBus::destroy`].
    pub fn unsubscribe(&self, topic: &str, id: SubscriptionId) -> Result<bool, BusError> {
        let mut state = lock_state(&self.inner)?;
        Ok(state.remove(topic, id))
    }

    /// Remove every registration made with `owner`, then forget the owner.
    ///
    /// # Returns
    /// Number of registrations removed (zero for an unknown owner).
    ///
    /// # Errors
    /// Returns [`BusError::Destroyed`] after [`EventBus::destroy`].
    pub fn unsubscribe_all(&self, owner: &OwnerId) -> Result<usize, BusError> {
        let mut state = lock_state(&self.inner)?;
        let Some(registrations) = state.owners.remove(owner) else {
            return Ok(0);
        };
        let mut removed = 0;
        for (topic, id) in registrations {
            if state.remove(&topic, id) {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Invoke every handler registered for `topic` with `payload`.
    ///
    /// Handlers are snapshotted before delivery; a handler removed by an
    /// earlier handler in the same publish is skipped. Panics are caught and
    /// logged, never propagated.
    ///
    /// # Returns
    /// Number of handlers invoked.
    ///
    /// # Errors
    /// Returns [`BusError::Destroyed`] after [`EventBus::destroy`].
    pub fn publish(&self, topic: &str, payload: &P) -> Result<usize, BusError> {
        let snapshot: Vec<(SubscriptionId, Handler<P>)> = {
            let state = lock_state(&self.inner)?;
            state
                .topics
                .get(topic)
                .map(|handlers| {
                    handlers
                        .iter()
                        .map(|(id, handler)| (*id, Arc::clone(handler)))
                        .collect()
                })
                .unwrap_or_default()
        };

        let mut invoked = 0;
        for (id, handler) in snapshot {
            let still_registered = match lock_state(&self.inner) {
                Ok(state) => state.is_registered(topic, id),
                Err(_) => break,
            };
            if !still_registered {
                continue;
            }
            invoked += 1;
            if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| handler(payload))) {
                error!(
                    topic = topic,
                    subscription = %id,
                    "event handler panicked: {}",
                    panic_message(panic.as_ref())
                );
            }
        }
        Ok(invoked)
    }

    /// Remove all handlers for one topic, or reset the bus when `topic` is `None`.
    ///
    /// # Errors
    /// Returns [`BusError::Destroyed`] after [`EventBus::destroy`].
    pub fn clear(&self, topic: Option<&str>) -> Result<(), BusError> {
        let mut state = lock_state(&self.inner)?;
        match topic {
            Some(topic) => {
                let ids: Vec<SubscriptionId> = state
                    .topics
                    .get(topic)
                    .map(|handlers| handlers.keys().copied().collect())
                    .unwrap_or_default();
                for id in ids {
                    state.remove(topic, id);
                }
            }
            None => state.reset(),
        }
        Ok(())
    }

    /// Clear everything and reject every later call with [`BusError::Destroyed`].
    ///
    /// Destroying twice is reported as an error too.
    pub fn destroy(&self) -> Result<(), BusError> {
        let mut state = lock_state(&self.inner)?;
        state.reset();
        state.destroyed = true;
        Ok(())
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner
            .lock()
            .map(|state| state.destroyed)
            .unwrap_or(false)
    }

    /// Number of handlers registered for `topic`.
    ///
    /// # Errors
    /// Returns [`BusError::Destroyed`] after [`EventBus::destroy`].
    pub fn handler_count(&self, topic: &str) -> Result<usize, BusError> {
        let state = lock_state(&self.inner)?;
        Ok(state.topics.get(topic).map(HashMap::len).unwrap_or(0))
    }

    /// Number of live registrations indexed under `owner`.
    ///
    /// # Errors
    /// Returns [`BusError::Destroyed`] after [`EventBus::destroy`].
    pub fn owner_registration_count(&self, owner: &OwnerId) -> Result<usize, BusError> {
        let state = lock_state(&self.inner)?;
        Ok(state.owners.get(owner).map(HashSet::len).unwrap_or(0))
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}
