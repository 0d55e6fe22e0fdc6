//! Reactive key/value state for UI consumers.
//!
//! A broadcast sink only: the document cache stays the source of truth and
//! the session pushes snapshots here.

use crate::bus::{BusError, EventBus, OwnerId, Subscription};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Currently selected document, or `null`.
pub const CURRENT_DOCUMENT: &str = "current_document";
/// Document summaries matching the active title filter.
pub const DOCUMENTS: &str = "documents";
/// Active title filter string.
pub const DOCUMENT_FILTER: &str = "document_filter";

#[derive(Default)]
pub struct StateStore {
    values: Mutex<HashMap<String, Value>>,
    bus: EventBus<Value>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn values(&self) -> MutexGuard<'_, HashMap<String, Value>> {
        self.values.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get_state(&self, key: &str) -> Option<Value> {
        self.values().get(key).cloned()
    }

    /// Store `value` under `key` and notify subscribers when it changed.
    ///
    /// # Returns
    /// Number of subscribers notified; zero when the value was unchanged.
    pub fn set_state(&self, key: &str, value: Value) -> Result<usize, BusError> {
        {
            let mut values = self.values();
            if values.get(key) == Some(&value) {
                return Ok(0);
            }
            values.insert(key.to_string(), value.clone());
        }
        self.bus.publish(key, &value)
    }

    pub fn subscribe<F>(
        &self,
        key: &str,
        handler: F,
        owner: Option<&OwnerId>,
    ) -> Result<Subscription<Value>, BusError>
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.bus.subscribe(key, handler, owner)
    }

    pub fn unsubscribe_all(&self, owner: &OwnerId) -> Result<usize, BusError> {
        self.bus.unsubscribe_all(owner)
    }

    /// Drop every stored value and notify each key's subscribers with `null`.
    pub fn reset(&self) -> Result<(), BusError> {
        let keys: Vec<String> = self.values().drain().map(|(key, _)| key).collect();
        for key in keys {
            self.bus.publish(&key, &Value::Null)?;
        }
        Ok(())
    }
}
