//! Per-execution state management.
//!
//! Each execution owns an isolated JSON state object. Reads hand out deep
//! clones so callers can never mutate engine internals by reference; writes
//! go through [`deep_merge`]. Operations on one execution id are serialized
//! behind that id's own async mutex while operations on different ids
//! proceed in parallel — there is deliberately no global lock.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::ErrorCode;

/// Default lifetime granted by [`StateManager::schedule_cleanup`].
pub const DEFAULT_CLEANUP_DELAY: Duration = Duration::from_millis(3_600_000);

#[derive(Debug, Error)]
pub enum StateError {
    #[error("state for execution '{0}' already exists")]
    AlreadyExists(String),

    #[error("no state found for execution '{0}'")]
    NotFound(String),
}

impl StateError {
    pub fn code(&self) -> ErrorCode {
        match self {
            StateError::AlreadyExists(_) => ErrorCode::StateAlreadyExists,
            StateError::NotFound(_) => ErrorCode::StateNotFound,
        }
    }
}

/// Lifecycle signals external observers may subscribe to.
#[derive(Debug, Clone)]
pub enum StateEvent {
    Initialized { execution_id: String },
    Updated { execution_id: String },
    CleanedUp { execution_id: String },
    AllCleared,
    CleanupError { execution_id: String, message: String },
}

/// Deep-merge `patch` into `target`.
///
/// Two objects merge key-by-key; anything else — arrays included — is
/// replaced wholesale. An explicit `null` is a valid assignment, not a skip.
pub fn deep_merge(target: &mut Value, patch: Value) {
    match (target, patch) {
        (Value::Object(target_map), Value::Object(patch_map)) => {
            for (key, patch_value) in patch_map {
                match target_map.get_mut(&key) {
                    Some(existing) if existing.is_object() && patch_value.is_object() => {
                        deep_merge(existing, patch_value);
                    }
                    _ => {
                        target_map.insert(key, patch_value);
                    }
                }
            }
        }
        (target_slot, patch_value) => *target_slot = patch_value,
    }
}

/// Owns every live execution's state.
pub struct StateManager {
    slots: DashMap<String, Arc<Mutex<Value>>>,
    timers: DashMap<String, JoinHandle<()>>,
    events: broadcast::Sender<StateEvent>,
}

impl Default for StateManager {
    fn default() -> Self {
        Self::new()
    }
}

impl StateManager {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            slots: DashMap::new(),
            timers: DashMap::new(),
            events,
        }
    }

    /// Receive lifecycle events. Dropping the receiver just stops delivery.
    pub fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: StateEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn slot(&self, execution_id: &str) -> Result<Arc<Mutex<Value>>, StateError> {
        self.slots
            .get(execution_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| StateError::NotFound(execution_id.to_string()))
    }

    /// Create state for a new execution.
    ///
    /// # Errors
    /// [`StateError::AlreadyExists`] if the id is live.
    pub async fn initialize(
        &self,
        execution_id: &str,
        initial: Option<Value>,
    ) -> Result<(), StateError> {
        use dashmap::mapref::entry::Entry;

        match self.slots.entry(execution_id.to_string()) {
            Entry::Occupied(_) => Err(StateError::AlreadyExists(execution_id.to_string())),
            Entry::Vacant(vacant) => {
                let initial = initial.unwrap_or_else(|| Value::Object(Map::new()));
                vacant.insert(Arc::new(Mutex::new(initial)));
                debug!(execution_id, "state initialized");
                self.emit(StateEvent::Initialized {
                    execution_id: execution_id.to_string(),
                });
                Ok(())
            }
        }
    }

    /// Deep clone of the current state.
    ///
    /// # Errors
    /// [`StateError::NotFound`] when the id is not live.
    pub async fn get(&self, execution_id: &str) -> Result<Value, StateError> {
        let slot = self.slot(execution_id)?;
        let guard = slot.lock().await;
        Ok(guard.clone())
    }

    /// Deep-merge `patch` into the stored state.
    pub async fn update(&self, execution_id: &str, patch: Value) -> Result<(), StateError> {
        let slot = self.slot(execution_id)?;
        {
            let mut guard = slot.lock().await;
            deep_merge(&mut guard, patch);
        }
        self.emit(StateEvent::Updated {
            execution_id: execution_id.to_string(),
        });
        Ok(())
    }

    /// Read a single top-level key (deep-cloned).
    pub async fn get_property(
        &self,
        execution_id: &str,
        key: &str,
    ) -> Result<Option<Value>, StateError> {
        let slot = self.slot(execution_id)?;
        let guard = slot.lock().await;
        Ok(guard.get(key).cloned())
    }

    /// Write a single top-level key; equivalent to `update({key: value})`.
    pub async fn set_property(
        &self,
        execution_id: &str,
        key: impl Into<String>,
        value: Value,
    ) -> Result<(), StateError> {
        let mut patch = Map::new();
        patch.insert(key.into(), value);
        self.update(execution_id, Value::Object(patch)).await
    }

    pub fn has(&self, execution_id: &str) -> bool {
        self.slots.contains_key(execution_id)
    }

    /// Number of live executions.
    pub fn size(&self) -> usize {
        self.slots.len()
    }

    /// Destroy one execution's state and cancel any scheduled cleanup.
    pub async fn cleanup(&self, execution_id: &str) -> Result<(), StateError> {
        if let Some((_, timer)) = self.timers.remove(execution_id) {
            timer.abort();
        }
        match self.slots.remove(execution_id) {
            Some(_) => {
                debug!(execution_id, "state cleaned up");
                self.emit(StateEvent::CleanedUp {
                    execution_id: execution_id.to_string(),
                });
                Ok(())
            }
            None => Err(StateError::NotFound(execution_id.to_string())),
        }
    }

    /// Destroy state after `delay` (default one hour). Re-scheduling replaces
    /// the previous timer; explicit [`cleanup`](Self::cleanup) cancels it.
    pub fn schedule_cleanup(self: &Arc<Self>, execution_id: &str, delay: Option<Duration>) {
        let delay = delay.unwrap_or(DEFAULT_CLEANUP_DELAY);
        let manager = Arc::clone(self);
        let id = execution_id.to_string();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(err) = manager.cleanup(&id).await {
                warn!(execution_id = %id, error = %err, "scheduled cleanup failed");
                manager.emit(StateEvent::CleanupError {
                    execution_id: id.clone(),
                    message: err.to_string(),
                });
            }
        });

        if let Some(previous) = self.timers.insert(execution_id.to_string(), handle) {
            previous.abort();
        }
    }

    /// Drop everything — states and timers.
    pub fn clear(&self) {
        for entry in self.timers.iter() {
            entry.value().abort();
        }
        self.timers.clear();
        self.slots.clear();
        self.emit(StateEvent::AllCleared);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn initialize_then_get_returns_initial_state() {
        let manager = StateManager::new();
        manager
            .initialize("e1", Some(json!({ "count": 0 })))
            .await
            .expect("init");
        assert_eq!(manager.get("e1").await.unwrap(), json!({ "count": 0 }));
    }

    #[tokio::test]
    async fn double_initialize_fails() {
        let manager = StateManager::new();
        manager.initialize("e1", None).await.expect("init");
        assert!(matches!(
            manager.initialize("e1", None).await,
            Err(StateError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn get_of_unknown_execution_fails() {
        let manager = StateManager::new();
        assert!(matches!(
            manager.get("ghost").await,
            Err(StateError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn update_deep_merges_objects() {
        let manager = StateManager::new();
        manager
            .initialize("e1", Some(json!({ "user": { "name": "a", "age": 1 } })))
            .await
            .expect("init");

        manager
            .update("e1", json!({ "user": { "age": 2 }, "extra": true }))
            .await
            .expect("update");

        assert_eq!(
            manager.get("e1").await.unwrap(),
            json!({ "user": { "name": "a", "age": 2 }, "extra": true })
        );
    }

    #[tokio::test]
    async fn arrays_are_replaced_wholesale() {
        let manager = StateManager::new();
        manager
            .initialize("e1", Some(json!({ "items": [1, 2, 3] })))
            .await
            .expect("init");
        manager
            .update("e1", json!({ "items": [9] }))
            .await
            .expect("update");
        assert_eq!(manager.get("e1").await.unwrap()["items"], json!([9]));
    }

    #[tokio::test]
    async fn explicit_null_is_an_assignment() {
        let manager = StateManager::new();
        manager
            .initialize("e1", Some(json!({ "keep": 1, "drop": 2 })))
            .await
            .expect("init");
        manager
            .update("e1", json!({ "drop": null }))
            .await
            .expect("update");

        let state = manager.get("e1").await.unwrap();
        assert_eq!(state["drop"], Value::Null);
        assert_eq!(state["keep"], json!(1));
    }

    #[tokio::test]
    async fn successive_gets_are_reference_distinct() {
        let manager = StateManager::new();
        manager
            .initialize("e1", Some(json!({ "nested": { "x": 1 } })))
            .await
            .expect("init");

        let mut first = manager.get("e1").await.unwrap();
        first["nested"]["x"] = json!(999);

        // The mutation of the first clone must not leak into the second.
        let second = manager.get("e1").await.unwrap();
        assert_eq!(second["nested"]["x"], json!(1));
    }

    #[tokio::test]
    async fn properties_roundtrip() {
        let manager = StateManager::new();
        manager.initialize("e1", None).await.expect("init");
        manager
            .set_property("e1", "flag", json!(true))
            .await
            .expect("set");
        assert_eq!(
            manager.get_property("e1", "flag").await.unwrap(),
            Some(json!(true))
        );
        assert_eq!(manager.get_property("e1", "missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn cleanup_makes_later_operations_fail() {
        let manager = StateManager::new();
        manager.initialize("e1", None).await.expect("init");
        manager.cleanup("e1").await.expect("cleanup");

        assert!(matches!(
            manager.update("e1", json!({})).await,
            Err(StateError::NotFound(_))
        ));
        // Re-initialization is allowed after cleanup.
        manager.initialize("e1", None).await.expect("re-init");
    }

    #[tokio::test(start_paused = true)]
    async fn scheduled_cleanup_fires_after_delay() {
        let manager = Arc::new(StateManager::new());
        manager.initialize("e1", None).await.expect("init");
        manager.schedule_cleanup("e1", Some(Duration::from_secs(5)));

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(!manager.has("e1"));
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_cleanup_cancels_scheduled_cleanup() {
        let manager = Arc::new(StateManager::new());
        manager.initialize("e1", None).await.expect("init");
        manager.schedule_cleanup("e1", Some(Duration::from_secs(5)));
        manager.cleanup("e1").await.expect("cleanup");

        // Re-initialize; the aborted timer must not fire and destroy it.
        manager.initialize("e1", None).await.expect("re-init");
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(manager.has("e1"));
    }

    #[tokio::test]
    async fn lifecycle_events_are_emitted() {
        let manager = StateManager::new();
        let mut events = manager.subscribe();

        manager.initialize("e1", None).await.expect("init");
        manager.update("e1", json!({ "a": 1 })).await.expect("update");
        manager.cleanup("e1").await.expect("cleanup");

        assert!(matches!(
            events.recv().await.unwrap(),
            StateEvent::Initialized { .. }
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            StateEvent::Updated { .. }
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            StateEvent::CleanedUp { .. }
        ));
    }

    #[test]
    fn deep_merge_recurses_multiple_levels() {
        let mut target = json!({ "a": { "b": { "c": 1, "d": 2 } } });
        deep_merge(&mut target, json!({ "a": { "b": { "c": 10 } } }));
        assert_eq!(target, json!({ "a": { "b": { "c": 10, "d": 2 } } }));
    }

    #[test]
    fn deep_merge_scalar_replaces_object() {
        let mut target = json!({ "a": { "b": 1 } });
        deep_merge(&mut target, json!({ "a": 7 }));
        assert_eq!(target, json!({ "a": 7 }));
    }
}
