//! Edge maps — the runtime value a node hands back to the engine.
//!
//! An [`EdgeMap`] associates edge names with payloads in insertion order.
//! Payloads may be eager JSON values or lazy producers; the engine resolves
//! only the edge it actually decides to follow, so expensive payloads behind
//! untaken branches are never computed.

use std::fmt;

use serde_json::Value;

/// Edge name the engine synthesizes when a node invocation fails.
pub const ERROR_EDGE: &str = "error";

/// Edge name with routing priority; drives the loop manager.
pub const LOOP_EDGE: &str = "loop";

/// A single edge payload: either a ready value or a deferred producer.
pub enum EdgeValue {
    Ready(Value),
    Lazy(Box<dyn FnOnce() -> Value + Send>),
}

impl EdgeValue {
    /// Produce the payload, invoking the producer if the value is lazy.
    pub fn resolve(self) -> Value {
        match self {
            EdgeValue::Ready(value) => value,
            EdgeValue::Lazy(producer) => producer(),
        }
    }
}

impl fmt::Debug for EdgeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EdgeValue::Ready(value) => f.debug_tuple("Ready").field(value).finish(),
            EdgeValue::Lazy(_) => f.write_str("Lazy(..)"),
        }
    }
}

impl From<Value> for EdgeValue {
    fn from(value: Value) -> Self {
        EdgeValue::Ready(value)
    }
}

/// Insertion-ordered map from edge name to payload.
///
/// Routing consults keys in the order the node inserted them, so order is
/// part of the contract — a plain `HashMap` would scramble it.
#[derive(Debug, Default)]
pub struct EdgeMap {
    entries: Vec<(String, EdgeValue)>,
}

impl EdgeMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map holding a single ready edge.
    pub fn single(name: impl Into<String>, value: Value) -> Self {
        let mut map = Self::new();
        map.insert(name, value);
        map
    }

    /// Insert an eager payload. Re-inserting a name replaces the payload in
    /// place, keeping the original position.
    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        self.insert_value(name.into(), EdgeValue::Ready(value));
    }

    /// Insert a lazy payload, invoked only if the engine follows this edge.
    pub fn insert_lazy(
        &mut self,
        name: impl Into<String>,
        producer: impl FnOnce() -> Value + Send + 'static,
    ) {
        self.insert_value(name.into(), EdgeValue::Lazy(Box::new(producer)));
    }

    fn insert_value(&mut self, name: String, value: EdgeValue) {
        match self.entries.iter_mut().find(|(existing, _)| *existing == name) {
            Some(slot) => slot.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|(existing, _)| existing == name)
    }

    /// Edge names in insertion order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove the named entry without resolving it.
    pub fn take(&mut self, name: &str) -> Option<EdgeValue> {
        let position = self.entries.iter().position(|(existing, _)| existing == name)?;
        Some(self.entries.remove(position).1)
    }

    /// Remove and resolve the named entry. This is the only way payloads
    /// leave the map, so untaken lazy edges stay unevaluated.
    pub fn resolve(&mut self, name: &str) -> Option<Value> {
        self.take(name).map(EdgeValue::resolve)
    }
}

impl FromIterator<(String, Value)> for EdgeMap {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        let mut map = Self::new();
        for (name, value) in iter {
            map.insert(name, value);
        }
        map
    }
}
