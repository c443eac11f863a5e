//! Shared key-value store.
//!
//! The one piece of run state meant to be touched from outside a run, e.g. a
//! load generator feeding values while runbooks are in flight. Cloning a
//! [`Kv`] yields another handle to the same map.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;

/// Thread-safe shared map of JSON values.
#[derive(Debug, Clone, Default)]
pub struct Kv {
    inner: Arc<RwLock<HashMap<String, Value>>>,
}

impl Kv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.inner.write().insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.read().get(key).cloned()
    }

    pub fn del(&self, key: &str) -> Option<Value> {
        self.inner.write().remove(key)
    }

    pub fn clear(&self) {
        self.inner.write().clear();
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Copy of the current contents as a JSON object.
    pub fn snapshot(&self) -> Value {
        let map = self.inner.read();
        Value::Object(map.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }
}
