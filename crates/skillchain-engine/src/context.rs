use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde_json::Value;

use skillchain_core::error::{Result, SkillchainError};

/// Key/value store shared by the nodes of one run.
///
/// Clones share the same underlying map, so the engine and any observer of
/// a run see the same data. Each run gets a fresh context.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    data: Arc<RwLock<HashMap<String, Value>>>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a context from initial data.
    pub fn from_map(data: HashMap<String, Value>) -> Self {
        Self {
            data: Arc::new(RwLock::new(data)),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Value>> {
        self.data.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Value>> {
        self.data.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Get a value by key.
    pub fn get(&self, key: &str) -> Result<Value> {
        self.read()
            .get(key)
            .cloned()
            .ok_or_else(|| SkillchainError::MissingKey(key.to_string()))
    }

    /// Get a value as a string, if present and a string.
    pub fn get_str(&self, key: &str) -> Option<String> {
        self.read()
            .get(key)
            .and_then(|v| v.as_str())
            .map(str::to_string)
    }

    /// Set a value, replacing any previous one.
    pub fn set(&self, key: impl Into<String>, value: Value) {
        self.write().insert(key.into(), value);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.read().contains_key(key)
    }

    /// Write several values under a single lock.
    pub fn merge(&self, values: impl IntoIterator<Item = (String, Value)>) {
        let mut data = self.write();
        for (k, v) in values {
            data.insert(k, v);
        }
    }

    /// A point-in-time copy of the data.
    pub fn snapshot(&self) -> HashMap<String, Value> {
        self.read().clone()
    }

    /// Keys currently set, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Take the data out, cloning only if other handles are still alive.
    pub fn into_map(self) -> HashMap<String, Value> {
        match Arc::try_unwrap(self.data) {
            Ok(lock) => lock.into_inner().unwrap_or_else(|e| e.into_inner()),
            Err(shared) => shared.read().unwrap_or_else(|e| e.into_inner()).clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_set_and_get() {
        let ctx = ExecutionContext::new();
        ctx.set("topic", json!("coal gasification"));
        assert_eq!(ctx.get("topic").unwrap(), json!("coal gasification"));
        assert_eq!(ctx.get_str("topic").as_deref(), Some("coal gasification"));
        assert!(ctx.contains("topic"));
    }

    #[test]
    fn test_missing_key() {
        let ctx = ExecutionContext::new();
        let err = ctx.get("absent").unwrap_err();
        assert!(matches!(err, SkillchainError::MissingKey(k) if k == "absent"));
        assert!(ctx.get_str("absent").is_none());
    }

    #[test]
    fn test_clones_share_data() {
        let ctx = ExecutionContext::new();
        let observer = ctx.clone();
        ctx.set("a", json!(1));
        assert_eq!(observer.get("a").unwrap(), json!(1));
    }

    #[test]
    fn test_snapshot_is_detached() {
        let ctx = ExecutionContext::from_map([("a".to_string(), json!(1))].into_iter().collect());
        let snap = ctx.snapshot();
        ctx.set("a", json!(2));
        assert_eq!(snap["a"], json!(1));
        assert_eq!(ctx.get("a").unwrap(), json!(2));
    }

    #[test]
    fn test_merge_and_keys() {
        let ctx = ExecutionContext::new();
        ctx.merge(vec![("b".to_string(), json!(2)), ("a".to_string(), json!(1))]);
        assert_eq!(ctx.keys(), vec!["a", "b"]);
        assert_eq!(ctx.len(), 2);
        assert!(!ctx.is_empty());
    }

    #[test]
    fn test_into_map() {
        let ctx = ExecutionContext::new();
        ctx.set("k", json!("v"));
        let other = ctx.clone();
        let map = ctx.into_map();
        assert_eq!(map["k"], json!("v"));
        assert_eq!(other.into_map()["k"], json!("v"));
    }
}
