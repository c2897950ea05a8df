//! The additive context map threaded through every stage (§3).
//!
//! Invariant: once a key is written by a stage, a later stage may not silently
//! overwrite it with a different semantic meaning. We enforce "additive" at the type
//! level by requiring an explicit `overwrite` call for the rare legitimate case
//! (retry metadata), and logging a warning from `insert` when a key already exists.

use std::collections::HashMap;

use serde_json::Value;
use tracing::warn;

#[derive(Debug, Clone, Default)]
pub struct Context {
    data: HashMap<String, Value>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a fresh key. If the key already exists, the previous value is kept and
    /// a warning is logged — stages should use `overwrite` when replacement is
    /// intentional (e.g. `previous_review_feedback` on a code-review retry).
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        if self.data.contains_key(&key) {
            warn!(key = %key, "context key already set; ignoring additive insert");
            return;
        }
        self.data.insert(key, value.into());
    }

    /// Explicit overwrite for keys that are meant to carry retry/iteration state.
    pub fn overwrite(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.data.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.data.keys()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_does_not_clobber_existing_key() {
        let mut ctx = Context::new();
        ctx.insert("architecture", "plan-a");
        ctx.insert("architecture", "plan-b");
        assert_eq!(ctx.get_str("architecture"), Some("plan-a"));
    }

    #[test]
    fn overwrite_replaces_value() {
        let mut ctx = Context::new();
        ctx.insert("previous_review_feedback", "first pass");
        ctx.overwrite("previous_review_feedback", "second pass");
        assert_eq!(ctx.get_str("previous_review_feedback"), Some("second pass"));
    }

    #[test]
    fn unknown_key_is_none() {
        let ctx = Context::new();
        assert!(ctx.get("missing").is_none());
    }
}
