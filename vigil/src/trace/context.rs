//! Execution context attached to trace events.
//!
//! An [`ExecutionContext`] is an insertion-ordered string map whose values are
//! either text or a nested context, e.g. a request's parameters under
//! `"parameters"`. Probes build it lazily when a trace event is pushed.

use serde::ser::{Serialize, SerializeMap, Serializer};

/// One context value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextValue {
    Text(String),
    Nested(ExecutionContext),
}

impl Serialize for ContextValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ContextValue::Text(text) => serializer.serialize_str(text),
            ContextValue::Nested(nested) => nested.serialize(serializer),
        }
    }
}

/// Insertion-ordered key/value map.
///
/// Inserting an existing key replaces its value in place, keeping the
/// original position.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionContext {
    entries: Vec<(String, ContextValue)>,
}

impl ExecutionContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style text entry.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, ContextValue::Text(value.into()));
        self
    }

    /// Builder-style nested entry.
    #[must_use]
    pub fn with_nested(mut self, key: impl Into<String>, nested: ExecutionContext) -> Self {
        self.insert(key, ContextValue::Nested(nested));
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: ContextValue) {
        let key = key.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, existing)) => *existing = value,
            None => self.entries.push((key, value)),
        }
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&ContextValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Text value of `key`, `None` if absent or nested.
    #[must_use]
    pub fn get_text(&self, key: &str) -> Option<&str> {
        match self.get(key)? {
            ContextValue::Text(text) => Some(text),
            ContextValue::Nested(_) => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ContextValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Serialize for ExecutionContext {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (key, value) in &self.entries {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insertion_order_is_preserved() {
        let ctx = ExecutionContext::new().with("zeta", "1").with("alpha", "2").with("mid", "3");
        let keys: Vec<_> = ctx.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn test_replacing_a_key_keeps_its_position() {
        let ctx = ExecutionContext::new().with("a", "1").with("b", "2").with("a", "3");
        assert_eq!(ctx.len(), 2);
        assert_eq!(ctx.iter().next().map(|(k, _)| k), Some("a"));
        assert_eq!(ctx.get_text("a"), Some("3"));
    }

    #[test]
    fn test_nested_context_serializes_as_object() {
        let ctx = ExecutionContext::new()
            .with("uri", "/orders")
            .with_nested("parameters", ExecutionContext::new().with("id", "42"));
        let json = serde_json::to_string(&ctx).unwrap();
        assert_eq!(json, r#"{"uri":"/orders","parameters":{"id":"42"}}"#);
        assert_eq!(ctx.get_text("parameters"), None);
    }
}
