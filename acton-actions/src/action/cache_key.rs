//! Versioned cache-key builder scoped to an action.
//!
//! Keys follow `{module}:{version}:{segments...}` with an optional sorted
//! query-style parameter suffix, so invalidation can work on stable prefixes.
//! One builder is injected per handler invocation, scoped to the action name.

use serde_json::Value;
use std::collections::BTreeMap;

const DEFAULT_VERSION: &str = "v1";

/// Builder for hierarchical cache keys.
///
/// ```rust
/// use acton_actions::action::CacheKeyBuilder;
///
/// let key = CacheKeyBuilder::new("transactions")
///     .user_single("u42", "tx9")
///     .make();
/// assert_eq!(key, "transactions:v1:user:u42:single:tx9");
/// ```
#[derive(Debug, Clone)]
pub struct CacheKeyBuilder {
    segments: Vec<String>,
    params: BTreeMap<String, String>,
}

impl CacheKeyBuilder {
    /// Create a builder rooted at `{module}:v1`.
    #[must_use]
    pub fn new(module: impl Into<String>) -> Self {
        Self::with_version(module, DEFAULT_VERSION)
    }

    /// Create a builder rooted at `{module}:{version}`.
    #[must_use]
    pub fn with_version(module: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            segments: vec![format!("{}:{}", module.into(), version.into())],
            params: BTreeMap::new(),
        }
    }

    /// Key for the module's item list.
    #[must_use]
    pub fn list(mut self) -> Self {
        self.segments.push("list".to_string());
        self
    }

    /// Key for a single item by identifier.
    #[must_use]
    pub fn single(mut self, item_id: impl ToString) -> Self {
        self.segments.push("single".to_string());
        self.segments.push(item_id.to_string());
        self
    }

    /// Prefix for all data belonging to a user.
    #[must_use]
    pub fn user_prefix(mut self, user_id: impl ToString) -> Self {
        self.segments.push("user".to_string());
        self.segments.push(user_id.to_string());
        self
    }

    /// Key for a user's item list.
    #[must_use]
    pub fn user_list(self, user_id: impl ToString) -> Self {
        self.user_prefix(user_id).list()
    }

    /// Key for a single item namespaced under a user.
    #[must_use]
    pub fn user_single(self, user_id: impl ToString, item_id: impl ToString) -> Self {
        self.user_prefix(user_id).single(item_id)
    }

    /// Attach a parameter. Parameters render sorted by name so equivalent
    /// keys compare equal regardless of call order.
    #[must_use]
    pub fn param(mut self, name: impl Into<String>, value: &Value) -> Self {
        self.params.insert(name.into(), serialize_value(value));
        self
    }

    /// The key prefix without parameters, for prefix-based invalidation.
    #[must_use]
    pub fn prefix(&self) -> String {
        self.segments.join(":")
    }

    /// Build the final key.
    #[must_use]
    pub fn make(&self) -> String {
        let base = self.prefix();
        if self.params.is_empty() {
            return base;
        }
        let query: Vec<String> = self
            .params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        format!("{base}?{}", query.join("&"))
    }
}

fn serialize_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_versioned_prefix() {
        let key = CacheKeyBuilder::new("assets").list().make();
        assert_eq!(key, "assets:v1:list");
    }

    #[test]
    fn test_user_scoped_keys() {
        assert_eq!(
            CacheKeyBuilder::new("tx").user_list(7).make(),
            "tx:v1:user:7:list"
        );
        assert_eq!(
            CacheKeyBuilder::new("tx").user_single(7, "a").make(),
            "tx:v1:user:7:single:a"
        );
    }

    #[test]
    fn test_params_sorted_by_name() {
        let a = CacheKeyBuilder::new("m")
            .list()
            .param("b", &json!(2))
            .param("a", &json!("x"))
            .make();
        let b = CacheKeyBuilder::new("m")
            .list()
            .param("a", &json!("x"))
            .param("b", &json!(2))
            .make();

        assert_eq!(a, b);
        assert_eq!(a, "m:v1:list?a=x&b=2");
    }

    #[test]
    fn test_object_params_render_as_json() {
        let key = CacheKeyBuilder::new("m")
            .param("filter", &json!({"active": true}))
            .make();
        assert_eq!(key, "m:v1?filter={\"active\":true}");
    }
}
