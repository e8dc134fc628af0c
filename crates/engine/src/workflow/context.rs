use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::new_id;

/// Key/value scratch space shared by every step of one instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionContext {
    pub id: String,
    pub workflow_instance_id: String,

    /// Data threaded between steps
    pub data: HashMap<String, Value>,

    /// Additional metadata, not versioned
    pub metadata: HashMap<String, Value>,

    /// Bumped on every change to `data`; stores use it for optimistic concurrency
    pub version: i64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExecutionContext {
    pub fn new(workflow_instance_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            workflow_instance_id: workflow_instance_id.into(),
            data: HashMap::new(),
            metadata: HashMap::new(),
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_data(workflow_instance_id: impl Into<String>, data: HashMap<String, Value>) -> Self {
        let mut context = Self::new(workflow_instance_id);
        context.data = data;
        context
    }

    fn touch(&mut self) {
        self.version += 1;
        self.updated_at = Utc::now();
    }

    pub fn put(&mut self, key: impl Into<String>, value: Value) {
        self.data.insert(key.into(), value);
        self.touch();
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let removed = self.data.remove(key);
        self.touch();
        removed
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.touch();
    }

    /// Insert every entry of `updates`, overwriting existing keys.
    /// Counts as a single version bump.
    pub fn merge(&mut self, updates: HashMap<String, Value>) {
        self.data.extend(updates);
        self.touch();
    }

    pub fn add_metadata(&mut self, key: impl Into<String>, value: Value) {
        self.metadata.insert(key.into(), value);
        self.updated_at = Utc::now();
    }

    /// Combined view used for templating and condition evaluation
    pub fn template_context(&self) -> Value {
        serde_json::json!({
            "data": self.data,
            "metadata": self.metadata,
            "instance": { "id": self.workflow_instance_id },
        })
    }

    /// Dotted lookup into `template_context()`. Paths that do not start with
    /// `data.`, `metadata.` or `instance.` are looked up in `data`.
    /// Numeric segments index into arrays.
    pub fn resolve(&self, path: &str) -> Option<Value> {
        let root = self.template_context();
        let qualified = ["data.", "metadata.", "instance."]
            .iter()
            .any(|prefix| path.starts_with(prefix));
        let mut current = if qualified { &root } else { root.get("data")? };

        for part in path.split('.') {
            match current {
                Value::Object(map) => {
                    current = map.get(part)?;
                }
                Value::Array(arr) => {
                    let index: usize = part.parse().ok()?;
                    current = arr.get(index)?;
                }
                _ => return None,
            }
        }

        Some(current.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_mutations_bump_version() {
        let mut context = ExecutionContext::new("instance-1");
        assert_eq!(context.version, 1);

        context.put("key1", json!("value1"));
        assert_eq!(context.version, 2);

        let mut updates = HashMap::new();
        updates.insert("key1".to_string(), json!("updated"));
        updates.insert("key2".to_string(), json!(2));
        context.merge(updates);
        assert_eq!(context.version, 3);
        assert_eq!(context.get("key1"), Some(&json!("updated")));
        assert_eq!(context.get("key2"), Some(&json!(2)));

        assert_eq!(context.remove("key2"), Some(json!(2)));
        assert!(!context.contains_key("key2"));

        context.add_metadata("source", json!("cli"));
        assert_eq!(context.version, 4);

        context.clear();
        assert!(context.data.is_empty());
        assert_eq!(context.version, 5);
    }

    #[test]
    fn test_template_context_shape() {
        let mut context = ExecutionContext::new("instance-1");
        context.put("approved", json!(true));
        let view = context.template_context();
        assert_eq!(view["data"]["approved"], json!(true));
        assert_eq!(view["instance"]["id"], json!("instance-1"));
    }

    #[test]
    fn test_resolve_paths() {
        let mut context = ExecutionContext::new("instance-1");
        context.put("order", json!({ "items": [{ "sku": "A-1" }] }));
        assert_eq!(context.resolve("order.items.0.sku"), Some(json!("A-1")));
        assert_eq!(context.resolve("data.order.items.0.sku"), Some(json!("A-1")));
        assert_eq!(context.resolve("instance.id"), Some(json!("instance-1")));
        assert_eq!(context.resolve("order.items.9"), None);
        assert_eq!(context.resolve("nothing"), None);
    }
}
