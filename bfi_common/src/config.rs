use std::collections::HashMap;

use serde_json::Value;

/// Read-only view over the `{section: {field: value}}` config the
/// orchestrator supplies at process start.
///
/// Grounded on the teacher's `LegacyBuckConfigView` trait
/// (`fn get(&self, section: &str, key: &str) -> anyhow::Result<Option<Arc<str>>>`),
/// generalized to JSON values since this worker's config is not restricted
/// to strings.
pub trait ConfigView {
    fn get(&self, section: &str, field: &str) -> Option<&Value>;
}

#[derive(Debug, Default)]
pub struct JsonConfigView {
    sections: HashMap<String, HashMap<String, Value>>,
}

impl JsonConfigView {
    pub fn from_json(value: Value) -> anyhow::Result<Self> {
        let mut sections = HashMap::new();
        if let Value::Object(top) = value {
            for (section, fields) in top {
                let Value::Object(fields) = fields else {
                    anyhow::bail!("config section `{section}` must be an object");
                };
                sections.insert(section, fields.into_iter().collect());
            }
        }
        Ok(Self { sections })
    }

    pub fn empty() -> Self {
        Self::default()
    }
}

impl ConfigView for JsonConfigView {
    fn get(&self, section: &str, field: &str) -> Option<&Value> {
        self.sections.get(section)?.get(field)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reads_existing_field() {
        let view = JsonConfigView::from_json(json!({"a": {"b": "v"}})).unwrap();
        assert_eq!(view.get("a", "b"), Some(&json!("v")));
    }

    #[test]
    fn missing_field_is_none() {
        let view = JsonConfigView::from_json(json!({"a": {"b": "v"}})).unwrap();
        assert_eq!(view.get("a", "c"), None);
        assert_eq!(view.get("z", "c"), None);
    }

    #[test]
    fn rejects_non_object_section() {
        assert!(JsonConfigView::from_json(json!({"a": "not-an-object"})).is_err());
    }
}
