use serde_json::{Map, Value};

pub const ATTR_TYPE: &str = "buck.type";
pub const ATTR_BASE_PATH: &str = "buck.base_path";

/// One emitted rule declaration: an attribute-name to JSON-value mapping.
/// Grounded on `module_internals.rs`'s `TargetsRecorder`.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleRecord(Map<String, Value>);

impl RuleRecord {
    pub fn new(buck_type: impl Into<String>, base_path: impl Into<String>, name: impl Into<String>) -> Self {
        let mut map = Map::new();
        map.insert(ATTR_TYPE.to_owned(), Value::String(buck_type.into()));
        map.insert(ATTR_BASE_PATH.to_owned(), Value::String(base_path.into()));
        map.insert("name".to_owned(), Value::String(name.into()));
        RuleRecord(map)
    }

    pub fn set(&mut self, attr: impl Into<String>, value: Value) {
        self.0.insert(attr.into(), value);
    }

    pub fn name(&self) -> &str {
        self.0.get("name").and_then(|v| v.as_str()).unwrap_or("")
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn carries_reserved_keys() {
        let mut rule = RuleRecord::new("java_library", "pkg", "a");
        rule.set("srcs", Value::Array(vec![]));
        let value = rule.into_value();
        assert_eq!(value["buck.type"], "java_library");
        assert_eq!(value["buck.base_path"], "pkg");
        assert_eq!(value["name"], "a");
        assert_eq!(value["srcs"], serde_json::json!([]));
    }
}
