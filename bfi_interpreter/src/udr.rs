use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use serde_json::Value;
use thiserror::Error;

use crate::rule::RuleRecord;

/// `attr.*`-constructed attribute spec. Grounded directly on the teacher's
/// `buck2_node::attrs::attr::Attribute` (simplified: no coercer/doc/
/// deprecated_default, since this worker has no type-coercion stage).
#[derive(Debug, Clone)]
pub struct Attribute {
    pub default: Option<Value>,
    pub mandatory: bool,
}

impl Attribute {
    pub fn optional(default: Value) -> Self {
        Self {
            default: Some(default),
            mandatory: false,
        }
    }

    pub fn required() -> Self {
        Self {
            default: None,
            mandatory: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum UdrError {
    #[error("missing required attribute `{0}`")]
    MissingRequired(String),
    #[error("unknown attribute `{0}` passed to rule call")]
    UnknownAttribute(String),
    #[error("attribute `{0}` shadows a built-in required/optional attribute")]
    ShadowsBuiltin(String),
}

/// A factory created by `rule(...)` in an extension, named on first top-level
/// binding (§3, §4.E, §4.G). Grounded on `buck2_node::attrs::attr::Attribute`
/// and `buck2_interpreter_for_build::provider::callable::ProviderCallableLike`.
///
/// The "reference to the currently active context" the data model describes
/// is not stored here: the evaluation engine threads the active context
/// explicitly into `invoke` at call time (Design Notes §9), rather than this
/// factory holding a pointer that would need resetting on every load.
#[derive(Debug)]
pub struct UserDefinedRule {
    pub label: String,
    buck_type: Mutex<Option<String>>,
    pub required_attrs: HashSet<String>,
    pub optional_attrs: HashMap<String, Attribute>,
}

impl UserDefinedRule {
    pub fn new(
        label: impl Into<String>,
        required_attrs: HashSet<String>,
        optional_attrs: HashMap<String, Attribute>,
    ) -> Result<Self, UdrError> {
        for name in optional_attrs.keys() {
            if required_attrs.contains(name) {
                return Err(UdrError::ShadowsBuiltin(name.clone()));
            }
        }
        Ok(Self {
            label: label.into(),
            buck_type: Mutex::new(None),
            required_attrs,
            optional_attrs,
        })
    }

    pub fn buck_type(&self) -> Option<String> {
        self.buck_type.lock().unwrap().clone()
    }

    pub fn is_named(&self) -> bool {
        self.buck_type.lock().unwrap().is_some()
    }

    /// Called once by the evaluation engine after the defining extension's
    /// module finishes executing (§4.E): `{label}:{binding_name}`.
    pub fn set_name(&self, binding_name: &str) {
        let mut slot = self.buck_type.lock().unwrap();
        if slot.is_none() {
            *slot = Some(format!("{}:{}", self.label, binding_name));
        }
    }

    /// Validates and builds a `RuleRecord` from a kwarg call (§4.G rules 1-6).
    pub fn invoke(
        &self,
        base_path: &str,
        kwargs: HashMap<String, Value>,
    ) -> Result<RuleRecord, UdrError> {
        for key in kwargs.keys() {
            if !self.required_attrs.contains(key) && !self.optional_attrs.contains_key(key) {
                return Err(UdrError::UnknownAttribute(key.clone()));
            }
        }
        for name in &self.required_attrs {
            if !kwargs.contains_key(name) {
                return Err(UdrError::MissingRequired(name.clone()));
            }
        }
        let buck_type = self.buck_type().unwrap_or_else(|| self.label.clone());
        let name = kwargs
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_owned();
        let mut record = RuleRecord::new(buck_type, base_path, name);
        for (key, value) in &kwargs {
            record.set(key.clone(), value.clone());
        }
        for (name, attr) in &self.optional_attrs {
            if !kwargs.contains_key(name) {
                if attr.mandatory {
                    return Err(UdrError::MissingRequired(name.clone()));
                }
                if let Some(default) = &attr.default {
                    record.set(name.clone(), default.clone());
                }
            }
        }
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::{hashmap, hashset};

    fn rule() -> UserDefinedRule {
        let udr = UserDefinedRule::new(
            "//:r.bzl",
            hashset! { "name".to_owned() },
            hashmap! { "x".to_owned() => Attribute::optional(Value::from("d")) },
        )
        .unwrap();
        udr.set_name("MyRule");
        udr
    }

    #[test]
    fn uses_default_for_missing_optional() {
        let udr = rule();
        let record = udr
            .invoke("pkg", hashmap! { "name".to_owned() => Value::from("n") })
            .unwrap();
        assert_eq!(record.as_map()["x"], Value::from("d"));
        assert_eq!(record.as_map()["buck.type"], "//:r.bzl:MyRule");
    }

    #[test]
    fn missing_required_is_fatal() {
        let udr = rule();
        let err = udr.invoke("pkg", HashMap::new()).unwrap_err();
        assert!(matches!(err, UdrError::MissingRequired(n) if n == "name"));
    }

    #[test]
    fn unknown_kwarg_is_fatal() {
        let udr = rule();
        let err = udr
            .invoke(
                "pkg",
                hashmap! { "name".to_owned() => Value::from("n"), "bogus".to_owned() => Value::from(1) },
            )
            .unwrap_err();
        assert!(matches!(err, UdrError::UnknownAttribute(n) if n == "bogus"));
    }

    #[test]
    fn shadowing_required_attr_rejected_at_construction() {
        let err = UserDefinedRule::new(
            "//:r.bzl",
            hashset! { "name".to_owned() },
            hashmap! { "name".to_owned() => Attribute::optional(Value::Null) },
        )
        .unwrap_err();
        assert!(matches!(err, UdrError::ShadowsBuiltin(n) if n == "name"));
    }
}
