use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use allocative::Allocative;
use starlark::environment::GlobalsBuilder;
use starlark::eval::{Arguments, Evaluator};
use starlark::starlark_module;
use starlark::starlark_simple_value;
use starlark::values::{NoSerialize, ProvidesStaticType, StarlarkValue, Value, ValueLike};

use bfi_interpreter::udr::{Attribute, UserDefinedRule};

use crate::extra::ContextExtra;
use crate::globals::value_to_json;

/// The callable value `rule(...)` returns. Wraps a `UserDefinedRule` so it
/// can live on the Starlark heap and be invoked from build-file code.
///
/// Grounded on `buck2_interpreter_for_build::provider::callable`'s
/// `ProviderCallableLike` pattern: a thin Starlark-callable wrapper around a
/// Rust-side factory, with the real validation logic (here,
/// `UserDefinedRule::invoke`) living outside the Starlark value itself.
#[derive(ProvidesStaticType, NoSerialize, Allocative)]
pub struct RuleFactory {
    pub inner: Arc<UserDefinedRule>,
}

impl fmt::Debug for RuleFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<rule {}>", self.inner.label)
    }
}

impl fmt::Display for RuleFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

starlark_simple_value!(RuleFactory);

impl<'v> StarlarkValue<'v> for RuleFactory {
    starlark::starlark_type!("rule");

    fn invoke(
        &self,
        _me: Value<'v>,
        args: &Arguments<'v, '_>,
        eval: &mut Evaluator<'v, '_>,
    ) -> anyhow::Result<Value<'v>> {
        let extra = eval
            .extra
            .and_then(|e| e.downcast_ref::<ContextExtra>())
            .ok_or_else(|| anyhow::anyhow!("rule invoked outside of an active evaluation context"))?;
        let base_path = extra.require_build_file("rule invocation")?;

        anyhow::ensure!(args.positional1().is_none(), "rule calls accept only keyword arguments");
        let mut kwargs = HashMap::new();
        for (name, value) in args.names()? {
            kwargs.insert(name.as_str().to_owned(), value_to_json(value)?);
        }

        let record = self.inner.invoke(&base_path, kwargs)?;
        let json = record.as_map().clone();
        extra.active.add_rule(record)?;
        Ok(crate::globals::json_to_value(eval.heap(), &serde_json::Value::Object(json)))
    }
}

/// `rule(attrs=None, test=False, **_)`: only valid in extension context
/// (§4.F, §4.G). Returns an unnamed `RuleFactory`; naming happens when the
/// defining extension's module finishes loading (§4.E).
#[starlark_module]
pub fn register_rule_natives(builder: &mut GlobalsBuilder) {
    fn rule<'v>(
        #[starlark(require = named)] attrs: Option<Value<'v>>,
        #[starlark(require = named, default = false)] test: bool,
        eval: &mut Evaluator<'v, '_>,
    ) -> anyhow::Result<RuleFactory> {
        let extra = eval
            .extra
            .and_then(|e| e.downcast_ref::<ContextExtra>())
            .ok_or_else(|| anyhow::anyhow!("rule() invoked outside of an active evaluation context"))?;
        let _ = test;

        let mut required = HashSet::new();
        required.insert("name".to_owned());
        let mut optional = HashMap::new();
        if let Some(attrs) = attrs {
            let dict = starlark::values::dict::DictRef::from_value(attrs)
                .ok_or_else(|| anyhow::anyhow!("rule(attrs=...) must be a dict"))?;
            for (k, v) in dict.iter() {
                let name = k
                    .unpack_str()
                    .ok_or_else(|| anyhow::anyhow!("rule attribute names must be strings"))?;
                if name.starts_with('_') {
                    // Private attributes are dropped silently, never overrideable (§4.G rule 5).
                    continue;
                }
                let attr = v
                    .downcast_ref::<AttributeValue>()
                    .ok_or_else(|| anyhow::anyhow!("rule attribute values must come from attr.*"))?;
                optional.insert(name.to_owned(), attr.inner.clone());
            }
        }

        let label = extra
            .active
            .current_label()
            .ok_or_else(|| anyhow::anyhow!("rule() is only available in an extension file"))?;
        let udr = UserDefinedRule::new(label, required, optional)?;
        Ok(RuleFactory { inner: Arc::new(udr) })
    }
}

/// Starlark wrapper around `Attribute`, returned by every `attr.*` function.
#[derive(Debug, ProvidesStaticType, NoSerialize, Allocative)]
pub struct AttributeValue {
    pub inner: Attribute,
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<attr.* default={:?} mandatory={}>", self.inner.default, self.inner.mandatory)
    }
}

starlark_simple_value!(AttributeValue);

impl<'v> StarlarkValue<'v> for AttributeValue {
    starlark::starlark_type!("attribute");
}

fn attr_of(default: Option<serde_json::Value>, mandatory: bool) -> AttributeValue {
    match default {
        Some(d) if !mandatory => AttributeValue {
            inner: Attribute::optional(d),
        },
        _ => AttributeValue {
            inner: Attribute::required(),
        },
    }
}

/// The `attr` namespace (`attr.int`, `attr.string`, ...). Each constructor
/// accepts a `default` and forwards unrecognized kwargs (`doc`, validators)
/// unused, as SPEC_FULL.md §3 `Attribute` describes.
#[starlark_module]
pub fn register_attr_natives(builder: &mut GlobalsBuilder) {
    fn int(#[starlark(require = named)] default: Option<i32>) -> anyhow::Result<AttributeValue> {
        Ok(attr_of(default.map(serde_json::Value::from), default.is_none()))
    }

    fn string(#[starlark(require = named)] default: Option<String>) -> anyhow::Result<AttributeValue> {
        Ok(attr_of(default.map(serde_json::Value::from), default.is_none()))
    }

    fn bool(#[starlark(require = named)] default: Option<bool>) -> anyhow::Result<AttributeValue> {
        Ok(attr_of(default.map(serde_json::Value::from), default.is_none()))
    }

    fn int_list(#[starlark(require = named, default = Vec::new())] default: Vec<i32>) -> anyhow::Result<AttributeValue> {
        Ok(attr_of(Some(serde_json::Value::from(default)), false))
    }

    fn string_list(
        #[starlark(require = named, default = Vec::new())] default: Vec<String>,
    ) -> anyhow::Result<AttributeValue> {
        Ok(attr_of(Some(serde_json::Value::from(default)), false))
    }

    fn source(#[starlark(require = named)] default: Option<String>) -> anyhow::Result<AttributeValue> {
        Ok(attr_of(default.map(serde_json::Value::from), default.is_none()))
    }

    fn source_list(
        #[starlark(require = named, default = Vec::new())] default: Vec<String>,
    ) -> anyhow::Result<AttributeValue> {
        Ok(attr_of(Some(serde_json::Value::from(default)), false))
    }

    fn dep(#[starlark(require = named)] default: Option<String>) -> anyhow::Result<AttributeValue> {
        Ok(attr_of(default.map(serde_json::Value::from), default.is_none()))
    }

    fn dep_list(
        #[starlark(require = named, default = Vec::new())] default: Vec<String>,
    ) -> anyhow::Result<AttributeValue> {
        Ok(attr_of(Some(serde_json::Value::from(default)), false))
    }

    fn output(#[starlark(require = named)] default: Option<String>) -> anyhow::Result<AttributeValue> {
        Ok(attr_of(default.map(serde_json::Value::from), default.is_none()))
    }

    fn output_list(
        #[starlark(require = named, default = Vec::new())] default: Vec<String>,
    ) -> anyhow::Result<AttributeValue> {
        Ok(attr_of(Some(serde_json::Value::from(default)), false))
    }
}

/// `select(conditions, no_match_message=None)` (§4.F): returns an opaque
/// selector, interpreted only by the downstream orchestrator. Grounded on
/// `attrs/coerce/coerced_attr.rs`'s `select()`/`SelectError`, simplified
/// since this worker does no coercion — it just needs a stable, round-
/// trippable wire shape.
#[starlark_module]
pub fn register_select_natives(builder: &mut GlobalsBuilder) {
    fn select<'v>(
        conditions: Value<'v>,
        #[starlark(require = named)] no_match_message: Option<String>,
        eval: &mut Evaluator<'v, '_>,
    ) -> anyhow::Result<Value<'v>> {
        let dict = starlark::values::dict::DictRef::from_value(conditions)
            .ok_or_else(|| anyhow::anyhow!("select() takes a dict"))?;
        let mut entries = serde_json::Map::new();
        for (k, v) in dict.iter() {
            let key = k
                .unpack_str()
                .ok_or_else(|| anyhow::anyhow!("select() keys must be strings"))?;
            entries.insert(key.to_owned(), value_to_json(v)?);
        }
        let mut wrapper = serde_json::Map::new();
        wrapper.insert("__select__".to_owned(), serde_json::Value::Object(entries));
        if let Some(msg) = no_match_message {
            wrapper.insert("__no_match_message__".to_owned(), serde_json::Value::String(msg));
        }
        Ok(crate::globals::json_to_value(eval.heap(), &serde_json::Value::Object(wrapper)))
    }

    fn depset<'v>(elements: Value<'v>, eval: &mut Evaluator<'v, '_>) -> anyhow::Result<Value<'v>> {
        // Iterates in insertion order (§4.F); a plain list already does.
        let list = starlark::values::list::ListRef::from_value(elements)
            .ok_or_else(|| anyhow::anyhow!("depset() takes a list"))?;
        let values: Vec<Value<'v>> = list.iter().collect();
        Ok(eval.heap().alloc(values))
    }

    fn provider<'v>(
        #[starlark(require = named, default = "")] doc: &str,
        #[starlark(require = named)] fields: Option<Value<'v>>,
        eval: &mut Evaluator<'v, '_>,
    ) -> anyhow::Result<Value<'v>> {
        let _ = doc;
        match fields {
            Some(fields) => {
                let field_names = if let Some(list) = starlark::values::list::ListRef::from_value(fields) {
                    list.iter()
                        .map(|v| v.unpack_str().map(|s| s.to_owned()))
                        .collect::<Option<Vec<_>>>()
                        .ok_or_else(|| anyhow::anyhow!("provider() fields list must contain only strings"))?
                } else if let Some(dict) = starlark::values::dict::DictRef::from_value(fields) {
                    dict.iter()
                        .map(|(k, _)| k.unpack_str().map(|s| s.to_owned()))
                        .collect::<Option<Vec<_>>>()
                        .ok_or_else(|| anyhow::anyhow!("provider() fields dict keys must be strings"))?
                } else {
                    anyhow::bail!("provider(fields=...) must be a list or dict")
                };
                let values: Vec<Value<'v>> =
                    field_names.into_iter().map(|f| eval.heap().alloc(f)).collect();
                Ok(eval.heap().alloc(values))
            }
            None => Ok(Value::new_none()),
        }
    }

    fn r#struct<'v>(eval: &mut Evaluator<'v, '_>, args: &Arguments<'v, '_>) -> anyhow::Result<Value<'v>> {
        let mut dict = starlark::values::dict::Dict::default();
        for (name, value) in args.names()? {
            dict.insert_hashed(eval.heap().alloc(name.as_str()).get_hashed().unwrap(), value);
        }
        Ok(eval.heap().alloc(dict))
    }
}
