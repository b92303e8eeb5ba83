use starlark::environment::GlobalsBuilder;
use starlark::eval::Evaluator;
use starlark::starlark_module;
use starlark::values::Value;
use starlark_map::small_map::SmallMap;

use bfi_interpreter::rule::RuleRecord;

use crate::globals::{current_extra, json_to_value, value_to_json};

/// Declares one rule record from a native-rule call, without attribute
/// coercion or validation: the "autogenerated table of implicit rule
/// attribute lists" the spec names as an out-of-scope collaborator is what
/// would normally enforce per-rule-type schemas (§1); this worker accepts
/// whatever kwargs the build file passes, same as the UDR path but with no
/// required-attribute set beyond `name`.
fn declare<'v>(
    buck_type: &str,
    name: &str,
    kwargs: SmallMap<String, Value<'v>>,
    eval: &mut Evaluator<'v, '_>,
) -> anyhow::Result<Value<'v>> {
    let extra = current_extra(eval)?;
    let base_path = extra.require_build_file(buck_type)?;
    let mut record = RuleRecord::new(buck_type, base_path, name);
    for (key, value) in &kwargs {
        record.set(key.clone(), value_to_json(*value)?);
    }
    let json = record.as_map().clone();
    extra.active.add_rule(record)?;
    Ok(json_to_value(eval.heap(), &serde_json::Value::Object(json)))
}

/// A small, representative native-rule namespace (§4.F "native-rule
/// namespace"). Real deployments generate this list from a static rule-spec
/// table, explicitly out of scope here (§1); these cover the rule kinds the
/// testable scenarios name (`java_library` in S1, `genrule` in S3).
#[starlark_module]
pub fn register_native_rules(builder: &mut GlobalsBuilder) {
    fn genrule<'v>(
        name: &str,
        #[starlark(kwargs)] kwargs: SmallMap<String, Value<'v>>,
        eval: &mut Evaluator<'v, '_>,
    ) -> anyhow::Result<Value<'v>> {
        declare("genrule", name, kwargs, eval)
    }

    fn java_library<'v>(
        name: &str,
        #[starlark(kwargs)] kwargs: SmallMap<String, Value<'v>>,
        eval: &mut Evaluator<'v, '_>,
    ) -> anyhow::Result<Value<'v>> {
        declare("java_library", name, kwargs, eval)
    }

    fn cxx_binary<'v>(
        name: &str,
        #[starlark(kwargs)] kwargs: SmallMap<String, Value<'v>>,
        eval: &mut Evaluator<'v, '_>,
    ) -> anyhow::Result<Value<'v>> {
        declare("cxx_binary", name, kwargs, eval)
    }

    fn cxx_library<'v>(
        name: &str,
        #[starlark(kwargs)] kwargs: SmallMap<String, Value<'v>>,
        eval: &mut Evaluator<'v, '_>,
    ) -> anyhow::Result<Value<'v>> {
        declare("cxx_library", name, kwargs, eval)
    }

    fn python_library<'v>(
        name: &str,
        #[starlark(kwargs)] kwargs: SmallMap<String, Value<'v>>,
        eval: &mut Evaluator<'v, '_>,
    ) -> anyhow::Result<Value<'v>> {
        declare("python_library", name, kwargs, eval)
    }

    fn python_binary<'v>(
        name: &str,
        #[starlark(kwargs)] kwargs: SmallMap<String, Value<'v>>,
        eval: &mut Evaluator<'v, '_>,
    ) -> anyhow::Result<Value<'v>> {
        declare("python_binary", name, kwargs, eval)
    }

    fn sh_binary<'v>(
        name: &str,
        #[starlark(kwargs)] kwargs: SmallMap<String, Value<'v>>,
        eval: &mut Evaluator<'v, '_>,
    ) -> anyhow::Result<Value<'v>> {
        declare("sh_binary", name, kwargs, eval)
    }

    fn export_file<'v>(
        name: &str,
        #[starlark(kwargs)] kwargs: SmallMap<String, Value<'v>>,
        eval: &mut Evaluator<'v, '_>,
    ) -> anyhow::Result<Value<'v>> {
        declare("export_file", name, kwargs, eval)
    }
}
