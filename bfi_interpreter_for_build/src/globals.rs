use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use starlark::environment::GlobalsBuilder;
use starlark::eval::Evaluator;
use starlark::starlark_module;
use starlark::values::dict::DictRef;
use starlark::values::list::ListRef;
use starlark::values::none::NoneType;
use starlark::values::{Heap, Value, ValueLike};

use bfi_common::glob::{evaluate_glob, evaluate_subdir_glob, GlobParams};
use bfi_common::sandbox::EnvAccess;

use crate::extra::ContextExtra;
use crate::host_info::HOST_INFO;

pub(crate) fn current_extra<'v, 'a>(eval: &Evaluator<'v, 'a>) -> anyhow::Result<&'a ContextExtra<'a>> {
    eval.extra
        .and_then(|e| e.downcast_ref::<ContextExtra<'a>>())
        .ok_or_else(|| anyhow::anyhow!("builtin called outside of an active evaluation context"))
}

pub(crate) fn json_to_value<'v>(heap: &'v Heap, value: &JsonValue) -> Value<'v> {
    match value {
        JsonValue::Null => Value::new_none(),
        JsonValue::Bool(b) => Value::new_bool(*b),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                heap.alloc(i)
            } else {
                heap.alloc(n.as_f64().unwrap_or(0.0))
            }
        }
        JsonValue::String(s) => heap.alloc(s.as_str()),
        JsonValue::Array(items) => {
            let values: Vec<Value<'v>> = items.iter().map(|v| json_to_value(heap, v)).collect();
            heap.alloc(values)
        }
        JsonValue::Object(map) => {
            let mut dict = starlark::values::dict::Dict::default();
            for (k, v) in map {
                dict.insert_hashed(
                    heap.alloc(k.as_str()).get_hashed().unwrap(),
                    json_to_value(heap, v),
                );
            }
            heap.alloc(dict)
        }
    }
}

pub(crate) fn value_to_json(value: Value) -> anyhow::Result<JsonValue> {
    if value.is_none() {
        return Ok(JsonValue::Null);
    }
    if let Some(b) = value.unpack_bool() {
        return Ok(JsonValue::Bool(b));
    }
    if let Some(i) = value.unpack_i32() {
        return Ok(JsonValue::from(i));
    }
    if let Some(s) = value.unpack_str() {
        return Ok(JsonValue::String(s.to_owned()));
    }
    if let Some(list) = ListRef::from_value(value) {
        return Ok(JsonValue::Array(
            list.iter().map(value_to_json).collect::<anyhow::Result<_>>()?,
        ));
    }
    if let Some(dict) = DictRef::from_value(value) {
        let mut map = serde_json::Map::new();
        for (k, v) in dict.iter() {
            let key = k
                .unpack_str()
                .ok_or_else(|| anyhow::anyhow!("rule attribute dict keys must be strings"))?;
            map.insert(key.to_owned(), value_to_json(v)?);
        }
        return Ok(JsonValue::Object(map));
    }
    Ok(JsonValue::String(value.to_str()))
}

fn unpack_string_list(value: Value, what: &str) -> anyhow::Result<Vec<String>> {
    if value.unpack_str().is_some() {
        anyhow::bail!("{what} must be a sequence of strings, not a bare string");
    }
    let list = ListRef::from_value(value)
        .ok_or_else(|| anyhow::anyhow!("{what} must be a sequence of strings"))?;
    list.iter()
        .map(|v| {
            v.unpack_str()
                .map(|s| s.to_owned())
                .ok_or_else(|| anyhow::anyhow!("{what} must contain only strings"))
        })
        .collect()
}

/// Registers the built-ins available in every context (§4.F). Grounded on
/// `buck2_interpreter::functions::sha256::register_sha256` and
/// `buck2_interpreter_for_build::interpreter::natives::register_module_natives`
/// for the `#[starlark_module]` registration idiom.
#[starlark_module]
pub fn register_common_natives(builder: &mut GlobalsBuilder) {
    fn sha256(val: &str) -> anyhow::Result<String> {
        let mut hasher = Sha256::new();
        hasher.update(val.as_bytes());
        Ok(hex::encode(hasher.finalize()))
    }

    fn host_info<'v>(heap: &'v Heap) -> anyhow::Result<Value<'v>> {
        Ok(json_to_value(heap, &HOST_INFO))
    }

    fn read_config<'v>(
        section: &str,
        field: &str,
        #[starlark(default = NoneType)] default: Value<'v>,
        eval: &mut Evaluator<'v, '_>,
    ) -> anyhow::Result<Value<'v>> {
        let extra = current_extra(eval)?;
        let found = extra.config.get(section, field).cloned();
        let recorded = found
            .clone()
            .unwrap_or(JsonValue::String("<absent>".to_owned()));
        extra
            .active
            .with_accumulators_mut(|a| a.record_config(section, field, recorded));
        match found {
            Some(value) => Ok(json_to_value(eval.heap(), &value)),
            None => Ok(default),
        }
    }

    fn fail(message: &str, #[starlark(default = NoneType)] attr: Value) -> anyhow::Result<NoneType> {
        if attr.is_none() {
            anyhow::bail!("{message}")
        } else {
            anyhow::bail!("{}: {message}", attr.to_str())
        }
    }

    fn implicit_package_symbol<'v>(
        name: &str,
        #[starlark(default = NoneType)] default: Value<'v>,
        eval: &mut Evaluator<'v, '_>,
    ) -> anyhow::Result<Value<'v>> {
        let extra = current_extra(eval)?;
        let found = extra
            .active
            .with_accumulators_mut(|a| a.implicit_package_symbols.get(name).cloned());
        match found {
            Some(v) => Ok(json_to_value(eval.heap(), &v)),
            None => Ok(default),
        }
    }

    fn add_build_file_dep(name: &str, eval: &mut Evaluator) -> anyhow::Result<NoneType> {
        let extra = current_extra(eval)?;
        // Same include-label grammar `include_defs`/`load` use; the target
        // is only ever recorded, never executed.
        let resolved = extra.includes.resolve_include_path(name)?;
        extra.active.with_accumulators_mut(|a| a.record_include(resolved));
        Ok(NoneType)
    }

    /// `read_env(name, default=None)`: the build-file-facing entry point for
    /// the sandboxed `EnvAccess` facade (no `os.environ` exists in this
    /// dialect, so reads go through a named builtin instead).
    fn read_env<'v>(
        name: &str,
        #[starlark(default = NoneType)] default: Value<'v>,
        eval: &mut Evaluator<'v, '_>,
    ) -> anyhow::Result<Value<'v>> {
        let extra = current_extra(eval)?;
        match env_read(extra, name) {
            Some(value) => Ok(eval.heap().alloc(value)),
            None => Ok(default),
        }
    }
}

/// Registers the globbing built-ins (§4.B), delegating to `bfi_common::glob`.
#[starlark_module]
pub fn register_glob_natives(builder: &mut GlobalsBuilder) {
    fn glob<'v>(
        include: Value<'v>,
        #[starlark(default = NoneType)] exclude: Value<'v>,
        #[starlark(default = false)] include_dotfiles: bool,
        eval: &mut Evaluator<'v, '_>,
    ) -> anyhow::Result<Value<'v>> {
        let extra = current_extra(eval)?;
        let includes = unpack_string_list(include, "glob includes")?;
        let excludes = if exclude.is_none() {
            Vec::new()
        } else {
            unpack_string_list(exclude, "glob excludes")?
        };
        let dirname = extra.active.dirname();
        let result = evaluate_glob(
            extra.file_ops,
            extra.watcher,
            &GlobParams {
                includes: &includes,
                excludes: &excludes,
                include_dotfiles,
                search_base: &dirname,
                is_project_root: extra.is_project_root,
                allow_empty: extra.allow_empty_globs,
            },
        )?;
        let values: Vec<Value<'v>> = result.into_iter().map(|s| eval.heap().alloc(s)).collect();
        Ok(eval.heap().alloc(values))
    }

    fn subdir_glob<'v>(
        include: Value<'v>,
        #[starlark(default = NoneType)] exclude: Value<'v>,
        #[starlark(default = NoneType)] prefix: Value<'v>,
        eval: &mut Evaluator<'v, '_>,
    ) -> anyhow::Result<Value<'v>> {
        let extra = current_extra(eval)?;
        let list = ListRef::from_value(include)
            .ok_or_else(|| anyhow::anyhow!("subdir_glob takes a list of (dir, pattern) pairs"))?;
        let mut specs = Vec::new();
        for entry in list.iter() {
            let pair = ListRef::from_value(entry)
                .ok_or_else(|| anyhow::anyhow!("subdir_glob entries must be (dir, pattern) pairs"))?;
            let items: Vec<Value> = pair.iter().collect();
            anyhow::ensure!(items.len() == 2, "subdir_glob entries must have exactly 2 elements");
            let dir = items[0]
                .unpack_str()
                .ok_or_else(|| anyhow::anyhow!("subdir_glob dir must be a string"))?;
            let pattern = items[1]
                .unpack_str()
                .ok_or_else(|| anyhow::anyhow!("subdir_glob pattern must be a string"))?;
            specs.push((dir.to_owned(), pattern.to_owned()));
        }
        let excludes = if exclude.is_none() {
            Vec::new()
        } else {
            unpack_string_list(exclude, "subdir_glob excludes")?
        };
        let prefix_str = prefix.unpack_str().map(|s| s.to_owned());
        let result = evaluate_subdir_glob(
            extra.file_ops,
            extra.watcher,
            &extra.project_root,
            &specs,
            &excludes,
            prefix_str.as_deref(),
            extra.is_project_root,
            extra.allow_empty_globs,
        )?;
        let mut dict = starlark::values::dict::Dict::default();
        for (k, v) in result {
            dict.insert_hashed(
                eval.heap().alloc(k.as_str()).get_hashed().unwrap(),
                eval.heap().alloc(v.as_str()),
            );
        }
        Ok(eval.heap().alloc(dict))
    }
}

/// Registers package/cell-identity built-ins, fatal outside build-file
/// context (§4.F).
#[starlark_module]
pub fn register_identity_natives(builder: &mut GlobalsBuilder) {
    fn package_name(eval: &mut Evaluator) -> anyhow::Result<String> {
        current_extra(eval)?.require_build_file("package_name")
    }

    fn get_base_path(eval: &mut Evaluator) -> anyhow::Result<String> {
        current_extra(eval)?.require_build_file("get_base_path")
    }

    fn get_cell_name(eval: &mut Evaluator) -> anyhow::Result<String> {
        let extra = current_extra(eval)?;
        extra.require_build_file("get_cell_name")?;
        Ok(extra.active.cell_name())
    }

    fn repository_name(eval: &mut Evaluator) -> anyhow::Result<String> {
        let extra = current_extra(eval)?;
        extra.require_build_file("repository_name")?;
        Ok(format!("@{}", extra.active.cell_name()))
    }

    fn rule_exists(name: &str, eval: &mut Evaluator) -> anyhow::Result<bool> {
        let extra = current_extra(eval)?;
        extra.require_build_file("rule_exists")?;
        Ok(extra.active.rule_exists(name))
    }

    fn oncall(name: &str, eval: &mut Evaluator) -> anyhow::Result<NoneType> {
        let extra = current_extra(eval)?;
        extra.require_build_file("oncall")?;
        extra.active.with_accumulators_mut(|a| {
            a.implicit_package_symbols
                .insert("__oncall__".to_owned(), JsonValue::String(name.to_owned()));
        });
        Ok(NoneType)
    }
}

/// Plumbing for the sandboxed `EnvAccess` facade backing `read_env()`: routes
/// every lookup through `Accumulators::record_env` so `__env` reflects
/// exactly the names a build file actually consulted.
pub fn env_read(extra: &ContextExtra, name: &str) -> Option<String> {
    let record = |n: &str, v: Option<&str>| {
        extra
            .active
            .with_accumulators_mut(|a| a.record_env(n, v.map(|s| s.to_owned())));
    };
    EnvAccess::new(&record).get(name)
}
