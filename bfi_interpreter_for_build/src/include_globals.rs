use starlark::environment::GlobalsBuilder;
use starlark::eval::Evaluator;
use starlark::starlark_module;
use starlark::values::none::NoneType;
use starlark::values::{Heap, Value};
use starlark_map::small_map::SmallMap;

use bfi_interpreter::diagnostic::Diagnostic;

use crate::engine::{ExportedSymbol, ExportedSymbols, IncludeHandle};
use crate::extra::ContextExtra;
use crate::globals::{current_extra, json_to_value};
use crate::udr_globals::RuleFactory;

const HIDDEN: [&str; 2] = ["include_defs", "load"];

fn symbol_value<'v>(heap: &'v Heap, symbol: &ExportedSymbol) -> Value<'v> {
    match symbol {
        ExportedSymbol::Json(v) => json_to_value(heap, v),
        ExportedSymbol::Rule(rule) => heap.alloc(RuleFactory { inner: rule.clone() }),
    }
}

fn merge_handle(extra: &ContextExtra, handle: &IncludeHandle) {
    extra.active.with_accumulators_mut(|a| {
        a.merge(&handle.accumulators);
        a.record_include(handle.absolute_path.clone());
    });
}

fn lookup<'a>(exports: &'a ExportedSymbols, name: &str, import_str: &str) -> anyhow::Result<&'a ExportedSymbol> {
    exports
        .0
        .get(name)
        .ok_or_else(|| anyhow::anyhow!("load(): `{name}` is not defined in `{import_str}`"))
}

/// `include_defs`/`load` (§4.F, §4.E): the only two built-ins that reach
/// outside their own file, resolving labels through `ContextExtra::includes`
/// and binding the result into the *calling* module's globals.
///
/// Grounded on the module-internals pattern of merging a callee's exports
/// into the caller's symbol table (§9: "Symbol table merging on
/// `include_defs`"); here the merge source is the explicit `ExportedSymbols`
/// map returned by evaluation, not reflection over the callee's live globals.
#[starlark_module]
pub fn register_include_natives(builder: &mut GlobalsBuilder) {
    fn include_defs<'v>(
        import_str: &str,
        #[starlark(require = named, default = NoneType)] namespace: Value<'v>,
        eval: &mut Evaluator<'v, '_>,
    ) -> anyhow::Result<NoneType> {
        let extra = current_extra(eval)?;
        let handle = extra.includes.resolve_include(import_str)?;
        merge_handle(extra, &handle);

        let heap = eval.heap();
        let module = eval.module_env();
        match namespace.unpack_str() {
            None => {
                for (name, symbol) in &handle.exports.0 {
                    if HIDDEN.contains(&name.as_str()) {
                        continue;
                    }
                    module.set(name, symbol_value(heap, symbol));
                }
            }
            Some(ns_name) => {
                let mut dict = starlark::values::dict::Dict::default();
                for (name, symbol) in &handle.exports.0 {
                    dict.insert_hashed(heap.alloc(name.as_str()).get_hashed().unwrap(), symbol_value(heap, symbol));
                }
                module.set(ns_name, heap.alloc(dict));
            }
        }
        Ok(NoneType)
    }

    fn load<'v>(
        import_str: &str,
        #[starlark(args)] symbols: Vec<Value<'v>>,
        #[starlark(kwargs)] aliased_symbols: SmallMap<String, Value<'v>>,
        eval: &mut Evaluator<'v, '_>,
    ) -> anyhow::Result<NoneType> {
        anyhow::ensure!(
            !symbols.is_empty() || !aliased_symbols.is_empty(),
            "load() requires at least one symbol"
        );
        let extra = current_extra(eval)?;
        let current_cell = extra.active.cell_name();
        let current_dir = extra.active.dirname();
        let handle = extra.includes.resolve_load(import_str, &current_cell, &current_dir)?;
        merge_handle(extra, &handle);
        if let Some(message) = &handle.deprecated_cell_warning {
            extra
                .active
                .with_accumulators_mut(|a| a.push_diagnostic(Diagnostic::warning("load function", message.clone())));
        }

        let heap = eval.heap();
        let module = eval.module_env();
        for value in &symbols {
            let name = value
                .unpack_str()
                .ok_or_else(|| anyhow::anyhow!("load() symbols must be strings"))?;
            let symbol = lookup(&handle.exports, name, import_str)?;
            module.set(name, symbol_value(heap, symbol));
        }
        for (alias, exported_name) in &aliased_symbols {
            let exported_name = exported_name
                .unpack_str()
                .ok_or_else(|| anyhow::anyhow!("load() aliases must name the exported symbol as a string"))?;
            let symbol = lookup(&handle.exports, exported_name, import_str)?;
            module.set(alias, symbol_value(heap, symbol));
        }
        Ok(NoneType)
    }
}
