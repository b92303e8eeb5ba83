use std::cell::RefCell;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde_json::Value as JsonValue;
use starlark::environment::{Globals, GlobalsBuilder, Module};
use starlark::eval::Evaluator;
use starlark::syntax::{AstModule, Dialect};
use starlark::values::ValueLike;

use bfi_common::config::ConfigView;
use bfi_common::file_ops::FileOps;
use bfi_common::sandbox::TrackedFileOps;
use bfi_common::watcher::WatcherBackend;
use bfi_core::cells::CellResolver;
use bfi_core::label::{BuildInclude, IncludeLabel};
use bfi_core::package::PackageLabel;
use bfi_interpreter::context::{Accumulators, BuildFileContext, IncludeContext};
use bfi_interpreter::diagnostic::Diagnostic;
use bfi_interpreter::protocol::{PackageImplicitLoad, Query};
use bfi_interpreter::rule::RuleRecord;

use crate::extra::{ActiveContext, ContextExtra};
use crate::globals::{register_common_natives, register_glob_natives, register_identity_natives, value_to_json};
use crate::include_globals::register_include_natives;
use crate::native_globals::register_native_rules;
use crate::udr_globals::{register_attr_natives, register_rule_natives, register_select_natives, RuleFactory};

/// Immutable configuration built once from the worker's process arguments
/// (§6). Grounded on `WorkerArgs::into_engine_config` (see `bfi_worker::args`).
pub struct EngineConfig {
    pub project_root: PathBuf,
    pub cells: CellResolver,
    pub build_file_name: String,
    pub allow_empty_globs: bool,
    pub implicit_includes: Vec<String>,
    pub config: Box<dyn ConfigView>,
    pub ignore_paths: Vec<String>,
    pub disable_implicit_native_rules: bool,
    pub warn_about_deprecated_syntax: bool,
    pub enable_user_defined_rules: bool,
}

/// A symbol exported from a successfully evaluated include (§4.E). Starlark
/// values are tied to the heap/module that produced them, so plain JSON
/// constants and UDR factories (the only things this worker's build files
/// actually share across includes) are captured explicitly rather than
/// referencing the child module's frozen heap directly.
#[derive(Debug, Clone)]
pub enum ExportedSymbol {
    Json(JsonValue),
    Rule(Arc<bfi_interpreter::udr::UserDefinedRule>),
}

#[derive(Debug, Clone, Default)]
pub struct ExportedSymbols(pub HashMap<String, ExportedSymbol>);

struct CachedInclude {
    context: IncludeContext,
    exports: ExportedSymbols,
}

/// What an `include_defs`/`load` built-in needs from a resolved include: the
/// path to merge into `includes`, the accumulators to merge, and the symbols
/// available for binding into the caller's globals (§4.F).
#[derive(Debug, Clone)]
pub struct IncludeHandle {
    pub absolute_path: PathBuf,
    pub accumulators: Accumulators,
    pub exports: ExportedSymbols,
    /// Set by `resolve_load` when `warn_about_deprecated_syntax` is on and
    /// the label named its cell without the leading `@` (§4.F behavior
    /// switch; `original_source/python-dsl/buck_parser/buck.py`'s
    /// `_get_load_path`).
    pub deprecated_cell_warning: Option<String>,
}

/// Lets `include_defs`/`load` built-ins (registered as plain functions with
/// no access to `EvalEngine`) reach the engine's cache through `ContextExtra`.
pub trait IncludeResolver {
    fn resolve_include(&self, label: &str) -> anyhow::Result<IncludeHandle>;
    fn resolve_load(&self, label: &str, current_cell: &str, current_dir: &std::path::Path) -> anyhow::Result<IncludeHandle>;
    /// Resolves an include label to its absolute path without evaluating it
    /// (`add_build_file_dep`, §4.F — the target need not even be valid
    /// Starlark).
    fn resolve_include_path(&self, label: &str) -> anyhow::Result<PathBuf>;
}

impl<'e> IncludeResolver for EvalEngine<'e> {
    fn resolve_include_path(&self, label: &str) -> anyhow::Result<PathBuf> {
        Ok(IncludeLabel::resolve(label, &self.config.cells)?.absolute_path)
    }

    fn resolve_include(&self, label: &str) -> anyhow::Result<IncludeHandle> {
        let include = IncludeLabel::resolve(label, &self.config.cells)?;
        let cached = self.process_include(&include)?;
        Ok(IncludeHandle {
            absolute_path: include.absolute_path,
            accumulators: cached.context.accumulators.clone(),
            exports: cached.exports.clone(),
            deprecated_cell_warning: None,
        })
    }

    fn resolve_load(&self, label: &str, current_cell: &str, current_dir: &std::path::Path) -> anyhow::Result<IncludeHandle> {
        let include =
            bfi_core::label::LoadLabel::resolve(label, &self.config.cells, current_cell, current_dir)?;
        let cached = self.process_include(&include)?;
        let deprecated_cell_warning = if self.config.warn_about_deprecated_syntax
            && bfi_core::label::load_label_uses_deprecated_cell(label)
        {
            Some(format!(
                "load label \"{label}\" uses a deprecated cell format; \"{}\" should instead be \"@{}\"",
                include.cell_name, include.cell_name
            ))
        } else {
            None
        };
        Ok(IncludeHandle {
            absolute_path: include.absolute_path,
            accumulators: cached.context.accumulators.clone(),
            exports: cached.exports.clone(),
            deprecated_cell_warning,
        })
    }
}

/// The evaluation engine (§4.E): compiles and executes build/extension files
/// inside a per-file symbol table seeded with built-ins, manages the
/// include cache, and exposes `include_defs`/`load` semantics.
///
/// Grounded on `module_internals.rs` for the context-threading shape; the
/// thread-local `build_env` pointer the teacher's Python original rebinds
/// onto every built-in is replaced here with the explicit `ContextExtra`
/// passed through `Evaluator::extra` (Design Notes §9).
pub struct EvalEngine<'e> {
    pub config: EngineConfig,
    pub file_ops: &'e dyn FileOps,
    pub watcher: Option<&'e dyn WatcherBackend>,
    cache: RefCell<HashMap<PathBuf, Arc<CachedInclude>>>,
    globals_build: Globals,
    globals_extension: Globals,
    /// Paths resolved as an include/load target anywhere in this query's
    /// evaluation so far, backing `TrackedFileOps`'s untracked-read warning
    /// (§4.C). Engine-scoped (not per-frame) so a file resolved while
    /// evaluating one include is already "known" when a sibling include
    /// reads it.
    known_includes: Mutex<Vec<PathBuf>>,
}

impl<'e> EvalEngine<'e> {
    pub fn new(config: EngineConfig, file_ops: &'e dyn FileOps, watcher: Option<&'e dyn WatcherBackend>) -> Self {
        let mut build_builder = GlobalsBuilder::extended()
            .with(register_common_natives)
            .with(register_glob_natives)
            .with(register_identity_natives)
            .with(register_select_natives)
            .with(register_include_natives);
        if config.enable_user_defined_rules {
            build_builder = build_builder.with(register_rule_natives).with(register_attr_natives);
        }
        if !config.disable_implicit_native_rules {
            build_builder = build_builder.with(register_native_rules);
        }
        let globals_build = build_builder.build();
        // The native-rule namespace is always visible in extension scope
        // (§4.F) so macros can reference the names lexically even though
        // invoking them only succeeds during build-file evaluation.
        let mut extension_builder = GlobalsBuilder::extended()
            .with(register_common_natives)
            .with(register_glob_natives)
            .with(register_identity_natives)
            .with(register_select_natives)
            .with(register_include_natives);
        if config.enable_user_defined_rules {
            extension_builder = extension_builder.with(register_rule_natives).with(register_attr_natives);
        }
        extension_builder = extension_builder.with(register_native_rules);
        let globals_extension = extension_builder.build();
        Self {
            config,
            file_ops,
            watcher,
            cache: RefCell::new(HashMap::new()),
            globals_build,
            globals_extension,
            known_includes: Mutex::new(Vec::new()),
        }
    }

    /// Entry point for one query (§4.H).
    pub fn process_build_file(&self, query: &Query) -> anyhow::Result<(Vec<RuleRecord>, Accumulators)> {
        let build_file = PathBuf::from(&query.build_file);
        let cell_name = self.config.cells.own_cell().as_str().to_owned();
        let package = PackageLabel::from_build_file(&cell_name, &self.config.project_root, &build_file);
        let mut context = BuildFileContext::new(
            self.config.project_root.clone(),
            package.base_path().to_owned(),
            build_file.clone(),
            cell_name,
        );
        let is_project_root = package.base_path().is_empty();

        if let Some(implicit_load) = &query.package_implicit_load {
            self.apply_package_implicit_load(&mut context, implicit_load)?;
        }

        for label in self.config.implicit_includes.clone() {
            self.process_implicit_include(&mut context, &label)?;
        }

        let content = {
            let warn = |message: String| context.accumulators.push_diagnostic(Diagnostic::warning("parse", message));
            let tracked = TrackedFileOps::new(self.file_ops, &self.known_includes, &warn);
            // Reading the query's own target file is engine bookkeeping
            // (§4.C), not a read triggered by evaluating Starlark text.
            tracked.read_file(&build_file, false)?
        };
        self.eval_build_file_text(&mut context, &content, is_project_root)?;

        let rules = context.rules.into_iter().map(|(_, r)| r).collect();
        Ok((rules, context.accumulators))
    }

    fn apply_package_implicit_load(
        &self,
        context: &mut BuildFileContext,
        implicit_load: &PackageImplicitLoad,
    ) -> anyhow::Result<()> {
        let include = IncludeLabel::resolve(&implicit_load.load_path, &self.config.cells)?;
        let cached = self.process_include(&include)?;
        context.accumulators.merge(&cached.context.accumulators);
        context.accumulators.record_include(include.absolute_path.clone());
        for (alias, exported_name) in &implicit_load.load_symbols {
            if let Some(ExportedSymbol::Json(v)) = cached.exports.0.get(exported_name) {
                context
                    .accumulators
                    .implicit_package_symbols
                    .insert(alias.clone(), v.clone());
            }
        }
        Ok(())
    }

    fn process_implicit_include(&self, context: &mut BuildFileContext, label: &str) -> anyhow::Result<()> {
        let include = IncludeLabel::resolve(label, &self.config.cells)?;
        let cached = self.process_include(&include)?;
        context.accumulators.merge(&cached.context.accumulators);
        context.accumulators.record_include(include.absolute_path.clone());
        Ok(())
    }

    /// `process_include` (§4.E): cached by absolute path, so identical
    /// includes reached by different label spellings share one evaluation.
    fn process_include(&self, include: &BuildInclude) -> anyhow::Result<Arc<CachedInclude>> {
        if let Some(cached) = self.cache.borrow().get(&include.absolute_path) {
            return Ok(cached.clone());
        }

        let mut context = IncludeContext::new(
            include.cell_name.clone(),
            include.absolute_path.clone(),
            include.label.clone(),
        );

        self.known_includes.lock().unwrap().push(include.absolute_path.clone());
        let content = {
            let warn = |message: String| context.accumulators.push_diagnostic(Diagnostic::warning("parse", message));
            let tracked = TrackedFileOps::new(self.file_ops, &self.known_includes, &warn);
            // Reached via `include_defs`/`load`/implicit includes, which
            // is what §4.C's "evaluating build/extension file text" means.
            tracked.read_file(&include.absolute_path, true)?
        };
        let exports = self.eval_include_text(&mut context, &content)?;

        let cached = Arc::new(CachedInclude { context, exports });
        Ok(self
            .cache
            .borrow_mut()
            .entry(include.absolute_path.clone())
            .or_insert(cached)
            .clone())
    }

    fn eval_build_file_text(
        &self,
        context: &mut BuildFileContext,
        content: &str,
        is_project_root: bool,
    ) -> anyhow::Result<()> {
        let absolute_path = context.absolute_path.clone();
        let project_root = self.config.project_root.clone();
        let extra = ContextExtra {
            active: ActiveContext::Build(RefCell::new(context)),
            project_root,
            config: self.config.config.as_ref(),
            file_ops: self.file_ops,
            watcher: self.watcher,
            allow_empty_globs: self.config.allow_empty_globs,
            is_project_root,
            known_includes: &self.known_includes,
            disable_implicit_native_rules: self.config.disable_implicit_native_rules,
            includes: self,
        };

        let ast = AstModule::parse(&absolute_path.to_string_lossy(), content.to_owned(), &Dialect::Extended)?;
        let module = Module::new();
        let mut eval = Evaluator::new(&module);
        eval.extra = Some(&extra);
        eval.eval_module(ast, &self.globals_build)?;
        Ok(())
    }

    fn eval_include_text(&self, context: &mut IncludeContext, content: &str) -> anyhow::Result<ExportedSymbols> {
        let absolute_path = context.absolute_path.clone();
        let project_root = self.config.project_root.clone();
        let extra = ContextExtra {
            active: ActiveContext::Include(RefCell::new(context)),
            project_root,
            config: self.config.config.as_ref(),
            file_ops: self.file_ops,
            watcher: self.watcher,
            allow_empty_globs: self.config.allow_empty_globs,
            is_project_root: false,
            known_includes: &self.known_includes,
            disable_implicit_native_rules: self.config.disable_implicit_native_rules,
            includes: self,
        };

        let ast = AstModule::parse(&absolute_path.to_string_lossy(), content.to_owned(), &Dialect::Extended)?;
        let module = Module::new();
        {
            let mut eval = Evaluator::new(&module);
            eval.extra = Some(&extra);
            eval.eval_module(ast, &self.globals_extension)?;
        }
        let frozen = module.freeze()?;

        let mut exports = ExportedSymbols::default();
        for name in frozen.names() {
            let name = name.as_str();
            if name.starts_with('_') {
                continue;
            }
            if let Some(owned) = frozen.get(name) {
                let value = owned.value();
                if let Some(rule_factory) = value.downcast_ref::<RuleFactory>() {
                    rule_factory.inner.set_name(name);
                    exports
                        .0
                        .insert(name.to_owned(), ExportedSymbol::Rule(rule_factory.inner.clone()));
                } else if let Ok(json) = value_to_json(value) {
                    exports.0.insert(name.to_owned(), ExportedSymbol::Json(json));
                }
            }
        }
        Ok(exports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bfi_common::config::JsonConfigView;
    use bfi_common::file_ops::testing::TestFileOps;

    fn engine(file_ops: &TestFileOps) -> EvalEngine<'_> {
        let cells = CellResolver::from_cell_roots("root", &PathBuf::from("/repo"), &[]).unwrap();
        let config = EngineConfig {
            project_root: PathBuf::from("/repo"),
            cells,
            build_file_name: "BUILD".to_owned(),
            allow_empty_globs: true,
            implicit_includes: Vec::new(),
            config: Box::new(JsonConfigView::empty()),
            ignore_paths: Vec::new(),
            disable_implicit_native_rules: false,
            warn_about_deprecated_syntax: false,
            enable_user_defined_rules: true,
        };
        EvalEngine::new(config, file_ops, None)
    }

    fn query(build_file: &str) -> Query {
        Query {
            build_file: build_file.to_owned(),
            watch_root: "/repo".to_owned(),
            project_prefix: String::new(),
            package_implicit_load: None,
            command: None,
        }
    }

    /// S7: a `load`ed UDR applies its attribute default and is named after
    /// its extension label plus the binding name it was assigned to.
    #[test]
    fn load_and_invoke_user_defined_rule() {
        let file_ops = TestFileOps::new([
            (
                PathBuf::from("/repo/r.bzl"),
                r#"MyRule = rule(attrs = {"x": attr.string(default = "d")})"#.to_owned(),
            ),
            (
                PathBuf::from("/repo/BUILD"),
                "load(\"//:r.bzl\", \"MyRule\")\nMyRule(name = \"n\")\n".to_owned(),
            ),
        ]);
        let engine = engine(&file_ops);
        let (rules, _) = engine.process_build_file(&query("/repo/BUILD")).unwrap();
        assert_eq!(rules.len(), 1);
        let record = rules[0].as_map();
        assert_eq!(record["buck.type"], "//:r.bzl:MyRule");
        assert_eq!(record["name"], "n");
        assert_eq!(record["x"], "d");
    }

    /// `include_defs` without a namespace copies non-hidden globals directly
    /// into the caller, so a UDR reached this way is usable immediately.
    #[test]
    fn include_defs_without_namespace_binds_caller_globals() {
        let file_ops = TestFileOps::new([
            (
                PathBuf::from("/repo/r.bzl"),
                r#"MyRule = rule(attrs = {"x": attr.string(default = "d")})"#.to_owned(),
            ),
            (
                PathBuf::from("/repo/BUILD"),
                "include_defs(\"//r.bzl\")\nMyRule(name = \"n\")\n".to_owned(),
            ),
        ]);
        let engine = engine(&file_ops);
        let (rules, accumulators) = engine.process_build_file(&query("/repo/BUILD")).unwrap();
        assert_eq!(rules.len(), 1);
        assert!(accumulators.includes.contains(&PathBuf::from("/repo/r.bzl")));
    }

    /// `include_defs(..., namespace=...)` exposes exports only through the
    /// bound dict, never as bare caller globals.
    #[test]
    fn include_defs_with_namespace_exposes_dict() {
        let file_ops = TestFileOps::new([
            (PathBuf::from("/repo/defs.bzl"), r#"greeting = "hi""#.to_owned()),
            (
                PathBuf::from("/repo/BUILD"),
                "include_defs(\"//defs.bzl\", namespace = \"ns\")\nfail(ns[\"greeting\"])\n".to_owned(),
            ),
        ]);
        let engine = engine(&file_ops);
        let err = engine.process_build_file(&query("/repo/BUILD")).unwrap_err();
        assert!(err.to_string().contains("hi"));
    }

    /// `rule()` is only callable while evaluating an extension (§4.G).
    #[test]
    fn rule_call_outside_extension_is_fatal() {
        let file_ops = TestFileOps::new([(
            PathBuf::from("/repo/BUILD"),
            r#"rule(attrs = {})"#.to_owned(),
        )]);
        let engine = engine(&file_ops);
        let err = engine.process_build_file(&query("/repo/BUILD")).unwrap_err();
        assert!(err.to_string().contains("extension"));
    }

    /// Duplicate rule names within one build file are fatal (§3 invariant).
    #[test]
    fn duplicate_rule_name_fails_evaluation() {
        let file_ops = TestFileOps::new([
            (
                PathBuf::from("/repo/r.bzl"),
                r#"MyRule = rule(attrs = {})"#.to_owned(),
            ),
            (
                PathBuf::from("/repo/BUILD"),
                "load(\"//:r.bzl\", \"MyRule\")\nMyRule(name = \"a\")\nMyRule(name = \"a\")\n".to_owned(),
            ),
        ]);
        let engine = engine(&file_ops);
        let err = engine.process_build_file(&query("/repo/BUILD")).unwrap_err();
        assert!(err.to_string().contains("Duplicate rule definition"));
    }

    /// S1: a native rule call records `buck.type`/`buck.base_path`/`name`
    /// plus whatever kwargs the build file passed, unvalidated.
    #[test]
    fn native_rule_call_records_expected_fields() {
        let file_ops = TestFileOps::new([(
            PathBuf::from("/repo/pkg/BUILD"),
            r#"java_library(name = "a", srcs = [])"#.to_owned(),
        )]);
        let engine = engine(&file_ops);
        let (rules, _) = engine.process_build_file(&query("/repo/pkg/BUILD")).unwrap();
        assert_eq!(rules.len(), 1);
        let record = rules[0].as_map();
        assert_eq!(record["buck.type"], "java_library");
        assert_eq!(record["buck.base_path"], "pkg");
        assert_eq!(record["name"], "a");
        assert_eq!(record["srcs"], serde_json::json!([]));
    }

    /// S3: `genrule` follows the same native-rule path as `java_library`.
    #[test]
    fn genrule_native_call_records_expected_fields() {
        let file_ops = TestFileOps::new([(
            PathBuf::from("/repo/BUILD"),
            r#"genrule(name = "greeting", out = "o", cmd = "")"#.to_owned(),
        )]);
        let engine = engine(&file_ops);
        let (rules, _) = engine.process_build_file(&query("/repo/BUILD")).unwrap();
        assert_eq!(rules.len(), 1);
        let record = rules[0].as_map();
        assert_eq!(record["buck.type"], "genrule");
        assert_eq!(record["name"], "greeting");
        assert_eq!(record["out"], "o");
    }

    /// `disable_implicit_native_rules` hides the native-rule namespace from
    /// build-file scope entirely (§4.F), not just its runtime validation.
    #[test]
    fn disabled_native_rules_are_undefined_in_build_files() {
        let file_ops = TestFileOps::new([(
            PathBuf::from("/repo/BUILD"),
            r#"java_library(name = "a")"#.to_owned(),
        )]);
        let cells = CellResolver::from_cell_roots("root", &PathBuf::from("/repo"), &[]).unwrap();
        let config = EngineConfig {
            project_root: PathBuf::from("/repo"),
            cells,
            build_file_name: "BUILD".to_owned(),
            allow_empty_globs: true,
            implicit_includes: Vec::new(),
            config: Box::new(JsonConfigView::empty()),
            ignore_paths: Vec::new(),
            disable_implicit_native_rules: true,
            warn_about_deprecated_syntax: false,
            enable_user_defined_rules: true,
        };
        let engine = EvalEngine::new(config, &file_ops, None);
        let err = engine.process_build_file(&query("/repo/BUILD")).unwrap_err();
        assert!(err.to_string().contains("java_library"));
    }

    /// `enable_user_defined_rules = false` hides `rule()`/`attr.*` from both
    /// build-file and extension scope (§4.G behavior switch).
    #[test]
    fn disabled_udr_rule_is_undefined_when_enable_user_defined_rules_is_false() {
        let file_ops = TestFileOps::new([
            (
                PathBuf::from("/repo/r.bzl"),
                r#"MyRule = rule(attrs = {})"#.to_owned(),
            ),
            (
                PathBuf::from("/repo/BUILD"),
                "load(\"//:r.bzl\", \"MyRule\")\n".to_owned(),
            ),
        ]);
        let cells = CellResolver::from_cell_roots("root", &PathBuf::from("/repo"), &[]).unwrap();
        let config = EngineConfig {
            project_root: PathBuf::from("/repo"),
            cells,
            build_file_name: "BUILD".to_owned(),
            allow_empty_globs: true,
            implicit_includes: Vec::new(),
            config: Box::new(JsonConfigView::empty()),
            ignore_paths: Vec::new(),
            disable_implicit_native_rules: false,
            warn_about_deprecated_syntax: false,
            enable_user_defined_rules: false,
        };
        let engine = EvalEngine::new(config, &file_ops, None);
        let err = engine.process_build_file(&query("/repo/BUILD")).unwrap_err();
        assert!(err.to_string().contains("rule"));
    }

    /// `warn_about_deprecated_syntax` surfaces a warning diagnostic when a
    /// `load()` label names its cell without the leading `@` (§4.F).
    #[test]
    fn load_without_at_prefix_warns_when_enabled() {
        let file_ops = TestFileOps::new([
            (PathBuf::from("/other/r.bzl"), r#"X = 1"#.to_owned()),
            (
                PathBuf::from("/repo/BUILD"),
                "load(\"other//:r.bzl\", \"X\")\n".to_owned(),
            ),
        ]);
        let cells =
            CellResolver::from_cell_roots("root", &PathBuf::from("/repo"), &["other=/other".to_owned()]).unwrap();
        let config = EngineConfig {
            project_root: PathBuf::from("/repo"),
            cells,
            build_file_name: "BUILD".to_owned(),
            allow_empty_globs: true,
            implicit_includes: Vec::new(),
            config: Box::new(JsonConfigView::empty()),
            ignore_paths: Vec::new(),
            disable_implicit_native_rules: false,
            warn_about_deprecated_syntax: true,
            enable_user_defined_rules: true,
        };
        let engine = EvalEngine::new(config, &file_ops, None);
        let (_, accumulators) = engine.process_build_file(&query("/repo/BUILD")).unwrap();
        assert!(accumulators
            .diagnostics
            .iter()
            .any(|d| d.message.contains("deprecated cell format")));
    }
}
