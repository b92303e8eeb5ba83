use std::cell::RefCell;
use std::path::PathBuf;
use std::sync::Mutex;

use starlark::values::ProvidesStaticType;

use bfi_common::config::ConfigView;
use bfi_common::file_ops::FileOps;
use bfi_common::watcher::WatcherBackend;
use bfi_interpreter::context::{Accumulators, BuildFileContext, Context, ContextError, IncludeContext};
use bfi_interpreter::rule::RuleRecord;

use crate::engine::IncludeResolver;

/// Which concrete context variant is active for this evaluation (§3, §4.E).
/// Holding a `RefCell<&mut ...>` rather than splitting `BuildFileContext`
/// into a bag of loose `&mut` fields keeps the duplicate-rule-name check
/// and the shared accumulators mutation under one borrow, since they live
/// on the same struct.
pub enum ActiveContext<'a> {
    Build(RefCell<&'a mut BuildFileContext>),
    Include(RefCell<&'a mut IncludeContext>),
}

impl<'a> ActiveContext<'a> {
    pub fn with_accumulators_mut<R>(&self, f: impl FnOnce(&mut Accumulators) -> R) -> R {
        match self {
            ActiveContext::Build(c) => f(c.borrow_mut().accumulators_mut()),
            ActiveContext::Include(c) => f(c.borrow_mut().accumulators_mut()),
        }
    }

    pub fn accumulators_snapshot(&self) -> Accumulators {
        match self {
            ActiveContext::Build(c) => c.borrow().accumulators().clone(),
            ActiveContext::Include(c) => c.borrow().accumulators().clone(),
        }
    }

    pub fn cell_name(&self) -> String {
        match self {
            ActiveContext::Build(c) => c.borrow().cell_name().to_owned(),
            ActiveContext::Include(c) => c.borrow().cell_name().to_owned(),
        }
    }

    pub fn base_path(&self) -> Option<String> {
        match self {
            ActiveContext::Build(c) => Some(c.borrow().base_path.clone()),
            ActiveContext::Include(_) => None,
        }
    }

    /// The label of the extension file currently evaluating, used as a
    /// `UserDefinedRule`'s `label` field when `rule()` is called (§4.G).
    pub fn current_label(&self) -> Option<String> {
        match self {
            ActiveContext::Build(_) => None,
            ActiveContext::Include(c) => Some(c.borrow().label.clone()),
        }
    }

    pub fn dirname(&self) -> PathBuf {
        match self {
            ActiveContext::Build(c) => c.borrow().dirname.clone(),
            ActiveContext::Include(c) => c
                .borrow()
                .absolute_path
                .parent()
                .map(|p| p.to_owned())
                .unwrap_or_default(),
        }
    }

    /// Backs `rule_exists()`; always `false` in an extension context (rules
    /// are only ever recorded on `BuildFileContext`).
    pub fn rule_exists(&self, name: &str) -> bool {
        match self {
            ActiveContext::Build(c) => c.borrow().has_rule(name),
            ActiveContext::Include(_) => false,
        }
    }

    /// Inserts a rule record (§4.G rule 7); fatal when called outside a
    /// build-file context.
    pub fn add_rule(&self, record: RuleRecord) -> anyhow::Result<()> {
        match self {
            ActiveContext::Build(c) => c.borrow_mut().add_rule(record).map_err(Into::into),
            ActiveContext::Include(_) => {
                Err(ContextError::NotInBuildFileContext("rule declaration").into())
            }
        }
    }
}

/// The value bound to `Evaluator::extra` for the duration of one `process()`
/// call (§4.E). Every built-in downcasts `eval.extra` to this type to reach
/// the active context and its collaborators.
///
/// Grounded on Design Notes §9: this is the explicit, parameter-threaded
/// replacement for the teacher's thread-local `build_env` pointer rebound
/// onto each built-in closure. `ModuleInternals::from_context(eval)` in the
/// teacher already reads `eval.extra` this way; here it is the only path,
/// not a convenience wrapper around a global.
#[derive(ProvidesStaticType)]
pub struct ContextExtra<'a> {
    pub active: ActiveContext<'a>,
    pub project_root: PathBuf,
    pub config: &'a dyn ConfigView,
    pub file_ops: &'a dyn FileOps,
    pub watcher: Option<&'a dyn WatcherBackend>,
    pub allow_empty_globs: bool,
    pub is_project_root: bool,
    pub known_includes: &'a Mutex<Vec<PathBuf>>,
    pub disable_implicit_native_rules: bool,
    pub includes: &'a dyn IncludeResolver,
}

impl<'a> ContextExtra<'a> {
    pub fn require_build_file(&self, builtin: &'static str) -> anyhow::Result<String> {
        self.active
            .base_path()
            .ok_or_else(|| anyhow::anyhow!("{builtin}() is not available in an extension file"))
    }
}
