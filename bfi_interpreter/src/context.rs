use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

use crate::diagnostic::Diagnostic;
use crate::rule::RuleRecord;
use crate::udr::UserDefinedRule;

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("Duplicate rule definition '{0}'")]
    DuplicateRuleName(String),
    #[error("{0}() is not available in an extension file")]
    NotInBuildFileContext(&'static str),
}

/// Shared accumulators every context variant carries (§3).
#[derive(Debug, Default, Clone)]
pub struct Accumulators {
    pub includes: HashSet<PathBuf>,
    pub used_configs: HashMap<String, HashMap<String, Value>>,
    pub used_env_vars: HashMap<String, Option<String>>,
    pub diagnostics: Vec<Diagnostic>,
    pub user_rules: Vec<Arc<UserDefinedRule>>,
    pub implicit_package_symbols: HashMap<String, Value>,
}

impl Accumulators {
    /// `dst.merge(src)`: unions `includes`, extends `diagnostics`,
    /// shallow-merges `used_configs`/`used_env_vars` (last wins), unions
    /// `user_rules`.
    pub fn merge(&mut self, other: &Accumulators) {
        self.includes.extend(other.includes.iter().cloned());
        self.diagnostics.extend(other.diagnostics.iter().cloned());
        for (section, fields) in &other.used_configs {
            self.used_configs
                .entry(section.clone())
                .or_default()
                .extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        for (name, value) in &other.used_env_vars {
            self.used_env_vars.insert(name.clone(), value.clone());
        }
        for rule in &other.user_rules {
            if !self.user_rules.iter().any(|r| Arc::ptr_eq(r, rule)) {
                self.user_rules.push(rule.clone());
            }
        }
    }

    pub fn record_config(&mut self, section: &str, field: &str, value: Value) {
        self.used_configs
            .entry(section.to_owned())
            .or_default()
            .insert(field.to_owned(), value);
    }

    pub fn record_env(&mut self, name: &str, value: Option<String>) {
        self.used_env_vars.insert(name.to_owned(), value);
    }

    pub fn record_include(&mut self, path: PathBuf) {
        self.includes.insert(path);
    }

    pub fn push_diagnostic(&mut self, diagnostic: Diagnostic) {
        self.diagnostics.push(diagnostic);
    }
}

/// Either concrete context variant, used where code only needs the shared
/// accumulators (§3: Context, abstract with two variants).
pub trait Context {
    fn accumulators(&self) -> &Accumulators;
    fn accumulators_mut(&mut self) -> &mut Accumulators;
    fn cell_name(&self) -> &str;
}

/// Context for evaluating one build file.
#[derive(Debug)]
pub struct BuildFileContext {
    pub project_root: PathBuf,
    pub base_path: String,
    pub absolute_path: PathBuf,
    pub dirname: PathBuf,
    pub cell_name: String,
    pub rules: Vec<(String, RuleRecord)>,
    rule_names: HashSet<String>,
    pub accumulators: Accumulators,
}

impl BuildFileContext {
    pub fn new(
        project_root: PathBuf,
        base_path: String,
        absolute_path: PathBuf,
        cell_name: String,
    ) -> Self {
        let dirname = absolute_path
            .parent()
            .map(|p| p.to_owned())
            .unwrap_or_else(|| project_root.clone());
        Self {
            project_root,
            base_path,
            absolute_path,
            dirname,
            cell_name,
            rules: Vec::new(),
            rule_names: HashSet::new(),
            accumulators: Accumulators::default(),
        }
    }

    /// Duplicate rule names are fatal at insertion time (§3 invariant).
    pub fn add_rule(&mut self, record: RuleRecord) -> Result<(), ContextError> {
        let name = record.name().to_owned();
        if !self.rule_names.insert(name.clone()) {
            return Err(ContextError::DuplicateRuleName(name));
        }
        self.rules.push((name, record));
        Ok(())
    }

    /// Whether a rule by this name has already been declared in this build
    /// file, backing the `rule_exists()` builtin.
    pub fn has_rule(&self, name: &str) -> bool {
        self.rule_names.contains(name)
    }

    pub fn merge_include(&mut self, include: &IncludeContext) {
        self.accumulators.merge(&include.accumulators);
    }
}

impl Context for BuildFileContext {
    fn accumulators(&self) -> &Accumulators {
        &self.accumulators
    }

    fn accumulators_mut(&mut self) -> &mut Accumulators {
        &mut self.accumulators
    }

    fn cell_name(&self) -> &str {
        &self.cell_name
    }
}

/// Context for evaluating one extension/include file.
#[derive(Debug, Clone)]
pub struct IncludeContext {
    pub cell_name: String,
    pub absolute_path: PathBuf,
    pub label: String,
    pub accumulators: Accumulators,
}

impl IncludeContext {
    pub fn new(cell_name: String, absolute_path: PathBuf, label: String) -> Self {
        Self {
            cell_name,
            absolute_path,
            label,
            accumulators: Accumulators::default(),
        }
    }
}

impl Context for IncludeContext {
    fn accumulators(&self) -> &Accumulators {
        &self.accumulators
    }

    fn accumulators_mut(&mut self) -> &mut Accumulators {
        &mut self.accumulators
    }

    fn cell_name(&self) -> &str {
        &self.cell_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> BuildFileContext {
        BuildFileContext::new(
            PathBuf::from("/repo"),
            "pkg".to_owned(),
            PathBuf::from("/repo/pkg/BUILD"),
            "root".to_owned(),
        )
    }

    #[test]
    fn duplicate_rule_name_is_fatal() {
        let mut c = ctx();
        c.add_rule(RuleRecord::new("t", "pkg", "a")).unwrap();
        let err = c.add_rule(RuleRecord::new("t", "pkg", "a")).unwrap_err();
        assert!(matches!(err, ContextError::DuplicateRuleName(n) if n == "a"));
    }

    #[test]
    fn merge_unions_includes_and_extends_diagnostics() {
        let mut c = ctx();
        let mut inc = IncludeContext::new(
            "root".to_owned(),
            PathBuf::from("/repo/defs.bzl"),
            "//:defs.bzl".to_owned(),
        );
        inc.accumulators.record_include(PathBuf::from("/repo/defs.bzl"));
        inc.accumulators
            .push_diagnostic(Diagnostic::warning("parse", "heads up"));
        c.merge_include(&inc);
        assert!(c.accumulators.includes.contains(&PathBuf::from("/repo/defs.bzl")));
        assert_eq!(c.accumulators.diagnostics.len(), 1);
    }

    #[test]
    fn merge_last_write_wins_for_configs() {
        let mut c = ctx();
        c.accumulators.record_config("a", "b", Value::from("old"));
        let mut inc = IncludeContext::new(
            "root".to_owned(),
            PathBuf::from("/repo/defs.bzl"),
            "//:defs.bzl".to_owned(),
        );
        inc.accumulators.record_config("a", "b", Value::from("new"));
        c.merge_include(&inc);
        assert_eq!(c.accumulators.used_configs["a"]["b"], Value::from("new"));
    }
}
