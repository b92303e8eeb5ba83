use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use glob::{MatchOptions, Pattern};
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

use crate::file_ops::FileOps;
use crate::watcher::WatcherBackend;

#[derive(Debug, Error)]
pub enum GlobError {
    #[error("glob includes must be a sequence of strings, not a bare string")]
    IncludesNotSequence,
    #[error("invalid glob pattern `{0}`: {1}")]
    InvalidPattern(String, String),
    #[error("glob pattern `{0}` is a recursive pattern at the project root, which is not allowed")]
    RecursiveAtRoot(String),
    #[error("glob({includes:?}, exclude={excludes:?}) returned no results, which is disallowed by the current configuration")]
    EmptyResult {
        includes: Vec<String>,
        excludes: Vec<String>,
    },
    #[error("subdir_glob key `{0}` is produced by two different directories with conflicting values")]
    SubdirGlobConflict(String),
    #[error("watcher query failed: {0}")]
    WatcherFailure(String),
}

impl GlobError {
    /// Distinguishes a watcher-backend failure (§7 error kind 7, diagnostic
    /// source `watchman`) from every other glob failure (source `parse`).
    pub fn is_watcher_failure(&self) -> bool {
        matches!(self, GlobError::WatcherFailure(_))
    }
}

static RECURSIVE_PREFIX_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\*/)*\*\*/").unwrap());

/// Open question (resolved, SPEC_FULL.md §9): only rejects `^(\*/)*\*\*/`
/// prefixes; `**` appearing mid-pattern is permitted.
pub fn is_recursive_prefix(pattern: &str) -> bool {
    RECURSIVE_PREFIX_RE.is_match(pattern)
}

pub struct GlobParams<'a> {
    pub includes: &'a [String],
    pub excludes: &'a [String],
    pub include_dotfiles: bool,
    /// absolute path of the build file's directory
    pub search_base: &'a Path,
    pub is_project_root: bool,
    pub allow_empty: bool,
}

fn match_options(include_dotfiles: bool) -> MatchOptions {
    MatchOptions {
        case_sensitive: true,
        require_literal_separator: true,
        require_literal_leading_dot: !include_dotfiles,
    }
}

fn collect_all_relative_files(
    fs: &dyn FileOps,
    search_base: &Path,
) -> anyhow::Result<Vec<String>> {
    let mut out = Vec::new();
    let mut stack = vec![String::new()];
    while let Some(rel_dir) = stack.pop() {
        let abs_dir = if rel_dir.is_empty() {
            search_base.to_owned()
        } else {
            search_base.join(&rel_dir)
        };
        for entry in fs.read_dir(&abs_dir)? {
            let rel_path = if rel_dir.is_empty() {
                entry.file_name.clone()
            } else {
                format!("{rel_dir}/{}", entry.file_name)
            };
            if entry.file_type.is_dir() {
                stack.push(rel_path);
            } else {
                out.push(rel_path);
            }
        }
    }
    out.sort();
    Ok(out)
}

/// Evaluates `glob(includes, excludes, include_dotfiles)` (§4.B): consults
/// the watcher backend first, falls back to a deterministic filesystem walk,
/// and enforces the recursive-at-root and empty-result policies.
pub fn evaluate_glob(
    fs: &dyn FileOps,
    watcher: Option<&dyn WatcherBackend>,
    params: &GlobParams,
) -> Result<Vec<String>, GlobError> {
    for pattern in params.includes {
        if params.is_project_root && is_recursive_prefix(pattern) {
            return Err(GlobError::RecursiveAtRoot(pattern.clone()));
        }
    }

    if params.includes.is_empty() {
        return Ok(Vec::new());
    }

    if let Some(watcher) = watcher {
        if let Some(results) = watcher
            .glob(
                &params.search_base.to_string_lossy(),
                params.includes,
                params.excludes,
                Duration::from_secs(60),
            )
            .map_err(|e| GlobError::WatcherFailure(e.to_string()))?
        {
            let mut sorted: BTreeSet<String> = results.into_iter().collect();
            return finish(sorted.drain().collect(), params);
        }
    }

    let all_files = collect_all_relative_files(fs, params.search_base)
        .map_err(|e| GlobError::InvalidPattern("<walk>".to_owned(), e.to_string()))?;

    let opts = match_options(params.include_dotfiles);
    let include_patterns = compile_patterns(params.includes)?;
    let exclude_patterns = compile_patterns(params.excludes)?;

    let mut matched: BTreeSet<String> = BTreeSet::new();
    for file in &all_files {
        let included = include_patterns
            .iter()
            .any(|p| p.matches_with(file, opts));
        if !included {
            continue;
        }
        let excluded = exclude_patterns
            .iter()
            .any(|p| p.matches_with(file, opts));
        if excluded {
            continue;
        }
        matched.insert(file.clone());
    }

    finish(matched.into_iter().collect(), params)
}

fn compile_patterns(patterns: &[String]) -> Result<Vec<Pattern>, GlobError> {
    patterns
        .iter()
        .map(|p| Pattern::new(p).map_err(|e| GlobError::InvalidPattern(p.clone(), e.to_string())))
        .collect()
}

fn finish(results: Vec<String>, params: &GlobParams) -> Result<Vec<String>, GlobError> {
    if results.is_empty() && !params.allow_empty {
        return Err(GlobError::EmptyResult {
            includes: params.includes.to_vec(),
            excludes: params.excludes.to_vec(),
        });
    }
    Ok(results)
}

/// `subdir_glob(specs, excludes, prefix)` (§4.B).
pub fn evaluate_subdir_glob(
    fs: &dyn FileOps,
    watcher: Option<&dyn WatcherBackend>,
    project_root: &Path,
    specs: &[(String, String)],
    excludes: &[String],
    prefix: Option<&str>,
    is_project_root: bool,
    allow_empty: bool,
) -> Result<std::collections::BTreeMap<String, String>, GlobError> {
    let mut out = std::collections::BTreeMap::new();
    for (dir, pattern) in specs {
        let search_base = project_root.join(dir);
        let full_pattern = format!("{dir}/{pattern}");
        let matches = evaluate_glob(
            fs,
            watcher,
            &GlobParams {
                includes: &[full_pattern],
                excludes,
                include_dotfiles: false,
                search_base: project_root,
                is_project_root,
                allow_empty: true,
            },
        )?;
        for m in matches {
            let stripped = m.strip_prefix(&format!("{dir}/")).unwrap_or(&m).to_owned();
            let key = match prefix {
                Some(p) => format!("{p}/{stripped}"),
                None => stripped,
            };
            if let Some(existing) = out.get(&key) {
                if existing != &m {
                    return Err(GlobError::SubdirGlobConflict(key));
                }
            } else {
                out.insert(key, m);
            }
        }
        let _ = &search_base;
    }
    if out.is_empty() && !allow_empty {
        return Err(GlobError::EmptyResult {
            includes: specs.iter().map(|(d, p)| format!("{d}/{p}")).collect(),
            excludes: excludes.to_vec(),
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_ops::testing::TestFileOps;
    use std::path::PathBuf;

    fn fixture() -> TestFileOps {
        TestFileOps::new([
            (PathBuf::from("/repo/pkg/a.rs"), "a".to_owned()),
            (PathBuf::from("/repo/pkg/b.rs"), "b".to_owned()),
            (PathBuf::from("/repo/pkg/sub/c.rs"), "c".to_owned()),
            (PathBuf::from("/repo/pkg/.hidden.rs"), "h".to_owned()),
        ])
    }

    #[test]
    fn matches_sorted_deduplicated() {
        let fs = fixture();
        let result = evaluate_glob(
            &fs,
            None,
            &GlobParams {
                includes: &["*.rs".to_owned(), "*.rs".to_owned()],
                excludes: &[],
                include_dotfiles: false,
                search_base: Path::new("/repo/pkg"),
                is_project_root: false,
                allow_empty: true,
            },
        )
        .unwrap();
        assert_eq!(result, vec!["a.rs".to_owned(), "b.rs".to_owned()]);
    }

    #[test]
    fn recursive_pattern_matches_nested() {
        let fs = fixture();
        let result = evaluate_glob(
            &fs,
            None,
            &GlobParams {
                includes: &["**/*.rs".to_owned()],
                excludes: &[],
                include_dotfiles: false,
                search_base: Path::new("/repo/pkg"),
                is_project_root: false,
                allow_empty: true,
            },
        )
        .unwrap();
        assert_eq!(result, vec!["a.rs".to_owned(), "b.rs".to_owned(), "sub/c.rs".to_owned()]);
    }

    #[test]
    fn recursive_pattern_at_root_is_fatal() {
        let fs = fixture();
        let err = evaluate_glob(
            &fs,
            None,
            &GlobParams {
                includes: &["**/*.rs".to_owned()],
                excludes: &[],
                include_dotfiles: false,
                search_base: Path::new("/repo"),
                is_project_root: true,
                allow_empty: true,
            },
        )
        .unwrap_err();
        assert!(matches!(err, GlobError::RecursiveAtRoot(_)));
    }

    #[test]
    fn dotfiles_excluded_by_default() {
        let fs = fixture();
        let result = evaluate_glob(
            &fs,
            None,
            &GlobParams {
                includes: &["*.rs".to_owned()],
                excludes: &[],
                include_dotfiles: false,
                search_base: Path::new("/repo/pkg"),
                is_project_root: false,
                allow_empty: true,
            },
        )
        .unwrap();
        assert!(!result.contains(&".hidden.rs".to_owned()));
    }

    #[test]
    fn empty_result_is_fatal_unless_allowed() {
        let fs = fixture();
        let err = evaluate_glob(
            &fs,
            None,
            &GlobParams {
                includes: &["*.nope".to_owned()],
                excludes: &[],
                include_dotfiles: false,
                search_base: Path::new("/repo/pkg"),
                is_project_root: false,
                allow_empty: false,
            },
        )
        .unwrap_err();
        assert!(matches!(err, GlobError::EmptyResult { .. }));
    }
}
