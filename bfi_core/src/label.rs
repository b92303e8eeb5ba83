use std::path::PathBuf;

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

use crate::cells::{CellError, CellResolver};

#[derive(Debug, Error)]
pub enum LabelError {
    #[error("malformed include label `{0}`")]
    MalformedInclude(String),
    #[error("malformed load label `{0}`")]
    MalformedLoad(String),
    #[error("relative load label `{0}` must not contain `/`")]
    RelativeLoadHasSlash(String),
    #[error(transparent)]
    Cell(#[from] CellError),
}

/// Resolved `(cell, package/file)` pair, produced by either label grammar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildInclude {
    pub cell_name: String,
    pub label: String,
    pub absolute_path: PathBuf,
}

static INCLUDE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^([a-zA-Z0-9_]*)//(.*)$").unwrap());

/// `include_defs`-style label: `([a-zA-Z0-9_]*)//(.*)`. Empty cell means the
/// current project root.
pub struct IncludeLabel;

impl IncludeLabel {
    pub fn resolve(
        label: &str,
        cells: &CellResolver,
    ) -> Result<BuildInclude, LabelError> {
        let caps = INCLUDE_RE
            .captures(label)
            .ok_or_else(|| LabelError::MalformedInclude(label.to_owned()))?;
        let cell = &caps[1];
        let rel = &caps[2];
        let root = cells.root_of_str(cell)?;
        let absolute_path = root.join(rel);
        Ok(BuildInclude {
            cell_name: if cell.is_empty() {
                cells.own_cell().as_str().to_owned()
            } else {
                cell.to_owned()
            },
            label: label.to_owned(),
            absolute_path,
        })
    }
}

static LOAD_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:(@?[a-zA-Z0-9_]*)?//)?([^:]*):(.+)$").unwrap());

/// `load`-style label: `((@?cell)?//)?package:target`.
pub struct LoadLabel;

impl LoadLabel {
    /// `current_dir` is the directory of the file doing the loading, used
    /// when the label has no `//` root.
    pub fn resolve(
        label: &str,
        cells: &CellResolver,
        current_cell: &str,
        current_dir: &std::path::Path,
    ) -> Result<BuildInclude, LabelError> {
        let caps = LOAD_RE
            .captures(label)
            .ok_or_else(|| LabelError::MalformedLoad(label.to_owned()))?;
        let has_root = label.contains("//");
        let raw_cell = caps.get(1).map(|m| m.as_str()).unwrap_or("");
        let package = &caps[2];
        let target = &caps[3];

        if !has_root {
            if target.contains('/') {
                return Err(LabelError::RelativeLoadHasSlash(label.to_owned()));
            }
            let absolute_path = current_dir.join(package).join(target);
            return Ok(BuildInclude {
                cell_name: current_cell.to_owned(),
                label: label.to_owned(),
                absolute_path,
            });
        }

        let cell = raw_cell.strip_prefix('@').unwrap_or(raw_cell);
        let resolved_cell = if cell.is_empty() {
            current_cell.to_owned()
        } else {
            cell.to_owned()
        };
        let root = cells.root_of_str(&resolved_cell)?;
        let absolute_path = root.join(package).join(target);
        Ok(BuildInclude {
            cell_name: resolved_cell,
            label: label.to_owned(),
            absolute_path,
        })
    }
}

/// Whether a `load()` label names its cell without the leading `@` the
/// non-deprecated form requires (e.g. `other//pkg:x.bzl` instead of
/// `@other//pkg:x.bzl`). Relative labels (`:x.bzl`) and labels with no cell
/// name never trigger this.
pub fn load_label_uses_deprecated_cell(label: &str) -> bool {
    match LOAD_RE.captures(label) {
        Some(caps) if label.contains("//") => {
            let raw_cell = caps.get(1).map(|m| m.as_str()).unwrap_or("");
            !raw_cell.is_empty() && !raw_cell.starts_with('@')
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn resolver() -> CellResolver {
        CellResolver::from_cell_roots("root", Path::new("/repo"), &["other=/other".to_owned()])
            .unwrap()
    }

    #[test]
    fn include_label_defaults_to_own_cell() {
        let inc = IncludeLabel::resolve("//defs/a.bzl", &resolver()).unwrap();
        assert_eq!(inc.absolute_path, Path::new("/repo/defs/a.bzl"));
    }

    #[test]
    fn include_label_named_cell() {
        let inc = IncludeLabel::resolve("other//defs/a.bzl", &resolver()).unwrap();
        assert_eq!(inc.absolute_path, Path::new("/other/defs/a.bzl"));
    }

    #[test]
    fn include_label_rejects_malformed() {
        assert!(IncludeLabel::resolve("not-a-label", &resolver()).is_err());
    }

    #[test]
    fn load_label_relative_to_current_dir() {
        let inc = LoadLabel::resolve(":x.bzl", &resolver(), "root", Path::new("/repo/pkg"))
            .unwrap();
        assert_eq!(inc.absolute_path, Path::new("/repo/pkg/x.bzl"));
    }

    #[test]
    fn load_label_relative_with_slash_is_fatal() {
        let err = LoadLabel::resolve("a/b:x.bzl", &resolver(), "root", Path::new("/repo/pkg"))
            .unwrap_err();
        assert!(matches!(err, LabelError::RelativeLoadHasSlash(_)));
    }

    #[test]
    fn load_label_absolute_with_at_cell() {
        let inc = LoadLabel::resolve("@other//pkg:x.bzl", &resolver(), "root", Path::new("/repo"))
            .unwrap();
        assert_eq!(inc.absolute_path, Path::new("/other/pkg/x.bzl"));
    }

    #[test]
    fn load_label_empty_cell_on_absolute_resolves_to_caller_cell() {
        let inc = LoadLabel::resolve("//pkg:x.bzl", &resolver(), "root", Path::new("/repo"))
            .unwrap();
        assert_eq!(inc.cell_name, "root");
    }

    #[test]
    fn deprecated_cell_syntax_detected_without_at_prefix() {
        assert!(load_label_uses_deprecated_cell("other//pkg:x.bzl"));
        assert!(!load_label_uses_deprecated_cell("@other//pkg:x.bzl"));
        assert!(!load_label_uses_deprecated_cell("//pkg:x.bzl"));
        assert!(!load_label_uses_deprecated_cell(":x.bzl"));
    }
}
