use std::collections::HashMap;
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CellError {
    #[error("invalid cell name `{0}`")]
    InvalidName(String),
    #[error("unknown cell `{0}`")]
    UnknownCell(String),
    #[error("malformed cell_roots entry `{0}`, expected NAME=PATH")]
    MalformedRoot(String),
}

/// A validated cell identifier. Unlike the teacher's `CellName`, this one has
/// no interning: the worker's cell set is small and fixed for its lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellName(String);

impl CellName {
    pub fn new(name: &str) -> Result<Self, CellError> {
        if name.is_empty() || !name.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '-') {
            return Err(CellError::InvalidName(name.to_owned()));
        }
        Ok(CellName(name.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CellName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A flat `NAME -> absolute root` map built once at worker startup.
///
/// The teacher's `CellResolver` additionally supports per-cell alias graphs
/// and path-prefix cell discovery (`CellsAggregator`, a `SequenceTrie`). This
/// worker only ever evaluates files inside its own cell and whatever cells
/// are named on `cell_roots`, so resolution is always by explicit name.
#[derive(Debug, Clone)]
pub struct CellResolver {
    own_cell: CellName,
    roots: HashMap<CellName, PathBuf>,
}

impl CellResolver {
    pub fn new(own_cell: CellName, roots: HashMap<CellName, PathBuf>) -> Self {
        Self { own_cell, roots }
    }

    /// Parses the `cell_roots` flag value: repeated `NAME=PATH` pairs.
    pub fn from_cell_roots(
        own_cell_name: &str,
        project_root: &Path,
        cell_roots: &[String],
    ) -> Result<Self, CellError> {
        let own_cell = CellName::new(own_cell_name)?;
        let mut roots = HashMap::new();
        roots.insert(own_cell.clone(), project_root.to_owned());
        for entry in cell_roots {
            let (name, path) = entry
                .split_once('=')
                .ok_or_else(|| CellError::MalformedRoot(entry.clone()))?;
            roots.insert(CellName::new(name)?, PathBuf::from(path));
        }
        Ok(Self::new(own_cell, roots))
    }

    pub fn own_cell(&self) -> &CellName {
        &self.own_cell
    }

    pub fn root_of(&self, cell: &CellName) -> Result<&Path, CellError> {
        self.roots
            .get(cell)
            .map(|p| p.as_path())
            .ok_or_else(|| CellError::UnknownCell(cell.to_string()))
    }

    /// Resolution by empty-string cell name means "current project root",
    /// used by include-label parsing (§4.A).
    pub fn root_of_str(&self, cell: &str) -> Result<&Path, CellError> {
        if cell.is_empty() {
            return self.root_of(&self.own_cell);
        }
        let name = CellName::new(cell)?;
        self.root_of(&name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_own_cell_by_empty_name() {
        let resolver =
            CellResolver::from_cell_roots("root", Path::new("/repo"), &[]).unwrap();
        assert_eq!(resolver.root_of_str("").unwrap(), Path::new("/repo"));
    }

    #[test]
    fn resolves_named_cell() {
        let resolver = CellResolver::from_cell_roots(
            "root",
            Path::new("/repo"),
            &["other=/repo/other".to_owned()],
        )
        .unwrap();
        assert_eq!(resolver.root_of_str("other").unwrap(), Path::new("/repo/other"));
    }

    #[test]
    fn unknown_cell_is_an_error() {
        let resolver =
            CellResolver::from_cell_roots("root", Path::new("/repo"), &[]).unwrap();
        assert!(resolver.root_of_str("nope").is_err());
    }

    #[test]
    fn malformed_cell_roots_entry_is_an_error() {
        let err = CellResolver::from_cell_roots("root", Path::new("/repo"), &["bad".to_owned()])
            .unwrap_err();
        assert!(matches!(err, CellError::MalformedRoot(_)));
    }
}
