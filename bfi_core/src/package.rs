use std::path::{Path, PathBuf};

/// The package-relative directory a build file lives in, plus the cell that
/// owns it. Unlike the teacher's `PackageLabel` this carries no interning —
/// package identity here is used only within a single query's evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageLabel {
    cell_name: String,
    base_path: String,
}

impl PackageLabel {
    pub fn new(cell_name: impl Into<String>, base_path: impl Into<String>) -> Self {
        Self {
            cell_name: cell_name.into(),
            base_path: base_path.into(),
        }
    }

    /// Derives the package from a build file's absolute path and project root.
    pub fn from_build_file(cell_name: &str, project_root: &Path, build_file: &Path) -> Self {
        let dir = build_file.parent().unwrap_or(project_root);
        let rel = dir.strip_prefix(project_root).unwrap_or(dir);
        Self::new(cell_name, rel.to_string_lossy().replace('\\', "/"))
    }

    pub fn cell_name(&self) -> &str {
        &self.cell_name
    }

    pub fn base_path(&self) -> &str {
        &self.base_path
    }

    pub fn as_path_buf(&self, project_root: &Path) -> PathBuf {
        project_root.join(&self.base_path)
    }
}
