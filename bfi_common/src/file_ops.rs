use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Coarse file kind, as reported by a directory listing.
///
/// Grounded on the teacher's `buck2_common::file_ops::FileType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    File,
    Directory,
    Symlink,
}

impl FileType {
    pub fn is_dir(self) -> bool {
        matches!(self, FileType::Directory)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimpleDirEntry {
    pub file_name: String,
    pub file_type: FileType,
}

/// Sandboxed filesystem access. Grounded on the teacher's async `FileOps`
/// trait; made synchronous because this worker's concurrency model is
/// single-threaded cooperative (§5) — there is never a second evaluation in
/// flight to justify `async_trait`.
pub trait FileOps: Send + Sync {
    fn read_dir(&self, path: &Path) -> anyhow::Result<Vec<SimpleDirEntry>>;
    fn read_file(&self, path: &Path) -> anyhow::Result<String>;
    fn exists(&self, path: &Path) -> bool;
}

pub struct RealFileOps;

impl FileOps for RealFileOps {
    fn read_dir(&self, path: &Path) -> anyhow::Result<Vec<SimpleDirEntry>> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(path)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            let kind = if file_type.is_dir() {
                FileType::Directory
            } else if file_type.is_symlink() {
                FileType::Symlink
            } else {
                FileType::File
            };
            out.push(SimpleDirEntry {
                file_name: entry.file_name().to_string_lossy().into_owned(),
                file_type: kind,
            });
        }
        Ok(out)
    }

    fn read_file(&self, path: &Path) -> anyhow::Result<String> {
        Ok(std::fs::read_to_string(path)?)
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }
}

pub mod testing {
    use super::*;

    /// In-memory `FileOps` fixture for tests, grounded on the teacher's
    /// `file_ops::testing::TestFileOps`.
    #[derive(Debug, Default)]
    pub struct TestFileOps {
        files: HashMap<PathBuf, String>,
    }

    impl TestFileOps {
        pub fn new(files: impl IntoIterator<Item = (PathBuf, String)>) -> Self {
            Self {
                files: files.into_iter().collect(),
            }
        }
    }

    impl FileOps for TestFileOps {
        fn read_dir(&self, path: &Path) -> anyhow::Result<Vec<SimpleDirEntry>> {
            let mut seen = std::collections::BTreeSet::new();
            for file in self.files.keys() {
                if let Ok(rel) = file.strip_prefix(path) {
                    if let Some(first) = rel.components().next() {
                        let name = first.as_os_str().to_string_lossy().into_owned();
                        let is_dir = rel.components().count() > 1;
                        seen.insert((name, is_dir));
                    }
                }
            }
            Ok(seen
                .into_iter()
                .map(|(file_name, is_dir)| SimpleDirEntry {
                    file_name,
                    file_type: if is_dir {
                        FileType::Directory
                    } else {
                        FileType::File
                    },
                })
                .collect())
        }

        fn read_file(&self, path: &Path) -> anyhow::Result<String> {
            self.files
                .get(path)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("no such test file: {}", path.display()))
        }

        fn exists(&self, path: &Path) -> bool {
            self.files.contains_key(path)
        }
    }
}
