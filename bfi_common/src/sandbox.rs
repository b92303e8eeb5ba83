use std::path::Path;
use std::sync::Mutex;

use crate::file_ops::{FileOps, SimpleDirEntry};

/// Records every environment-variable read made during evaluation.
///
/// Grounded on Design Notes §9: the teacher's Python original intercepts
/// `os.environ` access by monkey-patching the global environment object;
/// here the interception point is an explicit facade that built-ins call,
/// with the recording sink supplied as a parameter rather than discovered
/// by walking the call stack.
pub struct EnvAccess<'a> {
    record: &'a dyn Fn(&str, Option<&str>),
}

impl<'a> EnvAccess<'a> {
    pub fn new(record: &'a dyn Fn(&str, Option<&str>)) -> Self {
        Self { record }
    }

    pub fn get(&self, name: &str) -> Option<String> {
        let value = std::env::var(name).ok();
        (self.record)(name, value.as_deref());
        value
    }
}

/// Wraps a `FileOps` to detect reads of files that were never registered as
/// an include/load dependency, warning instead of failing.
///
/// The teacher's call-stack walk (distinguishing "user build-file code" from
/// "engine internals") is replaced with an explicit `is_user_code` flag
/// threaded by the evaluation engine at each call site (Design Notes §9).
pub struct TrackedFileOps<'a> {
    inner: &'a dyn FileOps,
    known_includes: &'a Mutex<Vec<std::path::PathBuf>>,
    warn: &'a dyn Fn(String),
}

impl<'a> TrackedFileOps<'a> {
    pub fn new(
        inner: &'a dyn FileOps,
        known_includes: &'a Mutex<Vec<std::path::PathBuf>>,
        warn: &'a dyn Fn(String),
    ) -> Self {
        Self {
            inner,
            known_includes,
            warn,
        }
    }

    pub fn read_file(&self, path: &Path, is_user_code: bool) -> anyhow::Result<String> {
        if is_user_code {
            let tracked = self
                .known_includes
                .lock()
                .unwrap()
                .iter()
                .any(|p| p == path);
            if !tracked {
                (self.warn)(format!(
                    "Access to a non-tracked file detected: {}",
                    path.display()
                ));
            }
        }
        self.inner.read_file(path)
    }

    pub fn read_dir(&self, path: &Path) -> anyhow::Result<Vec<SimpleDirEntry>> {
        self.inner.read_dir(path)
    }

    pub fn exists(&self, path: &Path) -> bool {
        self.inner.exists(path)
    }
}
