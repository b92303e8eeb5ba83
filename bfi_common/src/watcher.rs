use std::time::Duration;

/// A pluggable accelerated-glob oracle, consulted first by the glob engine
/// when configured. Grounded on the shape of the teacher's
/// `buck2_server::file_watcher::notify` adapter (a `notify`-crate-backed
/// `ChangeType` watcher), generalized into a synchronous request/response
/// trait since the concrete watcher client is an out-of-scope external
/// collaborator (§1) — this worker only needs the interface shape.
pub trait WatcherBackend: Send + Sync {
    /// Returns `None` when the backend has no opinion (falls through to the
    /// filesystem walker); `Some(paths)` when it does, package-relative.
    fn glob(
        &self,
        base_path: &str,
        includes: &[String],
        excludes: &[String],
        timeout: Duration,
    ) -> anyhow::Result<Option<Vec<String>>>;
}

/// A `notify`-backed watcher is a legitimate, heavier implementation of
/// `WatcherBackend` that a deployment can plug in; this worker ships none by
/// default (`use_watchman_glob=false` is the common case) so only the trait
/// and a no-op implementation live here.
pub struct NoWatcher;

impl WatcherBackend for NoWatcher {
    fn glob(
        &self,
        _base_path: &str,
        _includes: &[String],
        _excludes: &[String],
        _timeout: Duration,
    ) -> anyhow::Result<Option<Vec<String>>> {
        Ok(None)
    }
}
