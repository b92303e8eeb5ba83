use std::io::Write;

use bfi_interpreter::protocol::Response;

/// Startup rerouting (§4.H): duplicates the process's original stdout fd
/// into a dedicated channel, then points fd 1 at fd 2 so any stray write by
/// user code (or a library that assumes it owns stdout) lands on stderr
/// instead of corrupting the response stream.
///
/// Grounded on the teacher's `stdio`-crate idiom of wrapping raw fds in
/// `std::fs::File` via `from_raw_fd` (`app/buck2_forkserver` and the pack's
/// `pantsbuild-pants::stdio` both do this); `dup`/`dup2` themselves are the
/// teacher's own `libc` dependency, unused in the trimmed subset this worker
/// started from.
pub struct ResponseChannel {
    #[cfg(unix)]
    file: std::fs::File,
    #[cfg(not(unix))]
    file: std::io::Stdout,
}

impl ResponseChannel {
    /// Must be called exactly once, before any other code might write to
    /// stdout.
    pub fn install() -> anyhow::Result<Self> {
        #[cfg(unix)]
        {
            use std::os::unix::io::FromRawFd;

            let duplicated = unsafe { libc::dup(libc::STDOUT_FILENO) };
            anyhow::ensure!(duplicated >= 0, "failed to duplicate stdout fd");
            let file = unsafe { std::fs::File::from_raw_fd(duplicated) };

            let rerouted = unsafe { libc::dup2(libc::STDERR_FILENO, libc::STDOUT_FILENO) };
            anyhow::ensure!(rerouted >= 0, "failed to reroute stdout to stderr");

            Ok(Self { file })
        }
        #[cfg(not(unix))]
        {
            Ok(Self { file: std::io::stdout() })
        }
    }

    /// Serializes `response` as one JSON line and flushes it. Falls back to
    /// `Response::encoding_fallback` on serialization failure (§7 error kind
    /// 10) so the worker can keep processing subsequent queries.
    pub fn send(&mut self, response: &Response) -> anyhow::Result<()> {
        let line = match serde_json::to_string(response) {
            Ok(line) => line,
            Err(err) => serde_json::to_string(&Response::encoding_fallback(err))?,
        };
        self.file.write_all(line.as_bytes())?;
        self.file.write_all(b"\n")?;
        self.file.flush()?;
        Ok(())
    }
}
