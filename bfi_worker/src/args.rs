use std::path::PathBuf;

use anyhow::Context as _;
use clap::Parser;

use bfi_common::config::JsonConfigView;
use bfi_core::cells::CellResolver;
use bfi_interpreter_for_build::EngineConfig;

/// Process arguments for one worker instance (§6).
///
/// Grounded on the teacher's `clap::Parser`-derived command structs (see
/// `cli::commands::daemon::DaemonCommand`); this worker has no subcommands,
/// just one flat flag set parsed once at startup.
#[derive(Debug, Parser)]
#[clap(name = "bfi_worker")]
pub struct WorkerArgs {
    /// Absolute path to the repository root.
    #[clap(long)]
    pub project_root: PathBuf,

    /// Repeated `NAME=PATH` cell root pairs.
    #[clap(long = "cell_root")]
    pub cell_roots: Vec<String>,

    /// Name of the cell this worker evaluates build files in.
    #[clap(long)]
    pub cell_name: String,

    /// Expected leaf file name of build files.
    #[clap(long, default_value = "BUILD")]
    pub build_file_name: String,

    #[clap(long)]
    pub allow_empty_globs: bool,

    #[clap(long)]
    pub use_watchman_glob: bool,

    #[clap(long)]
    pub watchman_use_glob_generator: bool,

    #[clap(long)]
    pub watchman_glob_stat_results: bool,

    #[clap(long)]
    pub watchman_socket_path: Option<PathBuf>,

    #[clap(long, default_value = "60000")]
    pub watchman_query_timeout_ms: u64,

    /// Repeated implicit-include labels, applied to every build file.
    #[clap(long = "include")]
    pub include: Vec<String>,

    /// Path to a JSON `{section: {field: value}}` config file.
    #[clap(long)]
    pub config: Option<PathBuf>,

    /// Path to a JSON list of ignore-path glob strings.
    #[clap(long)]
    pub ignore_paths: Option<PathBuf>,

    /// Repeated module names this project may register beyond the
    /// always-on core built-in set (§4.C).
    #[clap(long = "build_file_import_whitelist")]
    pub build_file_import_whitelist: Vec<String>,

    #[clap(long)]
    pub disable_implicit_native_rules: bool,

    #[clap(long)]
    pub warn_about_deprecated_syntax: bool,

    #[clap(long)]
    pub enable_user_defined_rules: bool,

    /// Suppress the per-query stderr summary line; does not affect the
    /// response channel.
    #[clap(long)]
    pub quiet: bool,

    /// Collect a per-query profile and answer `report_profile` commands.
    #[clap(long)]
    pub profile: bool,
}

impl WorkerArgs {
    /// Builds the immutable engine configuration this process evaluates
    /// every query against. Reads the config and ignore-paths files eagerly
    /// since both are small and fixed for the worker's whole lifetime.
    pub fn into_engine_config(self) -> anyhow::Result<EngineConfig> {
        let cells = CellResolver::from_cell_roots(&self.cell_name, &self.project_root, &self.cell_roots)
            .context("invalid cell_name/cell_roots")?;

        let config: Box<dyn bfi_common::config::ConfigView> = match &self.config {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config file `{}`", path.display()))?;
                let value: serde_json::Value = serde_json::from_str(&text)
                    .with_context(|| format!("parsing config file `{}`", path.display()))?;
                Box::new(JsonConfigView::from_json(value)?)
            }
            None => Box::new(JsonConfigView::empty()),
        };

        let ignore_paths = match &self.ignore_paths {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("reading ignore_paths file `{}`", path.display()))?;
                let patterns: Vec<String> = serde_json::from_str(&text)
                    .with_context(|| format!("parsing ignore_paths file `{}`", path.display()))?;
                patterns
            }
            None => Vec::new(),
        };

        Ok(EngineConfig {
            project_root: self.project_root,
            cells,
            build_file_name: self.build_file_name,
            allow_empty_globs: self.allow_empty_globs,
            implicit_includes: self.include,
            config,
            ignore_paths,
            disable_implicit_native_rules: self.disable_implicit_native_rules,
            warn_about_deprecated_syntax: self.warn_about_deprecated_syntax,
            enable_user_defined_rules: self.enable_user_defined_rules,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_flags() {
        let args = WorkerArgs::parse_from([
            "bfi_worker",
            "--project_root",
            "/repo",
            "--cell_name",
            "root",
        ]);
        assert_eq!(args.project_root, PathBuf::from("/repo"));
        assert_eq!(args.cell_name, "root");
        assert_eq!(args.build_file_name, "BUILD");
        assert!(!args.allow_empty_globs);
    }

    #[test]
    fn into_engine_config_defaults_to_empty_config_and_ignore_paths() {
        let args = WorkerArgs::parse_from([
            "bfi_worker",
            "--project_root",
            "/repo",
            "--cell_name",
            "root",
        ]);
        let config = args.into_engine_config().unwrap();
        assert_eq!(config.ignore_paths, Vec::<String>::new());
        assert!(config.config.get("any", "field").is_none());
    }
}
