mod args;
mod framing;
mod profile;

use std::collections::HashMap;
use std::io::BufRead;
use std::time::Instant;

use anyhow::Context as _;
use clap::Parser as _;
use serde_json::{Map, Value};

use bfi_common::file_ops::RealFileOps;
use bfi_common::glob::GlobError;
use bfi_interpreter::context::Accumulators;
use bfi_interpreter::diagnostic::Diagnostic;
use bfi_interpreter::protocol::{Query, Response};
use bfi_interpreter_for_build::EvalEngine;

use args::WorkerArgs;
use framing::ResponseChannel;
use profile::Recorder;

/// `\cygdrive\c\foo` / `/cygdrive/c/foo` → `c:/foo` (§4.H step 2). The
/// orchestrator is assumed to run on a POSIX host in the common case; this
/// only matters when it runs under Cygwin and hands the worker Windows-style
/// drive paths.
fn normalize_cygwin_path(path: &str) -> String {
    let trimmed = path.trim_start_matches(['/', '\\']);
    match trimmed.strip_prefix("cygdrive/").or_else(|| trimmed.strip_prefix("cygdrive\\")) {
        Some(rest) => {
            let mut chars = rest.chars();
            match (chars.next(), chars.next()) {
                (Some(drive), Some('/')) | (Some(drive), Some('\\')) => {
                    format!("{drive}:/{}", &rest[2..])
                }
                _ => path.to_owned(),
            }
        }
        None => path.to_owned(),
    }
}

fn configs_to_json(used_configs: &HashMap<String, HashMap<String, Value>>) -> Value {
    let mut sections = Map::new();
    for (section, fields) in used_configs {
        sections.insert(section.clone(), Value::Object(fields.iter().map(|(k, v)| (k.clone(), v.clone())).collect()));
    }
    Value::Object(sections)
}

fn env_to_json(used_env_vars: &HashMap<String, Option<String>>) -> Value {
    let mut map = Map::new();
    for (name, value) in used_env_vars {
        map.insert(name.clone(), value.clone().map(Value::String).unwrap_or(Value::Null));
    }
    Value::Object(map)
}

/// Builds the `values` array per §6: rule records followed by the three
/// metadata entries, in a fixed order.
fn values_for(rules: Vec<bfi_interpreter::rule::RuleRecord>, accumulators: &Accumulators) -> Vec<Value> {
    let mut values: Vec<Value> = rules.into_iter().map(|r| r.into_value()).collect();
    let includes: Vec<Value> = accumulators
        .includes
        .iter()
        .map(|p| Value::String(p.to_string_lossy().into_owned()))
        .collect();
    values.push(Value::Object(Map::from_iter([("__includes".to_owned(), Value::Array(includes))])));
    values.push(Value::Object(Map::from_iter([(
        "__configs".to_owned(),
        configs_to_json(&accumulators.used_configs),
    )])));
    values.push(Value::Object(Map::from_iter([(
        "__env".to_owned(),
        env_to_json(&accumulators.used_env_vars),
    )])));
    values
}

/// `process_with_diagnostics` (§4.H step 3): runs one query through the
/// engine and turns a fatal `anyhow::Error` into a `Response` carrying a
/// single diagnostic rather than propagating, so one bad build file never
/// takes down the worker loop. Watcher-backend failures are reported under
/// diagnostic source `watchman` (§7 error kind 7); everything else is
/// `parse`.
fn process_with_diagnostics(engine: &EvalEngine<'_>, query: &Query) -> Response {
    match engine.process_build_file(query) {
        Ok((rules, accumulators)) => Response {
            values: values_for(rules, &accumulators),
            diagnostics: accumulators.diagnostics.clone(),
            profile: None,
        },
        Err(err) => {
            let is_watcher_failure = err
                .chain()
                .filter_map(|e| e.downcast_ref::<GlobError>())
                .any(GlobError::is_watcher_failure);
            let source = if is_watcher_failure { "watchman" } else { "parse" };
            Response {
                values: Vec::new(),
                diagnostics: vec![Diagnostic::fatal(source, err.to_string())],
                profile: None,
            }
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args = WorkerArgs::parse();
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let quiet = args.quiet;
    let profile_enabled = args.profile;
    if args.use_watchman_glob {
        tracing::warn!("use_watchman_glob set, but no watcher backend is wired in; falling back to the filesystem walker");
    }

    let config = args.into_engine_config()?;
    let file_ops = RealFileOps;
    let engine = EvalEngine::new(config, &file_ops, None);
    let mut recorder = Recorder::new();
    let mut channel = ResponseChannel::install().context("installing the response channel")?;

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line.context("reading a query line from stdin")?;
        if line.trim().is_empty() {
            continue;
        }
        let mut query: Query = serde_json::from_str(&line).context("parsing query JSON")?;
        query.build_file = normalize_cygwin_path(&query.build_file);
        query.watch_root = normalize_cygwin_path(&query.watch_root);

        let span = tracing::info_span!("query", build_file = %query.build_file);
        let _guard = span.enter();

        if query.command.as_deref() == Some("report_profile") {
            channel.send(&Response {
                values: Vec::new(),
                diagnostics: Vec::new(),
                profile: Some(recorder.report()),
            })?;
            continue;
        }

        let start = Instant::now();
        let response = process_with_diagnostics(&engine, &query);
        let elapsed = start.elapsed();
        if profile_enabled {
            recorder.record(query.build_file.clone(), elapsed);
        }
        if !quiet {
            eprintln!("{} ({:.3}s, {} diagnostic(s))", query.build_file, elapsed.as_secs_f64(), response.diagnostics.len());
        }
        channel.send(&response)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bfi_common::config::JsonConfigView;
    use bfi_common::file_ops::testing::TestFileOps;
    use bfi_core::cells::CellResolver;
    use bfi_interpreter_for_build::EngineConfig;
    use std::path::PathBuf;

    #[test]
    fn normalizes_forward_slash_cygdrive_paths() {
        assert_eq!(normalize_cygwin_path("/cygdrive/c/repo/BUILD"), "c:/repo/BUILD");
    }

    #[test]
    fn leaves_ordinary_posix_paths_untouched() {
        assert_eq!(normalize_cygwin_path("/repo/pkg/BUILD"), "/repo/pkg/BUILD");
    }

    #[test]
    fn values_for_appends_metadata_entries_in_order() {
        let mut accumulators = Accumulators::default();
        accumulators.record_include(PathBuf::from("/repo/defs.bzl"));
        accumulators.record_config("section", "field", Value::from("v"));
        accumulators.record_env("HOME", Some("/root".to_owned()));

        let values = values_for(Vec::new(), &accumulators);
        assert_eq!(values.len(), 3);
        assert!(values[0]["__includes"].as_array().unwrap()[0].as_str().unwrap().ends_with("defs.bzl"));
        assert_eq!(values[1]["__configs"]["section"]["field"], Value::from("v"));
        assert_eq!(values[2]["__env"]["HOME"], Value::from("/root"));
    }

    #[test]
    fn process_with_diagnostics_reports_fatal_errors_instead_of_propagating() {
        let file_ops = TestFileOps::new([(PathBuf::from("/repo/BUILD"), "fail(\"boom\")\n".to_owned())]);
        let cells = CellResolver::from_cell_roots("root", &PathBuf::from("/repo"), &[]).unwrap();
        let config = EngineConfig {
            project_root: PathBuf::from("/repo"),
            cells,
            build_file_name: "BUILD".to_owned(),
            allow_empty_globs: true,
            implicit_includes: Vec::new(),
            config: Box::new(JsonConfigView::empty()),
            ignore_paths: Vec::new(),
            disable_implicit_native_rules: false,
            warn_about_deprecated_syntax: false,
            enable_user_defined_rules: true,
        };
        let engine = EvalEngine::new(config, &file_ops, None);
        let query = Query {
            build_file: "/repo/BUILD".to_owned(),
            watch_root: "/repo".to_owned(),
            project_prefix: String::new(),
            package_implicit_load: None,
            command: None,
        };
        let response = process_with_diagnostics(&engine, &query);
        assert!(response.values.is_empty());
        assert_eq!(response.diagnostics.len(), 1);
        assert_eq!(response.diagnostics[0].source, "parse");
    }
}
