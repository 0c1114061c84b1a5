pub mod analysis;
pub mod cache;
pub mod config;
pub mod definition;
pub mod errors;
pub mod fixtures;
pub mod fsm;
pub mod logging;
pub mod manifest;
pub mod message_log;
pub mod process_group;
pub mod replay_fixture;
pub mod report;
pub mod runner;
pub mod runtime;
pub mod store;
pub mod topics;
pub mod types;

use cache::ContentCache;
use clap::{error::ErrorKind, Parser};
use config::{
    layered_env, load_config, load_env_file, resolve_cache_root, resolve_results_root,
    CliOverrides,
};
use errors::ReplayError;
use logging::{append_run_log, clear_run_logger, init_run_logger};
use manifest::{load_test_definition, ManifestContext};
use message_log::JsonlFormat;
use process_group::CommandProcessGroup;
use report::{resolve_hostname, Report, REPORT_FILE_NAME};
use runner::{Invocation, ReplayTestingRunner, RunnerOptions};
use runtime::ProductionRuntime;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use store::build_registry;
use types::{EnvMap, RunIdentity};

#[derive(Debug, Clone, Parser)]
#[command(name = "replay-test")]
#[command(about = "Replay recorded message logs through a system under test and analyze its output")]
pub struct Cli {
    /// TOML test definition.
    pub test_file: PathBuf,
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Skip fixtures and run; analyze the artifacts of an earlier run id.
    #[arg(long, value_name = "RUN_ID")]
    pub analyze: Option<String>,
    /// Also copy the JUnit report here.
    #[arg(long = "junit-xml", value_name = "PATH")]
    pub junit_xml: Option<PathBuf>,
    /// KEY=VALUE file layered over the process environment.
    #[arg(long = "env", value_name = "FILE")]
    pub env_file: Option<PathBuf>,
    /// Overrides the test name used in the report.
    #[arg(long)]
    pub package_name: Option<String>,
    #[arg(long)]
    pub results_root: Option<PathBuf>,
    #[arg(long)]
    pub cache_root: Option<PathBuf>,
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
}

pub fn run() -> Result<i32, ReplayError> {
    let args = std::env::args_os().collect::<Vec<_>>();
    let env = std::env::vars_os().collect::<Vec<_>>();
    let cwd = std::env::current_dir().map_err(|e| ReplayError::Io(e.to_string()))?;
    let runtime = ProductionRuntime::new();
    run_with_runtime(&args, &env, &cwd, &runtime)
}

pub fn run_with_runtime(
    args: &[std::ffi::OsString],
    env: &[(std::ffi::OsString, std::ffi::OsString)],
    cwd: &Path,
    runtime: &ProductionRuntime,
) -> Result<i32, ReplayError> {
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(error) => match error.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                print!("{error}");
                return Ok(0);
            }
            _ => return Err(ReplayError::Cli(error.to_string())),
        },
    };

    let (run_id, invocation) = match &cli.analyze {
        Some(text) => (RunIdentity::parse(text)?, Invocation::AnalyzeOnly),
        None => (RunIdentity::fresh(), Invocation::Full),
    };

    let overrides = CliOverrides {
        config_path: cli.config.as_ref().map(|p| absolutize(cwd, p)),
        results_root: cli.results_root.clone(),
        cache_root: cli.cache_root.clone(),
    };
    let cfg = load_config(&overrides, runtime.file_system.as_ref())?;

    let overlay = match &cli.env_file {
        Some(path) => load_env_file(&absolutize(cwd, path), runtime.file_system.as_ref())?,
        None => EnvMap::new(),
    };
    let env_map = layered_env(&env_to_map(env), &overlay);

    let results_root = resolve_results_root(&cfg, &env_map, cwd, runtime.file_system.as_ref());
    let results_dir = results_root.join(run_id.to_string());
    if invocation == Invocation::AnalyzeOnly && !runtime.file_system.exists(&results_dir) {
        return Err(ReplayError::Cli(format!(
            "no results for run id {run_id} under {}",
            results_root.display()
        )));
    }
    runtime.file_system.create_dir_all(&results_dir)?;
    init_run_logger(Some(&results_dir.join("harness.jsonl")), cli.verbose);

    let outcome = execute(&cli, &cfg, &env_map, cwd, runtime, &results_root, run_id, invocation);
    if let Err(err) = &outcome {
        append_run_log("error", "harness.failed", json!({"error": err.to_string()}));
    }
    clear_run_logger();
    outcome
}

#[allow(clippy::too_many_arguments)]
fn execute(
    cli: &Cli,
    cfg: &config::HarnessConfig,
    env_map: &EnvMap,
    cwd: &Path,
    runtime: &ProductionRuntime,
    results_root: &Path,
    run_id: RunIdentity,
    invocation: Invocation,
) -> Result<i32, ReplayError> {
    let cache = ContentCache::new(resolve_cache_root(cfg, cwd), Arc::clone(&runtime.clock))
        .with_retry(
            cfg.cache.max_attempts,
            Duration::from_millis(cfg.cache.retry_backoff_ms),
        );
    let stores = build_registry(&cfg.stores, env_map)?;
    let ctx = ManifestContext {
        fs: runtime.file_system.as_ref(),
        stores: &stores,
        cache: Arc::new(cache),
    };
    let mut definition = load_test_definition(&absolutize(cwd, &cli.test_file), &ctx)?;
    if let Some(name) = &cli.package_name {
        definition.rename(name.clone());
    }

    let process_group = CommandProcessGroup::new(
        Arc::clone(&runtime.process_runner),
        Arc::clone(&runtime.clock),
        Duration::from_millis(cfg.shutdown.grace_period_ms),
    );
    let mut runner = ReplayTestingRunner::new(RunnerOptions {
        results_root: results_root.to_path_buf(),
        run_id,
        format: Arc::new(JsonlFormat::new(cfg.log_format.payload_extension.clone())),
        process_group: Arc::new(process_group),
        recorder: cfg.recorder.clone(),
        player: cfg.player.clone(),
        env: env_map.clone(),
        terminal: Arc::clone(&runtime.terminal),
    });
    let results = runner.execute(&definition, invocation)?;

    let hostname = resolve_hostname(env_map, runtime.process_runner.as_ref());
    let report = Report::from_results(definition.name(), &results, runtime.clock.now(), &hostname);
    let report_path = runner.results_dir().join(REPORT_FILE_NAME);
    report.write_xml(&report_path)?;
    for line in report.console_lines(&report_path, runtime.terminal.stdout_is_tty()) {
        runtime.terminal.write_line(&line)?;
    }

    if let Some(target) = &cli.junit_xml {
        let target = absolutize(cwd, target);
        if let Some(parent) = target.parent() {
            runtime.file_system.create_dir_all(parent)?;
        }
        runtime.file_system.copy(&report_path, &target)?;
    }

    append_run_log(
        "info",
        "harness.completed",
        json!({
            "run_id": run_id.to_string(),
            "report": report_path.display().to_string(),
            "tests": report.tests(),
            "failures": report.failures(),
            "errors": report.errors(),
        }),
    );
    Ok(if report.successful() { 0 } else { 1 })
}

fn absolutize(base: &Path, value: &Path) -> PathBuf {
    if value.is_absolute() {
        value.to_path_buf()
    } else {
        base.join(value)
    }
}

fn env_to_map(env: &[(std::ffi::OsString, std::ffi::OsString)]) -> EnvMap {
    let mut map = EnvMap::new();
    for (key, value) in env {
        if let (Some(key), Some(value)) = (key.to_str(), value.to_str()) {
            map.insert(key.to_string(), value.to_string());
        }
    }
    map
}
