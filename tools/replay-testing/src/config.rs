use crate::errors::ReplayError;
use crate::logging::append_run_log;
use crate::runtime::FileSystem;
use crate::types::EnvMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const CI_RESULTS_DIR: &str = "test_results/replay_testing";

#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub config_path: Option<PathBuf>,
    pub results_root: Option<PathBuf>,
    pub cache_root: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HarnessConfig {
    pub paths: PathsConfig,
    pub player: PlayerConfig,
    pub recorder: RecorderConfig,
    pub shutdown: ShutdownConfig,
    pub cache: CacheConfig,
    pub log_format: LogFormatConfig,
    pub stores: BTreeMap<String, StoreDeclaration>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct PathsConfig {
    pub results_root: Option<PathBuf>,
    pub cache_root: Option<PathBuf>,
}

/// `{source}` and `{rate}` are substituted per run; `clock_args` are
/// appended when the run parameter asks for the simulated clock.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlayerConfig {
    pub command: Vec<String>,
    pub clock_args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecorderConfig {
    pub command: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ShutdownConfig {
    pub grace_period_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheConfig {
    pub max_attempts: u32,
    pub retry_backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogFormatConfig {
    pub payload_extension: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StoreDeclaration {
    Directory {
        root: PathBuf,
    },
    Http {
        base_url: String,
        #[serde(default)]
        username_env: Option<String>,
        #[serde(default)]
        password_env: Option<String>,
        #[serde(default)]
        timeout_secs: Option<u64>,
    },
    S3 {
        #[serde(default)]
        bucket: Option<String>,
        #[serde(default)]
        region: Option<String>,
        #[serde(default)]
        endpoint_url: Option<String>,
        #[serde(default)]
        access_key_id_env: Option<String>,
        #[serde(default)]
        secret_access_key_env: Option<String>,
        #[serde(default)]
        session_token_env: Option<String>,
    },
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            paths: PathsConfig::default(),
            player: PlayerConfig {
                command: vec![
                    "replay-player".to_string(),
                    "{source}".to_string(),
                    "--rate".to_string(),
                    "{rate}".to_string(),
                ],
                clock_args: vec!["--clock".to_string()],
            },
            recorder: RecorderConfig {
                command: vec![
                    "replay-recorder".to_string(),
                    "--all".to_string(),
                    "--output".to_string(),
                    "{destination}".to_string(),
                ],
            },
            shutdown: ShutdownConfig {
                grace_period_ms: 5_000,
            },
            cache: CacheConfig {
                max_attempts: 3,
                retry_backoff_ms: 500,
            },
            log_format: LogFormatConfig {
                payload_extension: "jsonl".to_string(),
            },
            stores: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct PartialHarnessConfig {
    paths: Option<PartialPathsConfig>,
    player: Option<PartialPlayerConfig>,
    recorder: Option<PartialRecorderConfig>,
    shutdown: Option<PartialShutdownConfig>,
    cache: Option<PartialCacheConfig>,
    log_format: Option<PartialLogFormatConfig>,
    stores: Option<BTreeMap<String, StoreDeclaration>>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct PartialPathsConfig {
    results_root: Option<PathBuf>,
    cache_root: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct PartialPlayerConfig {
    command: Option<Vec<String>>,
    clock_args: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct PartialRecorderConfig {
    command: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct PartialShutdownConfig {
    grace_period_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct PartialCacheConfig {
    max_attempts: Option<u32>,
    retry_backoff_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct PartialLogFormatConfig {
    payload_extension: Option<String>,
}

pub fn load_config(
    overrides: &CliOverrides,
    fs: &dyn FileSystem,
) -> Result<HarnessConfig, ReplayError> {
    let mut cfg = HarnessConfig::default();

    if let Some(path) = &overrides.config_path {
        let file_contents = fs.read_to_string(path)?;
        let partial: PartialHarnessConfig = toml::from_str(&file_contents)
            .map_err(|e| ReplayError::ConfigParse(format!("{}: {e}", path.display())))?;
        merge_partial_config(&mut cfg, partial);
    }

    apply_cli_overrides(&mut cfg, overrides);
    validate_config(&cfg)?;
    Ok(cfg)
}

fn merge_partial_config(cfg: &mut HarnessConfig, partial: PartialHarnessConfig) {
    if let Some(paths) = partial.paths {
        if paths.results_root.is_some() {
            cfg.paths.results_root = paths.results_root;
        }
        if paths.cache_root.is_some() {
            cfg.paths.cache_root = paths.cache_root;
        }
    }

    if let Some(player) = partial.player {
        if let Some(command) = player.command {
            cfg.player.command = command;
        }
        if let Some(clock_args) = player.clock_args {
            cfg.player.clock_args = clock_args;
        }
    }

    if let Some(command) = partial.recorder.and_then(|recorder| recorder.command) {
        cfg.recorder.command = command;
    }

    if let Some(grace) = partial.shutdown.and_then(|s| s.grace_period_ms) {
        cfg.shutdown.grace_period_ms = grace;
    }

    if let Some(cache) = partial.cache {
        if let Some(max_attempts) = cache.max_attempts {
            cfg.cache.max_attempts = max_attempts;
        }
        if let Some(backoff) = cache.retry_backoff_ms {
            cfg.cache.retry_backoff_ms = backoff;
        }
    }

    if let Some(ext) = partial.log_format.and_then(|f| f.payload_extension) {
        cfg.log_format.payload_extension = ext;
    }

    if let Some(stores) = partial.stores {
        cfg.stores.extend(stores);
    }
}

fn apply_cli_overrides(cfg: &mut HarnessConfig, overrides: &CliOverrides) {
    if let Some(results_root) = &overrides.results_root {
        cfg.paths.results_root = Some(results_root.clone());
    }
    if let Some(cache_root) = &overrides.cache_root {
        cfg.paths.cache_root = Some(cache_root.clone());
    }
}

fn validate_config(cfg: &HarnessConfig) -> Result<(), ReplayError> {
    if cfg.cache.max_attempts == 0 {
        return Err(ReplayError::Configuration(
            "cache.max_attempts must be greater than zero".to_string(),
        ));
    }

    let ext = cfg.log_format.payload_extension.trim();
    if ext.is_empty() || ext.contains('.') || ext.contains('/') {
        return Err(ReplayError::Configuration(format!(
            "log_format.payload_extension `{ext}` must be a bare extension such as `jsonl`"
        )));
    }

    if !cfg.recorder.command.iter().any(|arg| arg.contains("{destination}")) {
        return Err(ReplayError::Configuration(
            "recorder.command must reference {destination}".to_string(),
        ));
    }
    if !cfg.player.command.iter().any(|arg| arg.contains("{source}")) {
        return Err(ReplayError::Configuration(
            "player.command must reference {source}".to_string(),
        ));
    }

    for (id, store) in &cfg.stores {
        if id.trim().is_empty() || id.contains('/') {
            return Err(ReplayError::Configuration(format!(
                "store id `{id}` must be a non-empty single path segment"
            )));
        }
        let (field, url) = match store {
            StoreDeclaration::Http { base_url, .. } => ("base_url", Some(base_url)),
            StoreDeclaration::S3 { endpoint_url, .. } => ("endpoint_url", endpoint_url.as_ref()),
            StoreDeclaration::Directory { .. } => ("root", None),
        };
        if let Some(url) = url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(ReplayError::Configuration(format!(
                    "stores.{id}.{field} must be an http(s) url"
                )));
            }
        }
    }

    Ok(())
}

/// Picks the results root: explicit config first, then the CI location when
/// `CI` is set, otherwise the temp dir. Falls back to the CI location when
/// the chosen directory cannot be created.
pub fn resolve_results_root(
    cfg: &HarnessConfig,
    env: &EnvMap,
    process_cwd: &Path,
    fs: &dyn FileSystem,
) -> PathBuf {
    let fallback = process_cwd.join(CI_RESULTS_DIR);
    let preferred = match &cfg.paths.results_root {
        Some(path) => absolutize_path(process_cwd, path),
        None if env.contains_key("CI") => fallback.clone(),
        None => std::env::temp_dir().join("replay_testing"),
    };

    match fs.create_dir_all(&preferred) {
        Ok(()) => preferred,
        Err(err) => {
            append_run_log(
                "error",
                "config.results_root.unwritable",
                json!({
                    "path": preferred.display().to_string(),
                    "fallback": fallback.display().to_string(),
                    "error": err.to_string(),
                }),
            );
            fallback
        }
    }
}

pub fn resolve_cache_root(cfg: &HarnessConfig, process_cwd: &Path) -> PathBuf {
    match &cfg.paths.cache_root {
        Some(path) => absolutize_path(process_cwd, path),
        None => std::env::temp_dir().join("replay_testing").join(".cache"),
    }
}

fn absolutize_path(base: &Path, value: &Path) -> PathBuf {
    if value.is_absolute() {
        value.to_path_buf()
    } else {
        base.join(value)
    }
}

/// Parses a dotenv-style file. Blank lines and `#` comments are skipped,
/// lines without `=` are skipped with a warning, and one pair of matching
/// quotes around a value is stripped.
pub fn parse_env_file(contents: &str) -> EnvMap {
    let mut vars = EnvMap::new();
    for (index, raw) in contents.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            append_run_log(
                "warn",
                "config.env_file.invalid_line",
                json!({"line": index + 1, "text": line}),
            );
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            append_run_log(
                "warn",
                "config.env_file.invalid_line",
                json!({"line": index + 1, "text": line}),
            );
            continue;
        }
        vars.insert(key.to_string(), strip_quotes(value.trim()).to_string());
    }
    vars
}

pub fn load_env_file(path: &Path, fs: &dyn FileSystem) -> Result<EnvMap, ReplayError> {
    let contents = fs.read_to_string(path)?;
    let vars = parse_env_file(&contents);
    append_run_log(
        "info",
        "config.env_file.loaded",
        json!({"path": path.display().to_string(), "count": vars.len()}),
    );
    Ok(vars)
}

/// `base` (usually the process environment) with `overlay` taking
/// precedence.
pub fn layered_env(base: &EnvMap, overlay: &EnvMap) -> EnvMap {
    let mut env = base.clone();
    env.extend(overlay.iter().map(|(k, v)| (k.clone(), v.clone())));
    env
}

fn strip_quotes(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::FakeFileSystem;

    #[test]
    fn defaults_load_without_a_config_file() {
        let fs = FakeFileSystem::default();
        let cfg = load_config(&CliOverrides::default(), &fs).expect("defaults");
        assert_eq!(cfg, HarnessConfig::default());
        assert_eq!(cfg.log_format.payload_extension, "jsonl");
    }

    #[test]
    fn partial_file_overlays_defaults_and_cli_wins() {
        let fs = FakeFileSystem::with_file(
            "/cfg/replay.toml",
            r#"
[paths]
results_root = "out/results"

[shutdown]
grace_period_ms = 250

[cache]
max_attempts = 5

[stores.nexus]
kind = "http"
base_url = "https://nexus.example.test/repository/bags"
username_env = "NEXUS_USER"
password_env = "NEXUS_PASSWORD"

[stores.shared]
kind = "directory"
root = "/mnt/bags"

[stores.bags]
kind = "s3"
bucket = "replay-testing-bags"
region = "eu-west-1"
"#,
        );
        let overrides = CliOverrides {
            config_path: Some(PathBuf::from("/cfg/replay.toml")),
            results_root: Some(PathBuf::from("/override")),
            cache_root: None,
        };
        let cfg = load_config(&overrides, &fs).expect("config");

        assert_eq!(cfg.paths.results_root, Some(PathBuf::from("/override")));
        assert_eq!(cfg.shutdown.grace_period_ms, 250);
        assert_eq!(cfg.cache.max_attempts, 5);
        assert_eq!(cfg.cache.retry_backoff_ms, 500);
        assert_eq!(cfg.stores.len(), 3);
        assert!(matches!(
            cfg.stores.get("bags"),
            Some(StoreDeclaration::S3 { bucket: Some(bucket), endpoint_url: None, .. })
                if bucket == "replay-testing-bags"
        ));
        assert!(matches!(
            cfg.stores.get("shared"),
            Some(StoreDeclaration::Directory { .. })
        ));
    }

    #[test]
    fn validation_rejects_zero_attempts_and_dotted_extension() {
        let fs = FakeFileSystem::with_file("/a.toml", "[cache]\nmax_attempts = 0\n");
        let overrides = CliOverrides {
            config_path: Some(PathBuf::from("/a.toml")),
            ..CliOverrides::default()
        };
        let err = load_config(&overrides, &fs).expect_err("zero attempts");
        assert!(err.to_string().contains("max_attempts"));

        let fs = FakeFileSystem::with_file("/b.toml", "[log_format]\npayload_extension = \".mcap\"\n");
        let overrides = CliOverrides {
            config_path: Some(PathBuf::from("/b.toml")),
            ..CliOverrides::default()
        };
        assert!(load_config(&overrides, &fs).is_err());
    }

    #[test]
    fn store_urls_must_be_http() {
        let fs = FakeFileSystem::with_file(
            "/s.toml",
            "[stores.bags]\nkind = \"s3\"\nendpoint_url = \"minio:9000\"\n",
        );
        let overrides = CliOverrides {
            config_path: Some(PathBuf::from("/s.toml")),
            ..CliOverrides::default()
        };
        let err = load_config(&overrides, &fs).expect_err("bare endpoint");
        assert!(err.to_string().contains("stores.bags.endpoint_url must be an http(s) url"));
    }

    #[test]
    fn unknown_sections_are_parse_errors() {
        let fs = FakeFileSystem::with_file("/c.toml", "[orchestrator]\nparallelism = 2\n");
        let overrides = CliOverrides {
            config_path: Some(PathBuf::from("/c.toml")),
            ..CliOverrides::default()
        };
        let err = load_config(&overrides, &fs).expect_err("unknown section");
        assert!(matches!(err, ReplayError::ConfigParse(_)));
    }

    #[test]
    fn ci_env_selects_ci_results_dir() {
        let fs = FakeFileSystem::default();
        let mut env = EnvMap::new();
        env.insert("CI".to_string(), "true".to_string());
        let root = resolve_results_root(&HarnessConfig::default(), &env, Path::new("/work"), &fs);
        assert_eq!(root, PathBuf::from("/work/test_results/replay_testing"));
    }

    #[test]
    fn unwritable_results_root_falls_back() {
        let fs = FakeFileSystem::default();
        fs.set_fail_next(ReplayError::Io("read-only".to_string()));
        let mut cfg = HarnessConfig::default();
        cfg.paths.results_root = Some(PathBuf::from("/readonly/results"));
        let root = resolve_results_root(&cfg, &EnvMap::new(), Path::new("/work"), &fs);
        assert_eq!(root, PathBuf::from("/work/test_results/replay_testing"));
    }

    #[test]
    fn env_file_skips_comments_and_strips_quotes() {
        let vars = parse_env_file(
            "# credentials\n\nNEXUS_USER=\"robot\"\nNEXUS_PASSWORD='s3cr=t'\nnot a pair\nPLAIN = value \n",
        );
        assert_eq!(vars.get("NEXUS_USER").map(String::as_str), Some("robot"));
        assert_eq!(vars.get("NEXUS_PASSWORD").map(String::as_str), Some("s3cr=t"));
        assert_eq!(vars.get("PLAIN").map(String::as_str), Some("value"));
        assert_eq!(vars.len(), 3);
    }

    #[test]
    fn layered_env_prefers_overlay() {
        let base = EnvMap::from([
            ("PATH".to_string(), "/usr/bin".to_string()),
            ("HOME".to_string(), "/home/ci".to_string()),
        ]);
        let overlay = EnvMap::from([("PATH".to_string(), "/overlay/bin".to_string())]);
        let env = layered_env(&base, &overlay);
        assert_eq!(env.get("PATH").map(String::as_str), Some("/overlay/bin"));
        assert_eq!(env.get("HOME").map(String::as_str), Some("/home/ci"));
    }
}
