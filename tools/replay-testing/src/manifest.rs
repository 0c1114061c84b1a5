use crate::cache::ContentCache;
use crate::definition::{
    AnalysisCase, CaseError, CaseResult, CaseSuite, FixturesHandler, RunHandler, RunParameter,
    RunnerSettings, TestDefinition,
};
use crate::errors::ReplayError;
use crate::fixtures::{FixtureSource, LocalFixture, StoreFixture};
use crate::message_log::{FilterMode, LogReader};
use crate::process_group::{LaunchDescription, ProcessSpec};
use crate::runtime::FileSystem;
use crate::store::StoreRegistry;
use crate::types::EnvMap;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TestManifest {
    pub name: Option<String>,
    pub fixtures: FixturesSection,
    #[serde(default)]
    pub run: RunSection,
    pub analyze: AnalyzeSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FixturesSection {
    pub required_input_topics: Vec<String>,
    pub expected_output_topics: Vec<String>,
    #[serde(default)]
    pub filter_mode: FilterMode,
    #[serde(default)]
    pub sources: Vec<SourceEntry>,
}

/// Either `path` (local file) or `store` + `key`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceEntry {
    pub path: Option<PathBuf>,
    pub store: Option<String>,
    pub key: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct RunSection {
    #[serde(default)]
    pub parameters: Vec<ParameterEntry>,
    #[serde(default)]
    pub processes: Vec<ProcessEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ParameterEntry {
    pub name: String,
    #[serde(default)]
    pub params: BTreeMap<String, Value>,
    #[serde(default)]
    pub use_sim_clock: bool,
    #[serde(default = "default_playback_rate")]
    pub playback_rate: f64,
    #[serde(default)]
    pub player_args: Vec<String>,
}

fn default_playback_rate() -> f64 {
    1.0
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProcessEntry {
    pub name: String,
    pub command: Vec<String>,
    #[serde(default)]
    pub env: EnvMap,
    pub cwd: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AnalyzeSection {
    pub suite: Option<String>,
    #[serde(default)]
    pub checks: Vec<CheckEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CheckEntry {
    pub name: String,
    pub topic: Option<String>,
    pub min_count: Option<usize>,
    pub max_count: Option<usize>,
    pub first_topic: Option<String>,
}

pub struct ManifestContext<'a> {
    pub fs: &'a dyn FileSystem,
    pub stores: &'a StoreRegistry,
    pub cache: Arc<ContentCache>,
}

pub fn parse_manifest(contents: &str, origin: &Path) -> Result<TestManifest, ReplayError> {
    toml::from_str(contents)
        .map_err(|e| ReplayError::ConfigParse(format!("{}: {e}", origin.display())))
}

/// Reads a TOML test file into a [`TestDefinition`]. Relative paths resolve
/// against the file's directory; the name defaults to the file stem.
pub fn load_test_definition(
    path: &Path,
    ctx: &ManifestContext<'_>,
) -> Result<TestDefinition, ReplayError> {
    let contents = ctx.fs.read_to_string(path)?;
    let manifest = parse_manifest(&contents, path)?;
    let base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
    let default_name = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_else(|| "replay_test".to_string());
    build_definition(manifest, &base_dir, &default_name, ctx)
}

pub fn build_definition(
    manifest: TestManifest,
    base_dir: &Path,
    default_name: &str,
    ctx: &ManifestContext<'_>,
) -> Result<TestDefinition, ReplayError> {
    let name = manifest.name.unwrap_or_else(|| default_name.to_string());

    let mut fixtures = FixturesHandler::new(
        manifest.fixtures.required_input_topics,
        manifest.fixtures.expected_output_topics,
    )
    .with_filter_mode(manifest.fixtures.filter_mode);
    for (index, entry) in manifest.fixtures.sources.into_iter().enumerate() {
        fixtures = fixtures.with_source(build_source(index, entry, base_dir, ctx)?);
    }

    let run = ManifestRun::new(manifest.run, base_dir)?;

    let suite_name = manifest.analyze.suite.unwrap_or_else(|| format!("{name}_checks"));
    let mut suite = CaseSuite::new(suite_name);
    for check in manifest.analyze.checks {
        suite = suite.with_case(build_check(check)?);
    }

    Ok(TestDefinition::new(name)
        .fixtures(fixtures)
        .run(Arc::new(run))
        .analyze(Arc::new(suite)))
}

fn build_source(
    index: usize,
    entry: SourceEntry,
    base_dir: &Path,
    ctx: &ManifestContext<'_>,
) -> Result<Arc<dyn FixtureSource>, ReplayError> {
    match (entry.path, entry.store, entry.key) {
        (Some(path), None, None) => {
            let path = if path.is_absolute() {
                path
            } else {
                base_dir.join(path)
            };
            Ok(Arc::new(LocalFixture::new(path)))
        }
        (None, Some(store_id), Some(key)) => {
            let store = ctx.stores.get(&store_id).ok_or_else(|| {
                ReplayError::Configuration(format!(
                    "fixtures.sources[{index}] references undeclared store `{store_id}`"
                ))
            })?;
            Ok(Arc::new(StoreFixture::new(
                Arc::clone(store),
                key,
                Arc::clone(&ctx.cache),
            )))
        }
        _ => Err(ReplayError::Configuration(format!(
            "fixtures.sources[{index}] needs either `path` or both `store` and `key`"
        ))),
    }
}

/// Run handler backed by `[run]` in a test file.
#[derive(Debug, Clone)]
pub struct ManifestRun {
    parameters: Vec<RunParameter>,
    processes: Vec<ProcessEntry>,
    base_dir: PathBuf,
}

impl ManifestRun {
    pub fn new(section: RunSection, base_dir: &Path) -> Result<Self, ReplayError> {
        for process in &section.processes {
            if process.command.is_empty() {
                return Err(ReplayError::Configuration(format!(
                    "run.processes `{}` has an empty command",
                    process.name
                )));
            }
        }
        let parameters = if section.parameters.is_empty() {
            RunParameter::default_set(BTreeMap::new())
        } else {
            section
                .parameters
                .into_iter()
                .map(|entry| -> Result<RunParameter, ReplayError> {
                    let parameter = RunParameter::new(entry.name)
                        .with_settings(RunnerSettings {
                            use_sim_clock: entry.use_sim_clock,
                            playback_rate: entry.playback_rate,
                        });
                    let parameter = RunParameter {
                        params: entry.params,
                        ..parameter
                    };
                    let player_args = entry
                        .player_args
                        .iter()
                        .map(|arg| substitute_params(arg, &parameter))
                        .collect::<Result<Vec<_>, _>>()?;
                    Ok(parameter.with_player_args(player_args))
                })
                .collect::<Result<Vec<_>, ReplayError>>()?
        };
        Ok(Self {
            parameters,
            processes: section.processes,
            base_dir: base_dir.to_path_buf(),
        })
    }
}

impl RunHandler for ManifestRun {
    fn parameters(&self) -> Vec<RunParameter> {
        self.parameters.clone()
    }

    fn launch_description(&self, parameter: &RunParameter) -> Result<LaunchDescription, ReplayError> {
        let mut description = LaunchDescription::new();
        for process in &self.processes {
            let argv = process
                .command
                .iter()
                .map(|arg| substitute_params(arg, parameter))
                .collect::<Result<Vec<_>, _>>()?;
            let mut spec = ProcessSpec::from_argv(&argv)?;
            for (key, value) in &process.env {
                spec.env
                    .insert(key.clone(), substitute_params(value, parameter)?);
            }
            spec.cwd = process.cwd.as_ref().map(|cwd| {
                if cwd.is_absolute() {
                    cwd.clone()
                } else {
                    self.base_dir.join(cwd)
                }
            });
            description = description.with_process(&process.name, spec);
        }
        Ok(description)
    }
}

/// Replaces every `{params.KEY}` in `template`. Unknown keys are an error.
pub fn substitute_params(template: &str, parameter: &RunParameter) -> Result<String, ReplayError> {
    const OPEN: &str = "{params.";
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find(OPEN) {
        out.push_str(&rest[..start]);
        let after = &rest[start + OPEN.len()..];
        let end = after.find('}').ok_or_else(|| {
            ReplayError::Configuration(format!("unterminated placeholder in `{template}`"))
        })?;
        let key = &after[..end];
        let value = parameter.param_text(key).ok_or_else(|| {
            ReplayError::Configuration(format!(
                "run parameter `{}` has no value for `{key}`",
                parameter.name
            ))
        })?;
        out.push_str(&value);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

fn build_check(entry: CheckEntry) -> Result<AnalysisCase, ReplayError> {
    let counts = entry.min_count.is_some() || entry.max_count.is_some();
    if !counts && entry.first_topic.is_none() {
        return Err(ReplayError::Configuration(format!(
            "analyze.checks `{}` asserts nothing",
            entry.name
        )));
    }
    if counts && entry.topic.is_none() {
        return Err(ReplayError::Configuration(format!(
            "analyze.checks `{}` needs `topic` for count assertions",
            entry.name
        )));
    }

    let CheckEntry {
        name,
        topic,
        min_count,
        max_count,
        first_topic,
    } = entry;
    Ok(AnalysisCase::new(name, move |reader: &mut dyn LogReader| {
        run_check(reader, topic.as_deref(), min_count, max_count, first_topic.as_deref())
    }))
}

fn run_check(
    reader: &mut dyn LogReader,
    topic: Option<&str>,
    min_count: Option<usize>,
    max_count: Option<usize>,
    first_topic: Option<&str>,
) -> CaseResult {
    let mut count = 0usize;
    let mut first = None;
    while let Some(message) = reader.next_message()? {
        if first.is_none() {
            first = Some(message.topic.clone());
        }
        if Some(message.topic.as_str()) == topic {
            count += 1;
        }
    }

    let topic = topic.unwrap_or_default();
    if let Some(min) = min_count {
        if count < min {
            return Err(CaseError::assertion(format!(
                "expected at least {min} messages on {topic}, found {count}"
            )));
        }
    }
    if let Some(max) = max_count {
        if count > max {
            return Err(CaseError::assertion(format!(
                "expected at most {max} messages on {topic}, found {count}"
            )));
        }
    }
    if let Some(expected) = first_topic {
        if first.as_deref() != Some(expected) {
            return Err(CaseError::assertion(format!(
                "expected first message on {expected}, found {}",
                first.as_deref().unwrap_or("<empty log>")
            )));
        }
    }
    Ok(())
}
