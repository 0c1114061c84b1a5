//! What a replay test declares: where fixtures come from, how each run is
//! launched, and which checks analyze the recorded output.

use crate::errors::ReplayError;
use crate::fixtures::FixtureSource;
use crate::message_log::{FilterMode, LogReader};
use crate::process_group::LaunchDescription;
use crate::types::TestPhase;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

pub const DEFAULT_RUN_NAME: &str = "default";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RunnerSettings {
    pub use_sim_clock: bool,
    pub playback_rate: f64,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            use_sim_clock: false,
            playback_rate: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunParameter {
    pub name: String,
    pub params: BTreeMap<String, Value>,
    pub settings: RunnerSettings,
    /// Appended to the player command for this run only.
    #[serde(default)]
    pub player_args: Vec<String>,
}

impl RunParameter {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: BTreeMap::new(),
            settings: RunnerSettings::default(),
            player_args: Vec::new(),
        }
    }

    pub fn with_param(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }

    pub fn with_settings(mut self, settings: RunnerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_player_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.player_args = args.into_iter().map(Into::into).collect();
        self
    }

    /// The single `default` parameter used when a run declares none.
    pub fn default_set(params: BTreeMap<String, Value>) -> Vec<RunParameter> {
        vec![RunParameter {
            name: DEFAULT_RUN_NAME.to_string(),
            params,
            settings: RunnerSettings::default(),
            player_args: Vec::new(),
        }]
    }

    /// Parameter value as plain text, for command-line substitution.
    pub fn param_text(&self, key: &str) -> Option<String> {
        self.params.get(key).map(|value| match value {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        })
    }
}

/// Rejects empty or ambiguous parameter lists before anything is launched.
pub fn validate_parameters(parameters: &[RunParameter]) -> Result<(), ReplayError> {
    if parameters.is_empty() {
        return Err(ReplayError::Configuration(
            "run handler declared no parameters".to_string(),
        ));
    }
    let mut seen = BTreeSet::new();
    for parameter in parameters {
        if parameter.name.trim().is_empty() {
            return Err(ReplayError::Configuration(
                "run parameter names must not be empty".to_string(),
            ));
        }
        if parameter.name.contains(['/', '\\', '\0']) || parameter.name.contains("..") {
            return Err(ReplayError::Configuration(format!(
                "run parameter `{}` must not contain path separators or `..`",
                parameter.name
            )));
        }
        if !seen.insert(parameter.name.as_str()) {
            return Err(ReplayError::Configuration(format!(
                "duplicate run parameter `{}`",
                parameter.name
            )));
        }
        let rate = parameter.settings.playback_rate;
        if !rate.is_finite() || rate <= 0.0 {
            return Err(ReplayError::Configuration(format!(
                "run parameter `{}` has invalid playback rate {rate}",
                parameter.name
            )));
        }
    }
    Ok(())
}

pub struct FixturesHandler {
    pub sources: Vec<Arc<dyn FixtureSource>>,
    pub required_input_topics: BTreeSet<String>,
    pub expected_output_topics: BTreeSet<String>,
    pub filter_mode: FilterMode,
}

impl FixturesHandler {
    pub fn new<I, J, S, T>(required_input_topics: I, expected_output_topics: J) -> Self
    where
        I: IntoIterator<Item = S>,
        J: IntoIterator<Item = T>,
        S: Into<String>,
        T: Into<String>,
    {
        Self {
            sources: Vec::new(),
            required_input_topics: required_input_topics.into_iter().map(Into::into).collect(),
            expected_output_topics: expected_output_topics.into_iter().map(Into::into).collect(),
            filter_mode: FilterMode::default(),
        }
    }

    pub fn with_source(mut self, source: Arc<dyn FixtureSource>) -> Self {
        self.sources.push(source);
        self
    }

    pub fn with_filter_mode(mut self, mode: FilterMode) -> Self {
        self.filter_mode = mode;
        self
    }
}

impl fmt::Debug for FixturesHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixturesHandler")
            .field(
                "sources",
                &self.sources.iter().map(|s| s.describe()).collect::<Vec<_>>(),
            )
            .field("required_input_topics", &self.required_input_topics)
            .field("expected_output_topics", &self.expected_output_topics)
            .field("filter_mode", &self.filter_mode)
            .finish()
    }
}

pub trait RunHandler: Send + Sync {
    fn parameters(&self) -> Vec<RunParameter>;
    fn launch_description(&self, parameter: &RunParameter) -> Result<LaunchDescription, ReplayError>;
}

/// Adapts a launch builder that does not care about the run parameter.
pub struct ParameterlessRun<F> {
    build: F,
}

impl<F> ParameterlessRun<F>
where
    F: Fn() -> Result<LaunchDescription, ReplayError> + Send + Sync,
{
    pub fn new(build: F) -> Self {
        Self { build }
    }
}

impl<F> RunHandler for ParameterlessRun<F>
where
    F: Fn() -> Result<LaunchDescription, ReplayError> + Send + Sync,
{
    fn parameters(&self) -> Vec<RunParameter> {
        RunParameter::default_set(BTreeMap::new())
    }

    fn launch_description(&self, _parameter: &RunParameter) -> Result<LaunchDescription, ReplayError> {
        (self.build)()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaseError {
    /// The recorded output did not meet an expectation.
    Assertion(String),
    /// The check itself could not complete.
    Unexpected(String),
}

impl CaseError {
    pub fn assertion(message: impl Into<String>) -> Self {
        Self::Assertion(message.into())
    }
}

impl fmt::Display for CaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Assertion(message) | Self::Unexpected(message) => f.write_str(message),
        }
    }
}

impl From<ReplayError> for CaseError {
    fn from(err: ReplayError) -> Self {
        Self::Unexpected(err.to_string())
    }
}

pub type CaseResult = Result<(), CaseError>;

type CheckFn = dyn Fn(&mut dyn LogReader) -> CaseResult + Send + Sync;

#[derive(Clone)]
pub struct AnalysisCase {
    pub name: String,
    check: Arc<CheckFn>,
}

impl AnalysisCase {
    pub fn new<F>(name: impl Into<String>, check: F) -> Self
    where
        F: Fn(&mut dyn LogReader) -> CaseResult + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            check: Arc::new(check),
        }
    }

    pub fn execute(&self, reader: &mut dyn LogReader) -> CaseResult {
        (self.check)(reader)
    }
}

impl fmt::Debug for AnalysisCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnalysisCase").field("name", &self.name).finish()
    }
}

pub trait AnalysisSuite: Send + Sync {
    fn suite_name(&self) -> &str;
    fn cases(&self) -> Vec<AnalysisCase>;
}

/// A suite assembled from individual cases.
#[derive(Debug, Clone)]
pub struct CaseSuite {
    name: String,
    cases: Vec<AnalysisCase>,
}

impl CaseSuite {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cases: Vec::new(),
        }
    }

    pub fn case<F>(mut self, name: &str, check: F) -> Self
    where
        F: Fn(&mut dyn LogReader) -> CaseResult + Send + Sync + 'static,
    {
        self.cases.push(AnalysisCase::new(name, check));
        self
    }

    pub fn with_case(mut self, case: AnalysisCase) -> Self {
        self.cases.push(case);
        self
    }
}

impl AnalysisSuite for CaseSuite {
    fn suite_name(&self) -> &str {
        &self.name
    }

    fn cases(&self) -> Vec<AnalysisCase> {
        self.cases.clone()
    }
}

/// Handlers registered for each phase. Registration only appends; the
/// resolver decides whether the result is usable.
pub struct TestDefinition {
    name: String,
    fixtures: Vec<FixturesHandler>,
    runs: Vec<Arc<dyn RunHandler>>,
    analyses: Vec<Arc<dyn AnalysisSuite>>,
}

impl TestDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fixtures: Vec::new(),
            runs: Vec::new(),
            analyses: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rename(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn fixtures(mut self, handler: FixturesHandler) -> Self {
        self.fixtures.push(handler);
        self
    }

    pub fn run(mut self, handler: Arc<dyn RunHandler>) -> Self {
        self.runs.push(handler);
        self
    }

    pub fn analyze(mut self, suite: Arc<dyn AnalysisSuite>) -> Self {
        self.analyses.push(suite);
        self
    }

    /// Swaps every analysis registration for `suite`.
    pub fn replace_analysis(mut self, suite: Arc<dyn AnalysisSuite>) -> Self {
        self.analyses = vec![suite];
        self
    }

    pub fn resolve_fixtures(&self) -> Result<&FixturesHandler, ReplayError> {
        single(&self.fixtures, TestPhase::Fixtures, &self.name)
    }

    pub fn resolve_run(&self) -> Result<Arc<dyn RunHandler>, ReplayError> {
        single(&self.runs, TestPhase::Run, &self.name).map(Arc::clone)
    }

    pub fn resolve_analyze(&self) -> Result<Arc<dyn AnalysisSuite>, ReplayError> {
        single(&self.analyses, TestPhase::Analyze, &self.name).map(Arc::clone)
    }

    pub fn resolve_phase(&self, phase: TestPhase) -> Result<PhaseHandler<'_>, ReplayError> {
        Ok(match phase {
            TestPhase::Fixtures => PhaseHandler::Fixtures(self.resolve_fixtures()?),
            TestPhase::Run => PhaseHandler::Run(self.resolve_run()?),
            TestPhase::Analyze => PhaseHandler::Analyze(self.resolve_analyze()?),
        })
    }

    /// Resolves all three phases at once.
    pub fn resolve_all(&self) -> Result<ResolvedPhases<'_>, ReplayError> {
        Ok(ResolvedPhases {
            fixtures: self.resolve_fixtures()?,
            run: self.resolve_run()?,
            analyze: self.resolve_analyze()?,
        })
    }
}

pub enum PhaseHandler<'a> {
    Fixtures(&'a FixturesHandler),
    Run(Arc<dyn RunHandler>),
    Analyze(Arc<dyn AnalysisSuite>),
}

impl PhaseHandler<'_> {
    pub fn phase(&self) -> TestPhase {
        match self {
            Self::Fixtures(_) => TestPhase::Fixtures,
            Self::Run(_) => TestPhase::Run,
            Self::Analyze(_) => TestPhase::Analyze,
        }
    }
}

pub struct ResolvedPhases<'a> {
    pub fixtures: &'a FixturesHandler,
    pub run: Arc<dyn RunHandler>,
    pub analyze: Arc<dyn AnalysisSuite>,
}

fn single<'a, T>(items: &'a [T], phase: TestPhase, definition: &str) -> Result<&'a T, ReplayError> {
    match items {
        [only] => Ok(only),
        [] => Err(ReplayError::Configuration(format!(
            "test `{definition}` declares no {} handler",
            phase.as_str()
        ))),
        many => Err(ReplayError::Configuration(format!(
            "test `{definition}` declares {} {} handlers; exactly one is allowed",
            many.len(),
            phase.as_str()
        ))),
    }
}
