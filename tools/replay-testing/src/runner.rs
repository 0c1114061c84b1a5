use crate::analysis::{analyze_fixtures, AggregatedResults};
use crate::config::{PlayerConfig, RecorderConfig};
use crate::definition::{
    validate_parameters, AnalysisSuite, FixturesHandler, RunHandler, TestDefinition,
};
use crate::errors::ReplayError;
use crate::fsm::FixtureState;
use crate::logging::{append_run_log, stage_banner};
use crate::message_log::{list_topics, MessageLogFormat};
use crate::process_group::{compose_run_group, player_process, recorder_process, ProcessGroup};
use crate::replay_fixture::{reconstruct_fixtures, ReplayFixture};
use crate::runtime::Terminal;
use crate::topics;
use crate::types::{EnvMap, RunIdentity, TestPhase};
use serde_json::json;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Invocation {
    /// fixtures -> run -> analyze under a fresh identity.
    Full,
    /// Analyze fixtures left behind by an earlier identity.
    AnalyzeOnly,
}

pub struct RunnerOptions {
    pub results_root: PathBuf,
    pub run_id: RunIdentity,
    pub format: Arc<dyn MessageLogFormat>,
    pub process_group: Arc<dyn ProcessGroup>,
    pub recorder: RecorderConfig,
    pub player: PlayerConfig,
    pub env: EnvMap,
    pub terminal: Arc<dyn Terminal>,
}

/// Drives one test definition through its phases, one fixture and one run
/// parameter at a time.
pub struct ReplayTestingRunner {
    run_id: RunIdentity,
    results_dir: PathBuf,
    format: Arc<dyn MessageLogFormat>,
    process_group: Arc<dyn ProcessGroup>,
    recorder: RecorderConfig,
    player: PlayerConfig,
    env: EnvMap,
    terminal: Arc<dyn Terminal>,
    fixtures: Vec<ReplayFixture>,
}

impl ReplayTestingRunner {
    pub fn new(options: RunnerOptions) -> Self {
        let results_dir = options.results_root.join(options.run_id.to_string());
        Self {
            run_id: options.run_id,
            results_dir,
            format: options.format,
            process_group: options.process_group,
            recorder: options.recorder,
            player: options.player,
            env: options.env,
            terminal: options.terminal,
            fixtures: Vec::new(),
        }
    }

    pub fn run_id(&self) -> RunIdentity {
        self.run_id
    }

    pub fn results_dir(&self) -> &Path {
        &self.results_dir
    }

    pub fn fixtures(&self) -> &[ReplayFixture] {
        &self.fixtures
    }

    /// Runs the phases `invocation` calls for. All handlers are resolved
    /// before anything touches the disk.
    pub fn execute(
        &mut self,
        definition: &TestDefinition,
        invocation: Invocation,
    ) -> Result<AggregatedResults, ReplayError> {
        append_run_log(
            "info",
            "runner.started",
            json!({
                "test": definition.name(),
                "run_id": self.run_id.to_string(),
                "invocation": format!("{invocation:?}"),
                "results_dir": self.results_dir.display().to_string(),
            }),
        );

        match invocation {
            Invocation::Full => {
                let phases = definition.resolve_all()?;
                self.stage(TestPhase::Fixtures, |runner| runner.filter_fixtures(phases.fixtures))?;
                self.stage(TestPhase::Run, |runner| runner.run(phases.run.as_ref()))?;
                self.stage(TestPhase::Analyze, |runner| Ok(runner.analyze(phases.analyze.as_ref())))
            }
            Invocation::AnalyzeOnly => {
                let suite = definition.resolve_analyze()?;
                self.reconstruct()?;
                if let Ok(run) = definition.resolve_run() {
                    let declared: Vec<String> =
                        run.parameters().into_iter().map(|p| p.name).collect();
                    for fixture in &mut self.fixtures {
                        fixture.order_runs(&declared);
                    }
                }
                self.stage(TestPhase::Analyze, |runner| Ok(runner.analyze(suite.as_ref())))
            }
        }
    }

    fn stage<T>(
        &mut self,
        phase: TestPhase,
        body: impl FnOnce(&mut Self) -> Result<T, ReplayError>,
    ) -> Result<T, ReplayError> {
        self.terminal
            .write_line(&stage_banner(phase.banner_name(), true))?;
        let value = body(self).map_err(|err| err.in_phase(phase, None))?;
        self.terminal
            .write_line(&stage_banner(phase.banner_name(), false))?;
        Ok(value)
    }

    /// Acquires, validates and filters every fixture. Duplicate keys are
    /// rejected before the first download; any failure aborts the batch.
    pub fn filter_fixtures(&mut self, handler: &FixturesHandler) -> Result<(), ReplayError> {
        let mut seen = BTreeSet::new();
        for source in &handler.sources {
            let key = source.fixture_key();
            if !seen.insert(key.clone()) {
                return Err(ReplayError::Configuration(format!(
                    "duplicate fixture key `{key}` ({})",
                    source.describe()
                )));
            }
        }

        std::fs::create_dir_all(&self.results_dir)
            .map_err(|e| ReplayError::Io(format!("{}: {e}", self.results_dir.display())))?;

        for source in &handler.sources {
            let mut fixture = ReplayFixture::create(&self.results_dir, &source.fixture_key())?;
            let prepared = self.prepare_fixture(&mut fixture, source.as_ref(), handler);
            if let Err(err) = prepared {
                fixture.progress.fail(err.to_string());
                append_run_log(
                    "error",
                    "fixture.failed",
                    json!({"fixture": fixture.key, "state": fixture.progress.state.as_str(), "error": err.to_string()}),
                );
                return Err(err.in_phase(TestPhase::Fixtures, Some(&fixture.key)));
            }
            self.fixtures.push(fixture);
        }
        Ok(())
    }

    fn prepare_fixture(
        &self,
        fixture: &mut ReplayFixture,
        source: &dyn crate::fixtures::FixtureSource,
        handler: &FixturesHandler,
    ) -> Result<(), ReplayError> {
        fixture.progress.transition(FixtureState::Downloading)?;
        let input = fixture.download_input(source)?;

        fixture.progress.transition(FixtureState::Validating)?;
        let present = list_topics(self.format.as_ref(), &input)?;
        let required = &handler.required_input_topics;
        topics::validate(&fixture.key, &topics::required_present(&present, required), required)?;

        fixture.progress.transition(FixtureState::Filtered)?;
        fixture.filter_input(
            self.format.as_ref(),
            &handler.expected_output_topics,
            handler.filter_mode,
        )?;
        Ok(())
    }

    /// Executes every run parameter against every fixture, in declaration
    /// order. A fixture that already holds run artifacts is refused.
    pub fn run(&mut self, handler: &dyn RunHandler) -> Result<(), ReplayError> {
        let parameters = handler.parameters();
        validate_parameters(&parameters)?;

        let mut fixtures = std::mem::take(&mut self.fixtures);
        let mut outcome = Ok(());
        for fixture in fixtures.iter_mut() {
            if !fixture.run_artifacts.is_empty() {
                outcome = Err(ReplayError::RunConflict {
                    fixture: fixture.key.clone(),
                }
                .in_phase(TestPhase::Run, Some(&fixture.key)));
                break;
            }
            if let Err(err) = self.run_fixture(fixture, handler, &parameters) {
                fixture.progress.fail(err.to_string());
                outcome = Err(err.in_phase(TestPhase::Run, Some(&fixture.key)));
                break;
            }
        }
        self.fixtures = fixtures;
        outcome
    }

    fn run_fixture(
        &self,
        fixture: &mut ReplayFixture,
        handler: &dyn RunHandler,
        parameters: &[crate::definition::RunParameter],
    ) -> Result<(), ReplayError> {
        let filtered = fixture.filtered_artifact.clone().ok_or_else(|| {
            ReplayError::Configuration(format!(
                "fixture `{}` has no filtered artifact to play back",
                fixture.key
            ))
        })?;

        for parameter in parameters {
            fixture.progress.start_run(&parameter.name)?;
            let destination = fixture.generate_run_artifact(&parameter.name)?;
            append_run_log(
                "info",
                "run.started",
                json!({
                    "fixture": fixture.key,
                    "run": parameter.name,
                    "destination": destination.display().to_string(),
                    "playback_rate": parameter.settings.playback_rate,
                    "use_sim_clock": parameter.settings.use_sim_clock,
                }),
            );

            let test_description = handler.launch_description(parameter)?;
            let group = compose_run_group(
                recorder_process(&self.recorder, &destination)?,
                test_description,
                player_process(
                    &self.player,
                    &filtered,
                    parameter.settings.playback_rate,
                    parameter.settings.use_sim_clock,
                    &parameter.player_args,
                )?,
            );
            let outcome = self.process_group.run(&group, &self.env)?;
            for exit in outcome.exits.iter().filter(|e| e.exit_code != Some(0)) {
                append_run_log(
                    "warn",
                    "run.process.nonzero_exit",
                    json!({"fixture": fixture.key, "run": parameter.name, "process": exit.name, "exit_code": exit.exit_code, "forced": exit.forced}),
                );
            }

            fixture.progress.transition(FixtureState::Collapsing)?;
            let collapsed = fixture.collapse_latest(self.format.payload_extension())?;
            append_run_log(
                "info",
                "run.completed",
                json!({"fixture": fixture.key, "run": parameter.name, "artifact": collapsed.display().to_string()}),
            );
        }
        fixture.progress.transition(FixtureState::Done)?;
        Ok(())
    }

    pub fn analyze(&self, suite: &dyn AnalysisSuite) -> AggregatedResults {
        analyze_fixtures(&self.fixtures, suite, self.format.as_ref())
    }

    /// Loads fixtures from this identity's results directory instead of
    /// acquiring them.
    pub fn reconstruct(&mut self) -> Result<(), ReplayError> {
        self.fixtures = reconstruct_fixtures(&self.results_dir, self.format.payload_extension())?;
        Ok(())
    }
}
