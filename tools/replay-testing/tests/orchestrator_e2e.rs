use replay_testing::cache::ContentCache;
use replay_testing::config::HarnessConfig;
use replay_testing::definition::{CaseError, CaseSuite, FixturesHandler, TestDefinition};
use replay_testing::errors::ReplayError;
use replay_testing::fixtures::{FixtureSource, LocalFixture};
use replay_testing::manifest::{load_test_definition, ManifestContext};
use replay_testing::message_log::{ChannelInfo, JsonlFormat, Message, MessageLogFormat};
use replay_testing::process_group::{GroupOutcome, LaunchDescription, ProcessGroup, ProcessRole};
use replay_testing::report::Report;
use replay_testing::runner::{Invocation, ReplayTestingRunner, RunnerOptions};
use replay_testing::runtime::{FakeClock, FakeTerminal, ProductionFileSystem};
use replay_testing::store::StoreRegistry;
use replay_testing::types::{EnvMap, RunIdentity, TestPhase};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, UNIX_EPOCH};

fn write_log(path: &Path, topics: &[&str], messages: &[(&str, u64)]) {
    let format = JsonlFormat::default();
    let mut writer = format.create_writer(path).expect("writer");
    for topic in topics {
        writer
            .write_channel(&ChannelInfo {
                topic: topic.to_string(),
                message_type: "std_msgs/String".to_string(),
            })
            .expect("channel");
    }
    for (topic, ts) in messages {
        writer
            .write_message(&Message {
                topic: topic.to_string(),
                timestamp_ns: *ts,
                data: json!({"seq": ts}),
            })
            .expect("message");
    }
    writer.finish().expect("finish");
}

/// Stands in for recorder + player: records `published` messages on `/out`
/// into whatever destination the recorder was given.
struct ScriptedGroup {
    published: usize,
    launches: Mutex<Vec<LaunchDescription>>,
}

impl ScriptedGroup {
    fn publishing(published: usize) -> Arc<Self> {
        Arc::new(Self {
            published,
            launches: Mutex::new(Vec::new()),
        })
    }

    fn launch_count(&self) -> usize {
        self.launches.lock().expect("launches").len()
    }
}

impl ProcessGroup for ScriptedGroup {
    fn run(&self, description: &LaunchDescription, _env: &EnvMap) -> Result<GroupOutcome, ReplayError> {
        self.launches
            .lock()
            .expect("launches")
            .push(description.clone());
        for process in &description.processes {
            if let ProcessRole::Recorder { destination } = &process.role {
                std::fs::create_dir_all(destination).expect("mkdir destination");
                let messages: Vec<(&str, u64)> =
                    (0..self.published).map(|i| ("/out", i as u64)).collect();
                write_log(&destination.join("recorded_0.jsonl"), &["/out"], &messages);
            }
        }
        Ok(GroupOutcome {
            exits: Vec::new(),
            shutdown_trigger: Some("player".to_string()),
        })
    }
}

/// Local fixture that counts acquisitions.
struct CountingFixture {
    inner: LocalFixture,
    acquired: Arc<AtomicUsize>,
}

impl FixtureSource for CountingFixture {
    fn describe(&self) -> String {
        self.inner.describe()
    }

    fn file_name(&self) -> String {
        self.inner.file_name()
    }

    fn acquire(&self, destination_dir: &Path) -> Result<PathBuf, ReplayError> {
        self.acquired.fetch_add(1, Ordering::SeqCst);
        self.inner.acquire(destination_dir)
    }
}

fn runner(results_root: &Path, run_id: RunIdentity, group: Arc<dyn ProcessGroup>) -> ReplayTestingRunner {
    let cfg = HarnessConfig::default();
    ReplayTestingRunner::new(RunnerOptions {
        results_root: results_root.to_path_buf(),
        run_id,
        format: Arc::new(JsonlFormat::default()),
        process_group: group,
        recorder: cfg.recorder,
        player: cfg.player,
        env: EnvMap::new(),
        terminal: Arc::new(FakeTerminal::default()),
    })
}

fn manifest_definition(dir: &Path, max_count: usize) -> TestDefinition {
    std::fs::create_dir_all(dir.join("bags")).expect("mkdir bags");
    write_log(&dir.join("bags/city.jsonl"), &["/in"], &[("/in", 1), ("/in", 2)]);
    write_log(&dir.join("bags/highway.jsonl"), &["/in"], &[("/in", 3)]);
    let test_file = dir.join("nav_test.toml");
    std::fs::write(
        &test_file,
        format!(
            r#"
[fixtures]
required_input_topics = ["/in"]
expected_output_topics = ["/out"]

[[fixtures.sources]]
path = "bags/city.jsonl"

[[fixtures.sources]]
path = "bags/highway.jsonl"

[[run.parameters]]
name = "realtime"

[[run.parameters]]
name = "double"
playback_rate = 2.0
player_args = ["--qos-profile-overrides-path", "qos.yaml"]

[analyze]
[[analyze.checks]]
name = "out_published"
topic = "/out"
min_count = 1

[[analyze.checks]]
name = "out_bounded"
topic = "/out"
max_count = {max_count}
"#
        ),
    )
    .expect("write test file");

    let fs = ProductionFileSystem;
    let stores = StoreRegistry::new();
    let ctx = ManifestContext {
        fs: &fs,
        stores: &stores,
        cache: Arc::new(ContentCache::new(dir.join("cache"), Arc::new(FakeClock::default()))),
    };
    load_test_definition(&test_file, &ctx).expect("load test file")
}

#[test]
fn passing_pipeline_aggregates_every_fixture_and_parameter() {
    let temp = tempfile::tempdir().expect("tempdir");
    let definition = manifest_definition(temp.path(), 5);
    let group = ScriptedGroup::publishing(2);
    let mut runner = runner(&temp.path().join("results"), RunIdentity::fresh(), group.clone());

    let results = runner
        .execute(&definition, Invocation::Full)
        .expect("pipeline");

    assert_eq!(group.launch_count(), 4);
    assert_eq!(results.fixtures.len(), 2);
    assert_eq!(results.runs().count(), 4);
    assert_eq!(results.total_tests(), 8);
    assert!(results.successful());

    let city = &runner.fixtures()[0];
    assert_eq!(city.key, "city");
    let filtered = city.filtered_artifact.as_ref().expect("filtered");
    assert!(filtered.ends_with("city/filtered.jsonl"));
    let runs: Vec<_> = city.run_artifacts.iter().map(|a| a.path.clone()).collect();
    assert_eq!(
        runs,
        vec![
            runner.results_dir().join("city/runs/run_realtime_city.jsonl"),
            runner.results_dir().join("city/runs/run_double_city.jsonl"),
        ]
    );

    let launches = group.launches.lock().expect("launches");
    let double = &launches[1];
    let player = double.processes.last().expect("player");
    assert!(matches!(player.role, ProcessRole::Player { rate, .. } if rate == 2.0));
    assert!(player
        .spec
        .args
        .ends_with(&["--qos-profile-overrides-path".to_string(), "qos.yaml".to_string()]));
    let plain = launches[0].processes.last().expect("player");
    assert!(!plain.spec.args.iter().any(|arg| arg == "qos.yaml"));
    assert!(double.shutdown_on_exit_of("player"));

    let report = Report::from_results(
        definition.name(),
        &results,
        UNIX_EPOCH + Duration::from_secs(1_700_000_000),
        "ci-host",
    );
    let xml = report.to_junit_xml();
    assert!(xml.contains("nav_test_suite_1"));
    assert!(xml.contains("nav_test_suite_4"));
    assert!(xml.contains(&format!(
        "[[ATTACHMENT|{}]]",
        runner.results_dir().join("highway/runs/run_double_highway.jsonl").display()
    )));
}

#[test]
fn failing_check_is_a_failure_with_diagnostic() {
    let temp = tempfile::tempdir().expect("tempdir");
    let definition = manifest_definition(temp.path(), 0);
    let mut runner = runner(
        &temp.path().join("results"),
        RunIdentity::fresh(),
        ScriptedGroup::publishing(2),
    );

    let results = runner
        .execute(&definition, Invocation::Full)
        .expect("pipeline");
    assert_eq!(results.total_failures(), 4);
    assert_eq!(results.total_errors(), 0);
    assert!(!results.successful());

    let case = results.runs().next().expect("run").cases[1].clone();
    assert_eq!(case.name, "out_bounded");
    assert_eq!(
        case.outcome.diagnostic(),
        Some("expected at most 0 messages on /out, found 2")
    );

    let report = Report::from_results("nav", &results, UNIX_EPOCH, "ci-host");
    assert!(report.to_junit_xml().contains("<failure message=\"expected at most 0 messages"));
}

#[test]
fn duplicate_keys_are_rejected_before_any_acquisition() {
    let temp = tempfile::tempdir().expect("tempdir");
    std::fs::create_dir_all(temp.path().join("a")).expect("mkdir a");
    std::fs::create_dir_all(temp.path().join("b")).expect("mkdir b");
    write_log(&temp.path().join("a/drive.jsonl"), &["/in"], &[("/in", 1)]);
    write_log(&temp.path().join("b/drive.jsonl"), &["/in"], &[("/in", 1)]);

    let acquired = Arc::new(AtomicUsize::new(0));
    let mut handler = FixturesHandler::new(["/in"], ["/out"]);
    for dir in ["a", "b"] {
        handler = handler.with_source(Arc::new(CountingFixture {
            inner: LocalFixture::new(temp.path().join(dir).join("drive.jsonl")),
            acquired: Arc::clone(&acquired),
        }));
    }

    let mut runner = runner(
        &temp.path().join("results"),
        RunIdentity::fresh(),
        ScriptedGroup::publishing(1),
    );
    let err = runner.filter_fixtures(&handler).expect_err("duplicate keys");
    assert!(err.to_string().contains("duplicate fixture key `drive`"));
    assert_eq!(acquired.load(Ordering::SeqCst), 0);
}

#[test]
fn second_run_under_same_identity_is_a_conflict() {
    let temp = tempfile::tempdir().expect("tempdir");
    let definition = manifest_definition(temp.path(), 5);
    let group = ScriptedGroup::publishing(1);
    let mut runner = runner(&temp.path().join("results"), RunIdentity::fresh(), group.clone());
    runner
        .execute(&definition, Invocation::Full)
        .expect("first pipeline");

    let run = definition.resolve_run().expect("run handler");
    let err = runner.run(run.as_ref()).expect_err("conflict");
    assert!(matches!(
        err,
        ReplayError::Phase {
            phase: TestPhase::Run,
            ..
        }
    ));
    assert!(matches!(err.root(), ReplayError::RunConflict { fixture } if fixture == "city"));
    assert_eq!(group.launch_count(), 4);
    assert_eq!(runner.fixtures()[0].run_artifacts.len(), 2);
}

#[test]
fn analyze_only_reuses_artifacts_with_a_new_suite() {
    let temp = tempfile::tempdir().expect("tempdir");
    let results_root = temp.path().join("results");
    let acquired = Arc::new(AtomicUsize::new(0));
    write_log(&temp.path().join("drive.jsonl"), &["/in"], &[("/in", 1)]);
    let handler = FixturesHandler::new(["/in"], ["/out"]).with_source(Arc::new(CountingFixture {
        inner: LocalFixture::new(temp.path().join("drive.jsonl")),
        acquired: Arc::clone(&acquired),
    }));
    let definition = TestDefinition::new("nav")
        .fixtures(handler)
        .run(Arc::new(replay_testing::definition::ParameterlessRun::new(|| {
            Ok(LaunchDescription::new())
        })))
        .analyze(Arc::new(CaseSuite::new("strict").case("never", |_| {
            Err(CaseError::assertion("strict suite rejects everything"))
        })));

    let group = ScriptedGroup::publishing(3);
    let run_id = RunIdentity::fresh();
    let mut first = runner(&results_root, run_id, group.clone());
    let first_results = first
        .execute(&definition, Invocation::Full)
        .expect("full pipeline");
    assert_eq!(first_results.total_failures(), 1);

    let counting_suite = CaseSuite::new("lenient").case("three_messages", |reader| {
        let mut seen = 0;
        while reader.next_message()?.is_some() {
            seen += 1;
        }
        if seen == 3 {
            Ok(())
        } else {
            Err(CaseError::assertion(format!("saw {seen}")))
        }
    });
    let revised = definition.replace_analysis(Arc::new(counting_suite));
    let mut second = runner(&results_root, run_id, group.clone());
    let results = second
        .execute(&revised, Invocation::AnalyzeOnly)
        .expect("analyze only");

    assert!(results.successful());
    assert_eq!(results.runs().next().expect("run").suite_name, "lenient");
    assert_eq!(acquired.load(Ordering::SeqCst), 1);
    assert_eq!(group.launch_count(), 1);
    let reconstructed = &second.fixtures()[0];
    assert_eq!(reconstructed.key, "drive");
    assert!(reconstructed.filtered_artifact.is_some());
}

#[test]
fn missing_required_topic_stops_before_running() {
    let temp = tempfile::tempdir().expect("tempdir");
    write_log(&temp.path().join("drive.jsonl"), &["/other"], &[("/other", 1)]);
    let definition = TestDefinition::new("nav")
        .fixtures(
            FixturesHandler::new(["/in"], ["/out"])
                .with_source(Arc::new(LocalFixture::new(temp.path().join("drive.jsonl")))),
        )
        .run(Arc::new(replay_testing::definition::ParameterlessRun::new(|| {
            Ok(LaunchDescription::new())
        })))
        .analyze(Arc::new(CaseSuite::new("s")));

    let group = ScriptedGroup::publishing(1);
    let mut runner = runner(&temp.path().join("results"), RunIdentity::fresh(), group.clone());
    let err = runner
        .execute(&definition, Invocation::Full)
        .expect_err("validation");
    match err.root() {
        ReplayError::Validation { missing, extra, .. } => {
            assert_eq!(missing, &vec!["/in".to_string()]);
            assert!(extra.is_empty());
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(group.launch_count(), 0);
}
