use crate::definition::{AnalysisSuite, CaseError};
use crate::logging::append_run_log;
use crate::message_log::MessageLogFormat;
use crate::replay_fixture::ReplayFixture;
use serde_json::json;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;

const NO_RUNS: &str = "no_runs";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaseOutcome {
    Passed,
    /// Assertion not met.
    Failed(String),
    /// The check could not run to completion.
    Errored(String),
}

impl CaseOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Passed => "PASSED",
            Self::Failed(_) => "FAILED",
            Self::Errored(_) => "ERROR",
        }
    }

    pub fn diagnostic(&self) -> Option<&str> {
        match self {
            Self::Passed => None,
            Self::Failed(text) | Self::Errored(text) => Some(text),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaseRecord {
    pub name: String,
    pub outcome: CaseOutcome,
}

/// Every case of one suite executed against one run artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub fixture_key: String,
    pub run_name: String,
    pub suite_name: String,
    pub run_artifact: PathBuf,
    pub filtered_artifact: Option<PathBuf>,
    pub cases: Vec<CaseRecord>,
}

impl RunOutcome {
    pub fn passed(&self) -> usize {
        self.count(|o| matches!(o, CaseOutcome::Passed))
    }

    pub fn failures(&self) -> usize {
        self.count(|o| matches!(o, CaseOutcome::Failed(_)))
    }

    pub fn errors(&self) -> usize {
        self.count(|o| matches!(o, CaseOutcome::Errored(_)))
    }

    fn count(&self, pred: impl Fn(&CaseOutcome) -> bool) -> usize {
        self.cases.iter().filter(|c| pred(&c.outcome)).count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixtureResults {
    pub key: String,
    pub runs: Vec<RunOutcome>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AggregatedResults {
    pub fixtures: Vec<FixtureResults>,
}

impl AggregatedResults {
    pub fn runs(&self) -> impl Iterator<Item = &RunOutcome> {
        self.fixtures.iter().flat_map(|f| f.runs.iter())
    }

    pub fn total_tests(&self) -> usize {
        self.runs().map(|r| r.cases.len()).sum()
    }

    pub fn total_failures(&self) -> usize {
        self.runs().map(RunOutcome::failures).sum()
    }

    pub fn total_errors(&self) -> usize {
        self.runs().map(RunOutcome::errors).sum()
    }

    pub fn successful(&self) -> bool {
        self.total_failures() == 0 && self.total_errors() == 0
    }
}

/// Runs `suite` over every run artifact of every fixture. Each case gets
/// its own reader; case failures never stop the sweep.
pub fn analyze_fixtures(
    fixtures: &[ReplayFixture],
    suite: &dyn AnalysisSuite,
    format: &dyn MessageLogFormat,
) -> AggregatedResults {
    let mut results = AggregatedResults::default();
    for fixture in fixtures {
        if fixture.run_artifacts.is_empty() {
            append_run_log(
                "warn",
                "analysis.fixture.no_runs",
                json!({"fixture": fixture.key}),
            );
            results.fixtures.push(FixtureResults {
                key: fixture.key.clone(),
                runs: vec![missing_runs(fixture, suite)],
            });
            continue;
        }
        let runs = fixture
            .run_artifacts
            .iter()
            .map(|artifact| RunOutcome {
                fixture_key: fixture.key.clone(),
                run_name: artifact.run_name.clone(),
                suite_name: suite.suite_name().to_string(),
                run_artifact: artifact.path.clone(),
                filtered_artifact: fixture.filtered_artifact.clone(),
                cases: run_suite(suite, format, &artifact.path),
            })
            .inspect(|run| {
                append_run_log(
                    "info",
                    "analysis.run.completed",
                    json!({
                        "fixture": run.fixture_key,
                        "run": run.run_name,
                        "passed": run.passed(),
                        "failures": run.failures(),
                        "errors": run.errors(),
                    }),
                );
            })
            .collect();
        results.fixtures.push(FixtureResults {
            key: fixture.key.clone(),
            runs,
        });
    }
    results
}

/// Stand-in outcome for a fixture with nothing to analyze, so an empty
/// results directory never reports success.
fn missing_runs(fixture: &ReplayFixture, suite: &dyn AnalysisSuite) -> RunOutcome {
    let runs_dir = fixture.runs_dir();
    RunOutcome {
        fixture_key: fixture.key.clone(),
        run_name: NO_RUNS.to_string(),
        suite_name: suite.suite_name().to_string(),
        run_artifact: runs_dir.clone(),
        filtered_artifact: fixture.filtered_artifact.clone(),
        cases: vec![CaseRecord {
            name: NO_RUNS.to_string(),
            outcome: CaseOutcome::Errored(format!(
                "fixture `{}` has no run artifacts under {}",
                fixture.key,
                runs_dir.display()
            )),
        }],
    }
}

fn run_suite(
    suite: &dyn AnalysisSuite,
    format: &dyn MessageLogFormat,
    artifact: &std::path::Path,
) -> Vec<CaseRecord> {
    suite
        .cases()
        .into_iter()
        .map(|case| {
            let outcome = match format.open_reader(artifact) {
                Err(err) => CaseOutcome::Errored(err.to_string()),
                Ok(mut reader) => {
                    match catch_unwind(AssertUnwindSafe(|| case.execute(reader.as_mut()))) {
                        Ok(Ok(())) => CaseOutcome::Passed,
                        Ok(Err(CaseError::Assertion(text))) => CaseOutcome::Failed(text),
                        Ok(Err(CaseError::Unexpected(text))) => CaseOutcome::Errored(text),
                        Err(payload) => CaseOutcome::Failed(panic_text(payload.as_ref())),
                    }
                }
            };
            CaseRecord {
                name: case.name.clone(),
                outcome,
            }
        })
        .collect()
}

fn panic_text(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "check panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{CaseResult, CaseSuite};
    use crate::errors::ReplayError;
    use crate::message_log::tests::write_log;
    use crate::message_log::{JsonlFormat, LogReader};
    use crate::replay_fixture::RunArtifact;

    fn fixture_with_run(dir: &std::path::Path, key: &str) -> ReplayFixture {
        let mut fixture = ReplayFixture::create(dir, key).expect("fixture");
        let path = dir.join(format!("{key}.jsonl"));
        write_log(&path, &["/out"], &[("/out", 1)]);
        fixture.run_artifacts.push(RunArtifact {
            run_name: "default".to_string(),
            path,
        });
        fixture
    }

    #[test]
    fn classifies_pass_failure_error_and_panic() {
        let dir = tempfile::tempdir().expect("tempdir");
        let fixtures = vec![fixture_with_run(dir.path(), "a")];
        let suite = CaseSuite::new("mixed")
            .case("passes", |_| Ok(()))
            .case("asserts", |_| Err(CaseError::assertion("no /out")))
            .case("breaks", |_| Err(ReplayError::MessageLog("bad line".to_string()).into()))
            .case("panics", |_| panic!("boom"));

        let results = analyze_fixtures(&fixtures, &suite, &JsonlFormat::default());
        let run = &results.fixtures[0].runs[0];
        let labels: Vec<_> = run.cases.iter().map(|c| c.outcome.label()).collect();
        assert_eq!(labels, vec!["PASSED", "FAILED", "ERROR", "FAILED"]);
        assert_eq!(run.cases[3].outcome.diagnostic(), Some("boom"));
        assert_eq!(results.total_tests(), 4);
        assert_eq!(results.total_failures(), 2);
        assert_eq!(results.total_errors(), 1);
        assert!(!results.successful());
    }

    #[test]
    fn each_case_reads_from_the_start() {
        let dir = tempfile::tempdir().expect("tempdir");
        let fixtures = vec![fixture_with_run(dir.path(), "a")];
        let drain = |reader: &mut dyn LogReader| -> CaseResult {
            let mut n = 0;
            while reader.next_message()?.is_some() {
                n += 1;
            }
            if n == 1 {
                Ok(())
            } else {
                Err(CaseError::assertion(format!("saw {n} messages")))
            }
        };
        let suite = CaseSuite::new("twice").case("first", drain).case("second", drain);
        let results = analyze_fixtures(&fixtures, &suite, &JsonlFormat::default());
        assert!(results.successful());
        assert_eq!(results.total_tests(), 2);
    }

    #[test]
    fn fixture_without_runs_counts_as_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let empty = ReplayFixture::create(dir.path(), "empty").expect("fixture");
        let suite = CaseSuite::new("s").case("c", |_| Ok(()));

        let results = analyze_fixtures(&[empty], &suite, &JsonlFormat::default());
        assert_eq!(results.total_tests(), 1);
        assert_eq!(results.total_errors(), 1);
        assert!(!results.successful());
        let run = &results.fixtures[0].runs[0];
        assert_eq!(run.run_name, "no_runs");
        assert!(run.cases[0]
            .outcome
            .diagnostic()
            .is_some_and(|text| text.contains("fixture `empty` has no run artifacts")));
    }

    #[test]
    fn unreadable_artifact_is_an_error_not_a_failure() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut fixture = ReplayFixture::create(dir.path(), "gone").expect("fixture");
        fixture.run_artifacts.push(RunArtifact {
            run_name: "default".to_string(),
            path: dir.path().join("missing.jsonl"),
        });
        let suite = CaseSuite::new("s").case("c", |_| Ok(()));
        let results = analyze_fixtures(&[fixture], &suite, &JsonlFormat::default());
        assert_eq!(results.total_errors(), 1);
        assert_eq!(results.total_failures(), 0);
    }
}
