use crate::analysis::{AggregatedResults, CaseOutcome};
use crate::errors::ReplayError;
use crate::runtime::{ProcessRequest, ProcessRunner};
use crate::types::EnvMap;
use chrono::{DateTime, SecondsFormat, Utc};
use crossterm::style::Stylize;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

pub const REPORT_FILE_NAME: &str = "results.xml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportCase {
    pub name: String,
    pub classname: String,
    pub outcome: CaseOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportSuite {
    pub name: String,
    pub fixture_key: String,
    pub run_artifact: PathBuf,
    pub filtered_artifact: Option<PathBuf>,
    pub cases: Vec<ReportCase>,
}

impl ReportSuite {
    pub fn tests(&self) -> usize {
        self.cases.len()
    }

    pub fn failures(&self) -> usize {
        self.cases
            .iter()
            .filter(|c| matches!(c.outcome, CaseOutcome::Failed(_)))
            .count()
    }

    pub fn errors(&self) -> usize {
        self.cases
            .iter()
            .filter(|c| matches!(c.outcome, CaseOutcome::Errored(_)))
            .count()
    }
}

/// One report per invocation. The XML file and the console narration are
/// both rendered from this value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    pub name: String,
    pub timestamp: String,
    pub hostname: String,
    pub suites: Vec<ReportSuite>,
}

impl Report {
    pub fn from_results(
        name: &str,
        results: &AggregatedResults,
        generated_at: SystemTime,
        hostname: &str,
    ) -> Self {
        let suites = results
            .runs()
            .enumerate()
            .map(|(index, run)| ReportSuite {
                name: format!("{name}_suite_{}", index + 1),
                fixture_key: run.fixture_key.clone(),
                run_artifact: run.run_artifact.clone(),
                filtered_artifact: run.filtered_artifact.clone(),
                cases: run
                    .cases
                    .iter()
                    .map(|case| ReportCase {
                        name: case.name.clone(),
                        classname: run.suite_name.clone(),
                        outcome: case.outcome.clone(),
                    })
                    .collect(),
            })
            .collect();
        Self {
            name: name.to_string(),
            timestamp: render_timestamp(generated_at),
            hostname: hostname.to_string(),
            suites,
        }
    }

    pub fn tests(&self) -> usize {
        self.suites.iter().map(ReportSuite::tests).sum()
    }

    pub fn failures(&self) -> usize {
        self.suites.iter().map(ReportSuite::failures).sum()
    }

    pub fn errors(&self) -> usize {
        self.suites.iter().map(ReportSuite::errors).sum()
    }

    pub fn successful(&self) -> bool {
        self.failures() == 0 && self.errors() == 0
    }

    pub fn to_junit_xml(&self) -> String {
        let mut xml = String::new();
        xml.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
        xml.push_str(&format!(
            "<testsuites name=\"{}\" tests=\"{}\" failures=\"{}\" errors=\"{}\" timestamp=\"{}\" hostname=\"{}\">\n",
            escape_xml(&self.name),
            self.tests(),
            self.failures(),
            self.errors(),
            escape_xml(&self.timestamp),
            escape_xml(&self.hostname),
        ));

        for suite in &self.suites {
            let run_artifact = suite.run_artifact.display().to_string();
            let filtered = suite
                .filtered_artifact
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default();
            xml.push_str(&format!(
                "  <testsuite name=\"{}\" tests=\"{}\" failures=\"{}\" errors=\"{}\" hostname=\"{}\" timestamp=\"{}\" time=\"0\">\n",
                escape_xml(&suite.name),
                suite.tests(),
                suite.failures(),
                suite.errors(),
                escape_xml(&self.hostname),
                escape_xml(&self.timestamp),
            ));
            xml.push_str("    <properties>\n");
            xml.push_str(&format!(
                "      <property name=\"run_fixture\" value=\"{}\" />\n",
                escape_xml(&run_artifact)
            ));
            xml.push_str(&format!(
                "      <property name=\"filter_fixture\" value=\"{}\" />\n",
                escape_xml(&filtered)
            ));
            xml.push_str("    </properties>\n");

            for case in &suite.cases {
                xml.push_str(&format!(
                    "    <testcase name=\"{}\" classname=\"{}\" time=\"0\">\n",
                    escape_xml(&case.name),
                    escape_xml(&case.classname)
                ));
                match &case.outcome {
                    CaseOutcome::Passed => {}
                    CaseOutcome::Failed(text) => xml.push_str(&format!(
                        "      <failure message=\"{}\">{}</failure>\n",
                        escape_xml(first_line(text)),
                        escape_xml(text)
                    )),
                    CaseOutcome::Errored(text) => xml.push_str(&format!(
                        "      <error message=\"{}\">{}</error>\n",
                        escape_xml(first_line(text)),
                        escape_xml(text)
                    )),
                }
                xml.push_str(&format!(
                    "      <system-out>[[ATTACHMENT|{}]]</system-out>\n",
                    escape_xml(&run_artifact)
                ));
                xml.push_str("    </testcase>\n");
            }
            xml.push_str("  </testsuite>\n");
        }

        xml.push_str("</testsuites>\n");
        xml
    }

    pub fn write_xml(&self, path: &Path) -> Result<(), ReplayError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ReplayError::Io(format!("{}: {e}", parent.display())))?;
        }
        std::fs::write(path, self.to_junit_xml())
            .map_err(|e| ReplayError::Io(format!("{}: {e}", path.display())))
    }

    /// Human-readable narration of the report. Status words are colored when
    /// `color` is set.
    pub fn console_lines(&self, report_path: &Path, color: bool) -> Vec<String> {
        let rule = "=".repeat(41);
        let mut lines = vec![
            rule.clone(),
            format!("JUnit XML Report (file://{})", report_path.display()),
            format!("Test Suite: {}", self.name),
            format!("Total Tests: {}", self.tests()),
            format!("Failures: {}", self.failures()),
            format!("Errors: {}", self.errors()),
            String::new(),
        ];

        for suite in &self.suites {
            lines.push(format!("  Suite: {}", suite.name));
            lines.push(format!(
                "    Run Fixture: file://{}",
                suite.run_artifact.display()
            ));
            if let Some(filtered) = &suite.filtered_artifact {
                lines.push(format!("    Filter Fixture: file://{}", filtered.display()));
            }
            for case in &suite.cases {
                lines.push(format!("    Test Case: {}", case.name));
                lines.push(format!("      Class: {}", case.classname));
                lines.push(format!("      Status: {}", status_word(&case.outcome, color)));
                match &case.outcome {
                    CaseOutcome::Passed => {}
                    CaseOutcome::Failed(text) => {
                        lines.push(format!("      Failure Message: {}", text.trim()))
                    }
                    CaseOutcome::Errored(text) => {
                        lines.push(format!("      Error Message: {}", text.trim()))
                    }
                }
                lines.push(String::new());
            }
        }
        lines.push(rule);
        lines
    }
}

fn status_word(outcome: &CaseOutcome, color: bool) -> String {
    let label = outcome.label();
    if !color {
        return label.to_string();
    }
    match outcome {
        CaseOutcome::Passed => label.green().to_string(),
        CaseOutcome::Failed(_) | CaseOutcome::Errored(_) => label.red().to_string(),
    }
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or_default()
}

pub fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

pub fn render_timestamp(at: SystemTime) -> String {
    DateTime::<Utc>::from(at).to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// `HOSTNAME` if set, else the `hostname` command, else `localhost`.
pub fn resolve_hostname(env: &EnvMap, process_runner: &dyn ProcessRunner) -> String {
    if let Some(name) = env.get("HOSTNAME").filter(|n| !n.trim().is_empty()) {
        return name.trim().to_string();
    }
    process_runner
        .run(ProcessRequest::new("hostname", Vec::<String>::new()))
        .ok()
        .filter(|output| output.exit_code == 0)
        .map(|output| output.stdout.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}
