//! On-disk working directory of one fixture:
//!
//! ```text
//! <results>/<run-id>/<key>/<input file>
//! <results>/<run-id>/<key>/filtered.<ext>
//! <results>/<run-id>/<key>/runs/run_<param>_<key>.<ext>
//! ```

use crate::errors::ReplayError;
use crate::fixtures::FixtureSource;
use crate::fsm::FixtureProgress;
use crate::logging::append_run_log;
use crate::message_log::{filter_log, FilterMode, MessageLogFormat};
use serde_json::json;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

pub const FILTERED_STEM: &str = "filtered";
pub const RUNS_DIR: &str = "runs";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunArtifact {
    pub run_name: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ReplayFixture {
    pub key: String,
    pub base_path: PathBuf,
    pub input_artifact: Option<PathBuf>,
    pub filtered_artifact: Option<PathBuf>,
    pub run_artifacts: Vec<RunArtifact>,
    pub progress: FixtureProgress,
}

impl ReplayFixture {
    pub fn create(results_dir: &Path, key: &str) -> Result<Self, ReplayError> {
        let base_path = results_dir.join(key);
        std::fs::create_dir_all(&base_path)
            .map_err(|e| ReplayError::Io(format!("{}: {e}", base_path.display())))?;
        Ok(Self {
            key: key.to_string(),
            base_path,
            input_artifact: None,
            filtered_artifact: None,
            run_artifacts: Vec::new(),
            progress: FixtureProgress::default(),
        })
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.base_path.join(RUNS_DIR)
    }

    pub fn filtered_path(&self, extension: &str) -> PathBuf {
        self.base_path.join(format!("{FILTERED_STEM}.{extension}"))
    }

    pub fn download_input(&mut self, source: &dyn FixtureSource) -> Result<PathBuf, ReplayError> {
        append_run_log(
            "info",
            "fixture.download.started",
            json!({"fixture": self.key, "source": source.describe()}),
        );
        let path = source
            .acquire(&self.base_path)
            .map_err(|err| self.acquisition_error(err.to_string()))?;

        let len = std::fs::metadata(&path)
            .map_err(|e| self.acquisition_error(format!("{}: {e}", path.display())))?
            .len();
        if len == 0 {
            return Err(self.acquisition_error(format!("{} is empty", path.display())));
        }

        append_run_log(
            "info",
            "fixture.download.completed",
            json!({"fixture": self.key, "path": path.display().to_string(), "bytes": len}),
        );
        self.input_artifact = Some(path.clone());
        Ok(path)
    }

    pub fn filter_input(
        &mut self,
        format: &dyn MessageLogFormat,
        expected_output_topics: &BTreeSet<String>,
        mode: FilterMode,
    ) -> Result<PathBuf, ReplayError> {
        let input = self.input_artifact.clone().ok_or_else(|| {
            self.acquisition_error("input artifact must be downloaded before filtering".to_string())
        })?;
        let output = self.filtered_path(format.payload_extension());
        if output == input {
            return Err(self.acquisition_error(format!(
                "input file name collides with {}",
                output.display()
            )));
        }

        let kept = filter_log(format, &input, &output, expected_output_topics, mode)?;
        append_run_log(
            "info",
            "fixture.filtered",
            json!({
                "fixture": self.key,
                "path": output.display().to_string(),
                "messages": kept,
                "mode": format!("{mode:?}"),
            }),
        );
        self.filtered_artifact = Some(output.clone());
        Ok(output)
    }

    /// Allocates the destination the recorder writes into for `run_name`.
    /// The path itself is left for the recorder to create.
    pub fn generate_run_artifact(&mut self, run_name: &str) -> Result<PathBuf, ReplayError> {
        let runs = self.runs_dir();
        std::fs::create_dir_all(&runs)
            .map_err(|e| ReplayError::Io(format!("{}: {e}", runs.display())))?;
        let path = runs.join(run_artifact_name(run_name, &self.key));
        self.run_artifacts.push(RunArtifact {
            run_name: run_name.to_string(),
            path: path.clone(),
        });
        Ok(path)
    }

    /// Puts runs in `declared` order. Runs missing from `declared` follow,
    /// in their existing order.
    pub fn order_runs(&mut self, declared: &[String]) {
        self.run_artifacts.sort_by_key(|artifact| {
            declared
                .iter()
                .position(|name| *name == artifact.run_name)
                .unwrap_or(declared.len())
        });
    }

    /// Collapses the most recently generated run artifact in place.
    pub fn collapse_latest(&mut self, extension: &str) -> Result<PathBuf, ReplayError> {
        let artifact = self.run_artifacts.last_mut().ok_or_else(|| {
            ReplayError::Io("no run artifact to collapse".to_string())
        })?;
        let collapsed = collapse_run_artifact(&artifact.path, extension)?;
        artifact.path = collapsed.clone();
        Ok(collapsed)
    }

    fn acquisition_error(&self, message: String) -> ReplayError {
        ReplayError::FixtureAcquisition {
            fixture: self.key.clone(),
            message,
        }
    }
}

pub fn run_artifact_name(run_name: &str, fixture_key: &str) -> String {
    format!("run_{run_name}_{fixture_key}")
}

/// Replaces the recorder's output directory with the single `.<extension>`
/// payload file it contains. Zero or several payload files is an error.
pub fn collapse_run_artifact(artifact: &Path, extension: &str) -> Result<PathBuf, ReplayError> {
    let file_name = artifact
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .ok_or_else(|| ReplayError::Io(format!("{} has no file name", artifact.display())))?;
    let target = artifact.with_file_name(format!("{file_name}.{extension}"));

    if artifact.is_file() {
        // Some recorders write the payload straight to the destination path.
        std::fs::rename(artifact, &target).map_err(|e| io_error("rename", artifact, &target, e))?;
        return Ok(target);
    }

    let entries = std::fs::read_dir(artifact).map_err(|_| ReplayError::ArtifactNormalization {
        path: artifact.to_path_buf(),
        found: 0,
    })?;
    let mut payloads = Vec::new();
    for entry in entries {
        let path = entry
            .map_err(|e| ReplayError::Io(format!("{}: {e}", artifact.display())))?
            .path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == extension) {
            payloads.push(path);
        }
    }

    if payloads.len() != 1 {
        return Err(ReplayError::ArtifactNormalization {
            path: artifact.to_path_buf(),
            found: payloads.len(),
        });
    }
    if target.exists() {
        return Err(ReplayError::Io(format!(
            "{} already exists",
            target.display()
        )));
    }

    let payload = &payloads[0];
    std::fs::rename(payload, &target).map_err(|e| io_error("rename", payload, &target, e))?;
    std::fs::remove_dir_all(artifact)
        .map_err(|e| ReplayError::Io(format!("remove {}: {e}", artifact.display())))?;

    append_run_log(
        "debug",
        "run.artifact.collapsed",
        json!({"from": payload.display().to_string(), "to": target.display().to_string()}),
    );
    Ok(target)
}

/// Rebuilds fixtures from a previous run's results directory. Directories are
/// visited in name order; run artifacts are the collapsed payload files.
pub fn reconstruct_fixtures(
    results_dir: &Path,
    extension: &str,
) -> Result<Vec<ReplayFixture>, ReplayError> {
    let entries = std::fs::read_dir(results_dir).map_err(|e| {
        ReplayError::Configuration(format!(
            "no previous results at {}: {e}",
            results_dir.display()
        ))
    })?;

    let mut dirs = Vec::new();
    for entry in entries {
        let path = entry
            .map_err(|e| ReplayError::Io(format!("{}: {e}", results_dir.display())))?
            .path();
        if path.is_dir() {
            dirs.push(path);
        }
    }
    dirs.sort();

    let mut fixtures = Vec::with_capacity(dirs.len());
    for base_path in dirs {
        let key = base_path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        let mut fixture = ReplayFixture {
            key: key.clone(),
            base_path: base_path.clone(),
            input_artifact: None,
            filtered_artifact: None,
            run_artifacts: Vec::new(),
            progress: FixtureProgress::reconstructed(),
        };

        let filtered = fixture.filtered_path(extension);
        if filtered.is_file() {
            fixture.filtered_artifact = Some(filtered);
        }

        let runs = fixture.runs_dir();
        if runs.is_dir() {
            let mut artifacts = Vec::new();
            for entry in std::fs::read_dir(&runs)
                .map_err(|e| ReplayError::Io(format!("{}: {e}", runs.display())))?
            {
                let path = entry
                    .map_err(|e| ReplayError::Io(format!("{}: {e}", runs.display())))?
                    .path();
                if path.is_file() && path.extension().is_some_and(|ext| ext == extension) {
                    artifacts.push(path);
                }
            }
            artifacts.sort();
            fixture.run_artifacts = artifacts
                .into_iter()
                .map(|path| RunArtifact {
                    run_name: run_name_from_artifact(&path, &key),
                    path,
                })
                .collect();
        }

        append_run_log(
            "info",
            "fixture.reconstructed",
            json!({"fixture": key, "runs": fixture.run_artifacts.len()}),
        );
        fixtures.push(fixture);
    }
    Ok(fixtures)
}

fn run_name_from_artifact(path: &Path, fixture_key: &str) -> String {
    let stem = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_default();
    stem.strip_prefix("run_")
        .and_then(|rest| rest.strip_suffix(&format!("_{fixture_key}")))
        .map(str::to_string)
        .unwrap_or(stem)
}

fn io_error(op: &str, from: &Path, to: &Path, err: std::io::Error) -> ReplayError {
    ReplayError::Io(format!("{op} {} -> {}: {err}", from.display(), to.display()))
}
