use crate::types::TestPhase;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorKind {
    NotFound,
    Unauthorized,
    Transient,
}

impl FetchErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "not found",
            Self::Unauthorized => "unauthorized",
            Self::Transient => "transient",
        }
    }
}

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("fetch error ({}) for {store}/{key}: {message}", .kind.as_str())]
    Fetch {
        store: String,
        key: String,
        kind: FetchErrorKind,
        message: String,
    },
    #[error("failed to acquire fixture `{fixture}`: {message}")]
    FixtureAcquisition { fixture: String, message: String },
    #[error("{}", render_validation(.fixture, .missing, .extra))]
    Validation {
        fixture: String,
        missing: Vec<String>,
        extra: Vec<String>,
    },
    #[error("expected exactly one payload file in {}, found {found}", .path.display())]
    ArtifactNormalization { path: PathBuf, found: usize },
    #[error("fixture `{fixture}` already holds run artifacts; start a new run identity to re-run")]
    RunConflict { fixture: String },
    #[error("process error: {0}")]
    Process(String),
    #[error("message log error: {0}")]
    MessageLog(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("config parse error: {0}")]
    ConfigParse(String),
    #[error("cli error: {0}")]
    Cli(String),
    #[error("{} phase failed{}: {source}", .phase.as_str(), fixture_suffix(.fixture))]
    Phase {
        phase: TestPhase,
        fixture: Option<String>,
        #[source]
        source: Box<ReplayError>,
    },
}

impl ReplayError {
    pub fn fetch(
        store: &str,
        key: &str,
        kind: FetchErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self::Fetch {
            store: store.to_string(),
            key: key.to_string(),
            kind,
            message: message.into(),
        }
    }

    /// Wraps the error with the phase and fixture it surfaced in. Already
    /// wrapped errors are returned unchanged.
    pub fn in_phase(self, phase: TestPhase, fixture: Option<&str>) -> Self {
        if matches!(self, Self::Phase { .. }) {
            return self;
        }
        Self::Phase {
            phase,
            fixture: fixture.map(str::to_string),
            source: Box::new(self),
        }
    }

    /// Innermost error, skipping phase context.
    pub fn root(&self) -> &ReplayError {
        match self {
            Self::Phase { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.root(),
            Self::Fetch {
                kind: FetchErrorKind::Transient,
                ..
            }
        )
    }
}

fn fixture_suffix(fixture: &Option<String>) -> String {
    fixture
        .as_deref()
        .map(|key| format!(" for fixture `{key}`"))
        .unwrap_or_default()
}

fn render_validation(fixture: &str, missing: &[String], extra: &[String]) -> String {
    let mut message = format!("input topics do not match for fixture `{fixture}`:");
    if !missing.is_empty() {
        message.push_str(&format!("\n  missing topics: {missing:?}"));
    }
    if !extra.is_empty() {
        message.push_str(&format!("\n  extra topics: {extra:?}"));
    }
    message
}
