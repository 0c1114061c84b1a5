use crate::errors::ReplayError;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixtureState {
    Pending,
    Downloading,
    Validating,
    Filtered,
    Running,
    Collapsing,
    Done,
    Failed,
}

impl FixtureState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::Validating => "validating",
            Self::Filtered => "filtered",
            Self::Running => "running",
            Self::Collapsing => "collapsing",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl fmt::Display for FixtureState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixtureProgress {
    pub state: FixtureState,
    pub current_run: Option<String>,
    pub failure_reason: Option<String>,
}

impl Default for FixtureProgress {
    fn default() -> Self {
        Self {
            state: FixtureState::Pending,
            current_run: None,
            failure_reason: None,
        }
    }
}

impl FixtureProgress {
    /// Progress for a fixture rebuilt from a previous run's results.
    pub fn reconstructed() -> Self {
        Self {
            state: FixtureState::Done,
            ..Self::default()
        }
    }

    pub fn transition(&mut self, next: FixtureState) -> Result<(), ReplayError> {
        validate_transition(self.state, next)?;
        self.state = next;
        if next != FixtureState::Running && next != FixtureState::Collapsing {
            self.current_run = None;
        }
        Ok(())
    }

    pub fn start_run(&mut self, run_name: &str) -> Result<(), ReplayError> {
        self.transition(FixtureState::Running)?;
        self.current_run = Some(run_name.to_string());
        Ok(())
    }

    /// Marks the fixture failed. Terminal fixtures are left as they are.
    pub fn fail(&mut self, reason: impl Into<String>) {
        if self.state.is_terminal() {
            return;
        }
        self.state = FixtureState::Failed;
        self.failure_reason = Some(reason.into());
    }
}

pub fn validate_transition(from: FixtureState, to: FixtureState) -> Result<(), ReplayError> {
    use FixtureState as S;

    let allowed = match from {
        S::Pending => matches!(to, S::Downloading | S::Failed),
        S::Downloading => matches!(to, S::Validating | S::Failed),
        S::Validating => matches!(to, S::Filtered | S::Failed),
        S::Filtered => matches!(to, S::Running | S::Failed),
        S::Running => matches!(to, S::Collapsing | S::Failed),
        S::Collapsing => matches!(to, S::Running | S::Done | S::Failed),
        S::Done | S::Failed => false,
    };

    if !allowed {
        return Err(ReplayError::Configuration(format!(
            "illegal fixture transition: {from} -> {to}"
        )));
    }
    Ok(())
}
