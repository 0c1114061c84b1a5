use crate::errors::ReplayError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

pub type EnvMap = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestPhase {
    Fixtures,
    Run,
    Analyze,
}

impl TestPhase {
    pub const ALL: [TestPhase; 3] = [Self::Fixtures, Self::Run, Self::Analyze];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fixtures => "fixtures",
            Self::Run => "run",
            Self::Analyze => "analyze",
        }
    }

    pub fn banner_name(self) -> &'static str {
        match self {
            Self::Fixtures => "FIXTURES",
            Self::Run => "RUN",
            Self::Analyze => "ANALYZE",
        }
    }
}

/// Session scope of one fixtures -> run -> analyze invocation. Names the
/// results directory and can be handed back for analyze-only re-runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RunIdentity(Uuid);

impl RunIdentity {
    pub fn fresh() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(value: &str) -> Result<Self, ReplayError> {
        Uuid::parse_str(value.trim())
            .map(Self)
            .map_err(|e| ReplayError::Cli(format!("invalid run id `{value}`: {e}")))
    }
}

impl fmt::Display for RunIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}
