use crate::errors::ReplayError;
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TopicDiff {
    pub missing: Vec<String>,
    pub extra: Vec<String>,
}

impl TopicDiff {
    pub fn between(present: &BTreeSet<String>, required: &BTreeSet<String>) -> Self {
        Self {
            missing: required.difference(present).cloned().collect(),
            extra: present.difference(required).cloned().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.missing.is_empty() && self.extra.is_empty()
    }
}

/// Topics of `present` that the fixture actually requires. Recordings may
/// carry output or diagnostic topics; only the required ones take part in
/// input validation.
pub fn required_present(present: &BTreeSet<String>, required: &BTreeSet<String>) -> BTreeSet<String> {
    present.intersection(required).cloned().collect()
}

/// The log's topics must equal the required set exactly. Both sides of a
/// mismatch are reported together, sorted.
pub fn validate(
    fixture: &str,
    present: &BTreeSet<String>,
    required: &BTreeSet<String>,
) -> Result<(), ReplayError> {
    let diff = TopicDiff::between(present, required);
    if diff.is_empty() {
        return Ok(());
    }
    Err(ReplayError::Validation {
        fixture: fixture.to_string(),
        missing: diff.missing,
        extra: diff.extra,
    })
}
