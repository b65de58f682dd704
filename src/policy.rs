use crate::report::SignalReport;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Run state as reported by the parser. Unknown labels are carried through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum JobState {
    Successful,
    Error,
    Other(String),
}

impl From<String> for JobState {
    fn from(s: String) -> Self {
        match s.as_str() {
            "successful" => JobState::Successful,
            "error" => JobState::Error,
            _ => JobState::Other(s),
        }
    }
}

impl From<JobState> for String {
    fn from(s: JobState) -> Self {
        s.to_string()
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Successful => f.write_str("successful"),
            JobState::Error => f.write_str("error"),
            JobState::Other(s) => f.write_str(s),
        }
    }
}

/// Final state of a run: a critical signal turns a successful run into an
/// error, and nothing ever turns an error back.
pub fn decide(raw: JobState, report: &SignalReport) -> JobState {
    match raw {
        JobState::Successful if report.is_critical() => JobState::Error,
        other => other,
    }
}
