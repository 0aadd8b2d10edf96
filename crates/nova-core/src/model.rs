use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Lifecycle state of a run.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Pending,
    Claimed,
    Working,
    Validating,
    Merging,
    Done,
    Failed,
    Blocked,
}

impl RunState {
    pub const ALL: [RunState; 8] = [
        RunState::Pending,
        RunState::Claimed,
        RunState::Working,
        RunState::Validating,
        RunState::Merging,
        RunState::Done,
        RunState::Failed,
        RunState::Blocked,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Pending => "PENDING",
            RunState::Claimed => "CLAIMED",
            RunState::Working => "WORKING",
            RunState::Validating => "VALIDATING",
            RunState::Merging => "MERGING",
            RunState::Done => "DONE",
            RunState::Failed => "FAILED",
            RunState::Blocked => "BLOCKED",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown {kind}: {value}")]
pub struct ParseStateError {
    pub kind: &'static str,
    pub value: String,
}

impl FromStr for RunState {
    type Err = ParseStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RunState::ALL
            .into_iter()
            .find(|st| st.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ParseStateError { kind: "run state", value: s.to_string() })
    }
}

/// Status of a delegated sub-issue.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SubIssueStatus {
    Open,
    InProgress,
    Closed,
}

impl SubIssueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubIssueStatus::Open => "open",
            SubIssueStatus::InProgress => "in_progress",
            SubIssueStatus::Closed => "closed",
        }
    }
}

impl fmt::Display for SubIssueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for SubIssueStatus {
    type Err = ParseStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(SubIssueStatus::Open),
            "in_progress" => Ok(SubIssueStatus::InProgress),
            "closed" => Ok(SubIssueStatus::Closed),
            _ => Err(ParseStateError { kind: "sub-issue status", value: s.to_string() }),
        }
    }
}
