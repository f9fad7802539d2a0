//! Run lifecycle states and the decisions taken at initialization.

use std::fmt;
use std::str::FromStr;

use anyhow::bail;
use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::exit_codes;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunLifecycleState {
    New,
    Running,
    Finished,
    Failed,
    Killed,
}

impl RunLifecycleState {
    /// Terminal state for a user process exit code: `0` finished, `255` killed, anything else failed.
    pub fn from_exit_code(code: i32) -> Self {
        match code {
            exit_codes::OK => RunLifecycleState::Finished,
            exit_codes::KILLED => RunLifecycleState::Killed,
            _ => RunLifecycleState::Failed,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunLifecycleState::Finished | RunLifecycleState::Failed | RunLifecycleState::Killed
        )
    }
}

impl fmt::Display for RunLifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunLifecycleState::New => "new",
            RunLifecycleState::Running => "running",
            RunLifecycleState::Finished => "finished",
            RunLifecycleState::Failed => "failed",
            RunLifecycleState::Killed => "killed",
        };
        f.write_str(name)
    }
}

/// Whether an existing remote run should be continued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResumeMode {
    /// Always start fresh; an existing run with the same id is a conflict.
    #[default]
    Never,
    /// Continue if the run exists, start fresh otherwise.
    Auto,
    /// The run must exist.
    Must,
}

impl FromStr for ResumeMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "never" => Ok(ResumeMode::Never),
            "auto" | "allow" => Ok(ResumeMode::Auto),
            "must" => Ok(ResumeMode::Must),
            other => bail!("unknown resume mode {other:?} (expected never, auto, or must)"),
        }
    }
}

/// What the resume lookup found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupOutcome {
    Found,
    NotFound,
    /// The lookup did not complete (timeout or store failure).
    Unreachable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeDecision {
    Resume,
    Fresh,
}

pub fn resume_decision(
    mode: ResumeMode,
    lookup: LookupOutcome,
    run_id: &str,
) -> Result<ResumeDecision, SyncError> {
    match (mode, lookup) {
        (ResumeMode::Never, _) => Ok(ResumeDecision::Fresh),
        (ResumeMode::Auto, LookupOutcome::Found) => Ok(ResumeDecision::Resume),
        (ResumeMode::Auto, _) => Ok(ResumeDecision::Fresh),
        (ResumeMode::Must, LookupOutcome::Found) => Ok(ResumeDecision::Resume),
        (ResumeMode::Must, LookupOutcome::NotFound) => Err(SyncError::ResumeConflict {
            run_id: run_id.to_string(),
            reason: "resume required but the run does not exist".to_string(),
        }),
        (ResumeMode::Must, LookupOutcome::Unreachable) => Err(SyncError::Launch(format!(
            "resume required but run {run_id} could not be looked up"
        ))),
    }
}

/// Step recorded in the last line of a history tail (`_step`), or 0.
pub fn starting_step(history_tail: &[String]) -> u64 {
    history_tail
        .iter()
        .rev()
        .find(|line| !line.trim().is_empty())
        .and_then(|line| serde_json::from_str::<serde_json::Value>(line).ok())
        .and_then(|row| row.get("_step").and_then(serde_json::Value::as_u64))
        .unwrap_or(0)
}
