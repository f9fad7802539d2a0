//! Local bookkeeping for a run (`.runsync/run_state.json`).

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::lifecycle::RunLifecycleState;

/// Persisted record of the run as the sync process last saw it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunState {
    pub run_id: Option<String>,
    /// Identifier the remote store assigned at upsert.
    pub storage_id: Option<String>,
    pub state: RunLifecycleState,
    pub resumed: bool,
    /// Step the history stream continued from on resume.
    pub starting_step: u64,
    pub exit_code: Option<i32>,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub uploaded_files: usize,
    /// Rendered sync errors from shutdown, in the order they were collected.
    pub sync_errors: Vec<String>,
}

impl Default for RunState {
    fn default() -> Self {
        Self {
            run_id: None,
            storage_id: None,
            state: RunLifecycleState::New,
            resumed: false,
            starting_step: 0,
            exit_code: None,
            started_at: None,
            finished_at: None,
            uploaded_files: 0,
            sync_errors: Vec::new(),
        }
    }
}

/// Load run state from disk.
pub fn load_run_state(path: &Path) -> Result<RunState> {
    debug!(path = %path.display(), "loading run state");
    let contents =
        fs::read_to_string(path).with_context(|| format!("read run state {}", path.display()))?;
    let state: RunState = serde_json::from_str(&contents)
        .with_context(|| format!("parse run state {}", path.display()))?;
    debug!(run_id = ?state.run_id, state = %state.state, "run state loaded");
    Ok(state)
}

/// Atomically write run state to disk (temp file + rename).
pub fn write_run_state(path: &Path, state: &RunState) -> Result<()> {
    debug!(path = %path.display(), run_id = ?state.run_id, state = %state.state, "writing run state");
    let mut buf = serde_json::to_string_pretty(state)?;
    buf.push('\n');
    super::write_atomic(path, &buf)
}
