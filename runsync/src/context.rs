//! Identity and paths of the run being synced.
//!
//! One [`RunContext`] is created per sync process and shared (behind an `Arc`) by every
//! component that needs to know which run it works for.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};

use rand::Rng;
use rand::distributions::Alphanumeric;

/// Directory inside the run directory holding sync-private state.
pub const STATE_DIR: &str = ".runsync";

/// Resolved paths for sync-private files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPaths {
    pub run_dir: PathBuf,
    pub state_dir: PathBuf,
    pub config_path: PathBuf,
    pub run_state_path: PathBuf,
    /// Append-only JSON lines of `{"glob": ..., "policy": ...}` save requests.
    pub save_policy_path: PathBuf,
}

impl RunPaths {
    pub fn new(run_dir: &Path) -> Self {
        let state_dir = run_dir.join(STATE_DIR);
        Self {
            run_dir: run_dir.to_path_buf(),
            config_path: state_dir.join("config.toml"),
            run_state_path: state_dir.join("run_state.json"),
            save_policy_path: state_dir.join("save_policy.jsonl"),
            state_dir,
        }
    }
}

#[derive(Debug)]
pub struct RunContext {
    pub run_id: String,
    pub entity: String,
    pub project: String,
    pub paths: RunPaths,
    storage_id: OnceLock<String>,
    resumed: AtomicBool,
}

impl RunContext {
    pub fn new(
        run_id: impl Into<String>,
        entity: impl Into<String>,
        project: impl Into<String>,
        run_dir: &Path,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            entity: entity.into(),
            project: project.into(),
            paths: RunPaths::new(run_dir),
            storage_id: OnceLock::new(),
            resumed: AtomicBool::new(false),
        }
    }

    pub fn run_dir(&self) -> &Path {
        &self.paths.run_dir
    }

    /// Absolute path of a logical name.
    pub fn path_of(&self, logical_name: &str) -> PathBuf {
        self.paths.run_dir.join(logical_name)
    }

    /// Id assigned by the remote store; `None` until initialization succeeds.
    pub fn storage_id(&self) -> Option<&str> {
        self.storage_id.get().map(String::as_str)
    }

    /// Record the store id. Only the first call takes effect.
    pub fn set_storage_id(&self, id: String) {
        let _ = self.storage_id.set(id);
    }

    pub fn resumed(&self) -> bool {
        self.resumed.load(Ordering::Acquire)
    }

    pub fn set_resumed(&self, resumed: bool) {
        self.resumed.store(resumed, Ordering::Release);
    }
}

/// Random lowercase run id.
pub fn generate_run_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect::<String>()
        .to_lowercase()
}
