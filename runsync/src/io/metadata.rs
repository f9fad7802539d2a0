//! Run metadata file (`metadata.json` in the run directory).
//!
//! The user process writes it at startup; the sync process records the final exit code and
//! state into it at shutdown. Keys this crate does not know about are preserved.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::lifecycle::RunLifecycleState;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GitInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RunMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub program: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git: Option<GitInfo>,
    #[serde(
        rename = "exitcode",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<RunLifecycleState>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RunMetadata {
    pub fn record_exit(&mut self, exit_code: i32) {
        self.exit_code = Some(exit_code);
        self.state = Some(RunLifecycleState::from_exit_code(exit_code));
    }
}

/// Load metadata if the file exists.
pub fn load_metadata(path: &Path) -> Result<Option<RunMetadata>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let meta = serde_json::from_str(&contents)
        .with_context(|| format!("parse metadata {}", path.display()))?;
    Ok(Some(meta))
}

pub fn write_metadata(path: &Path, meta: &RunMetadata) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(meta).context("serialize metadata")?;
    buf.push('\n');
    super::write_atomic(path, &buf)
}
