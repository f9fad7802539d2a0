//! Sync engine configuration stored under `.runsync/config.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::lifecycle::ResumeMode;
use crate::core::line_buffer::FlushPolicy;
use crate::core::policy::RunFileNames;

/// Sync engine configuration (TOML).
///
/// Missing fields default to values suited to a single training run talking to a
/// remote store over a normal network link.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct SyncConfig {
    pub stream: StreamConfig,
    pub upload: UploadConfig,
    pub policy: PolicyConfig,
    pub watch: WatchConfig,
    pub process: ProcessConfig,
    pub resume: ResumeConfig,
}

/// Streaming log pusher settings, shared by history, events, and console streams.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StreamConfig {
    /// Unsent lines that trigger a post (subject to the rate limit).
    pub line_threshold: usize,
    pub min_post_interval_ms: u64,
    /// Oldest unsent line age that forces a post.
    pub staleness_ms: u64,
    /// Idle interval after which an empty keep-alive post is sent.
    pub heartbeat_secs: u64,
    /// Consecutive failed posts before the stream gives up.
    pub max_consecutive_failures: u32,
    /// Prefix console lines with a UTC timestamp.
    pub timestamp_console: bool,
    pub retry: RetryConfig,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            line_threshold: 100,
            min_post_interval_ms: 1_000,
            staleness_ms: 5_000,
            heartbeat_secs: 30,
            max_consecutive_failures: 5,
            timestamp_console: true,
            retry: RetryConfig::default(),
        }
    }
}

impl StreamConfig {
    pub fn flush_policy(&self) -> FlushPolicy {
        FlushPolicy {
            line_threshold: self.line_threshold,
            min_post_interval: Duration::from_millis(self.min_post_interval_ms),
            staleness: Duration::from_millis(self.staleness_ms),
        }
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }
}

/// Exponential backoff with jitter for remote calls.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Attempts per operation, including the first.
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            max_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct UploadConfig {
    /// Concurrent upload workers.
    pub workers: usize,
    pub retry: RetryConfig,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PolicyConfig {
    pub files: RunFileNames,
    /// Globs uploaded with the throttled policy unless a save override says otherwise.
    pub throttled_globs: Vec<String>,
    /// Globs never uploaded, in addition to hidden and `*.tmp` files.
    pub ignore_globs: Vec<String>,
    /// Minimum spacing between remote config/summary updates.
    pub structured_update_interval_secs: u64,
    /// Fixed throttle interval; when unset it is derived from file size.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub throttle_min_wait_secs: Option<u64>,
    /// Poll interval for tailing history and events files.
    pub tail_poll_interval_ms: u64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            files: RunFileNames::default(),
            throttled_globs: vec!["*tfevents*".to_string(), "*.pbtxt".to_string()],
            ignore_globs: Vec::new(),
            structured_update_interval_secs: 30,
            throttle_min_wait_secs: None,
            tail_poll_interval_ms: 250,
        }
    }
}

impl PolicyConfig {
    pub fn structured_update_interval(&self) -> Duration {
        Duration::from_secs(self.structured_update_interval_secs)
    }

    pub fn throttle_min_wait(&self) -> Option<Duration> {
        self.throttle_min_wait_secs.map(Duration::from_secs)
    }

    pub fn tail_poll_interval(&self) -> Duration {
        Duration::from_millis(self.tail_poll_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WatchConfig {
    pub poll_interval_ms: u64,
    /// Hash file contents on every poll so rewrites within one mtime tick are noticed.
    pub compare_contents: bool,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            compare_contents: false,
        }
    }
}

impl WatchConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProcessConfig {
    /// Time a stopping process gets between the polite request and the kill.
    pub kill_grace_secs: u64,
    /// How often the coordinator checks the wire channel and the process handle.
    pub control_poll_ms: u64,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            kill_grace_secs: 10,
            control_poll_ms: 1_000,
        }
    }
}

impl ProcessConfig {
    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_secs)
    }

    pub fn control_poll(&self) -> Duration {
        Duration::from_millis(self.control_poll_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ResumeConfig {
    pub mode: ResumeMode,
    /// Upper bound on the resume-status lookup.
    pub lookup_timeout_secs: u64,
}

impl Default for ResumeConfig {
    fn default() -> Self {
        Self {
            mode: ResumeMode::Never,
            lookup_timeout_secs: 10,
        }
    }
}

impl ResumeConfig {
    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_secs(self.lookup_timeout_secs)
    }
}

impl SyncConfig {
    pub fn validate(&self) -> Result<()> {
        if self.stream.line_threshold == 0 {
            return Err(anyhow!("stream.line_threshold must be > 0"));
        }
        if self.stream.max_consecutive_failures == 0 {
            return Err(anyhow!("stream.max_consecutive_failures must be > 0"));
        }
        if self.stream.heartbeat_secs == 0 {
            return Err(anyhow!("stream.heartbeat_secs must be > 0"));
        }
        if self.upload.workers == 0 {
            return Err(anyhow!("upload.workers must be > 0"));
        }
        for (label, retry) in [
            ("stream.retry", &self.stream.retry),
            ("upload.retry", &self.upload.retry),
        ] {
            if retry.max_attempts == 0 {
                return Err(anyhow!("{label}.max_attempts must be > 0"));
            }
        }
        if self.watch.poll_interval_ms == 0 {
            return Err(anyhow!("watch.poll_interval_ms must be > 0"));
        }
        if self.process.control_poll_ms == 0 {
            return Err(anyhow!("process.control_poll_ms must be > 0"));
        }
        let files = &self.policy.files;
        for (label, name) in [
            ("history", &files.history),
            ("events", &files.events),
            ("config", &files.config),
            ("summary", &files.summary),
            ("metadata", &files.metadata),
            ("output", &files.output),
            ("media_dir", &files.media_dir),
        ] {
            if name.trim().is_empty() {
                return Err(anyhow!("policy.files.{label} must be non-empty"));
            }
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `SyncConfig::default()`.
pub fn load_config(path: &Path) -> Result<SyncConfig> {
    if !path.exists() {
        let cfg = SyncConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: SyncConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &SyncConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    super::write_atomic(path, &buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, SyncConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let mut cfg = SyncConfig::default();
        cfg.policy.throttle_min_wait_secs = Some(15);
        cfg.resume.mode = ResumeMode::Auto;
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "[upload]\nworkers = 2\n\n[resume]\nmode = \"must\"\n").expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.upload.workers, 2);
        assert_eq!(cfg.resume.mode, ResumeMode::Must);
        assert_eq!(cfg.stream, StreamConfig::default());
    }

    #[test]
    fn zero_workers_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "[upload]\nworkers = 0\n").expect("write");
        let err = load_config(&path).expect_err("invalid");
        assert!(format!("{err:#}").contains("upload.workers"));
    }
}
