//! Test-only helpers: an in-memory remote store with failure injection, and polling utilities.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::StoreError;
use crate::io::config::{RetryConfig, SyncConfig};
use crate::io::store::{LogBatch, RemoteFile, RemoteStore, ResumeStatus, RunRecord, UpsertRun};

/// Poll `cond` every 10ms until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(10));
    }
}

/// Config with short intervals so tests finish quickly.
pub fn fast_config() -> SyncConfig {
    let retry = RetryConfig {
        base_delay_ms: 1,
        max_delay_ms: 5,
        max_attempts: 3,
    };
    let mut cfg = SyncConfig::default();
    cfg.stream.min_post_interval_ms = 10;
    cfg.stream.staleness_ms = 100;
    cfg.stream.heartbeat_secs = 60;
    cfg.stream.timestamp_console = false;
    cfg.stream.retry = retry;
    cfg.upload.workers = 2;
    cfg.upload.retry = retry;
    cfg.policy.structured_update_interval_secs = 1;
    cfg.policy.tail_poll_interval_ms = 20;
    cfg.watch.poll_interval_ms = 50;
    cfg.process.control_poll_ms = 50;
    cfg.process.kill_grace_secs = 2;
    cfg.resume.lookup_timeout_secs = 2;
    cfg
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[derive(Default)]
struct Recorded {
    resume: HashMap<String, ResumeStatus>,
    resume_delay: Option<Duration>,
    resume_unreachable: bool,
    existing_runs: HashSet<String>,
    upsert_failures: u32,
    upserts: Vec<UpsertRun>,
    configs: Vec<Value>,
    summaries: Vec<Value>,
    uploads: Vec<(String, Vec<u8>)>,
    batches: Vec<(String, LogBatch)>,
    failing_posts: u32,
    transient_uploads: HashMap<String, u32>,
    rejected_uploads: HashMap<String, StoreError>,
    digest_overrides: HashMap<String, String>,
    in_flight: HashMap<String, usize>,
    max_in_flight: HashMap<String, usize>,
}

/// In-memory [`RemoteStore`] that records every call.
#[derive(Default)]
pub struct RecordingStore {
    state: Mutex<Recorded>,
    held: Mutex<bool>,
    released: Condvar,
}

impl RecordingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `run_name` look like an existing remote run.
    pub fn with_resume(self, run_name: &str, status: ResumeStatus) -> Self {
        {
            let mut state = self.state.lock();
            state.existing_runs.insert(run_name.to_string());
            state.resume.insert(run_name.to_string(), status);
        }
        self
    }

    /// Existing run that does not report resume status (fresh upserts conflict).
    pub fn with_existing_run(self, run_name: &str) -> Self {
        self.state.lock().existing_runs.insert(run_name.to_string());
        self
    }

    pub fn delay_resume_lookup(&self, delay: Duration) {
        self.state.lock().resume_delay = Some(delay);
    }

    pub fn make_resume_unreachable(&self) {
        self.state.lock().resume_unreachable = true;
    }

    pub fn fail_next_upserts(&self, count: u32) {
        self.state.lock().upsert_failures = count;
    }

    pub fn fail_next_posts(&self, count: u32) {
        self.state.lock().failing_posts = count;
    }

    pub fn fail_uploads_transiently(&self, name: &str, count: u32) {
        self.state
            .lock()
            .transient_uploads
            .insert(name.to_string(), count);
    }

    pub fn reject_uploads(&self, name: &str, err: StoreError) {
        self.state
            .lock()
            .rejected_uploads
            .insert(name.to_string(), err);
    }

    /// Report a wrong digest for `name` from [`RemoteStore::download_urls`].
    pub fn corrupt_digest(&self, name: &str) {
        self.state
            .lock()
            .digest_overrides
            .insert(name.to_string(), "0".repeat(64));
    }

    /// Block uploads (after they are counted in flight) until [`release_uploads`](Self::release_uploads).
    pub fn hold_uploads(&self) {
        *self.held.lock() = true;
    }

    pub fn release_uploads(&self) {
        *self.held.lock() = false;
        self.released.notify_all();
    }

    pub fn upserts(&self) -> Vec<UpsertRun> {
        self.state.lock().upserts.clone()
    }

    pub fn configs(&self) -> Vec<Value> {
        self.state.lock().configs.clone()
    }

    pub fn summaries(&self) -> Vec<Value> {
        self.state.lock().summaries.clone()
    }

    pub fn uploaded_names(&self) -> Vec<String> {
        self.state
            .lock()
            .uploads
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn uploads_of(&self, name: &str) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .uploads
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, contents)| contents.clone())
            .collect()
    }

    pub fn in_flight(&self, name: &str) -> usize {
        self.state.lock().in_flight.get(name).copied().unwrap_or(0)
    }

    pub fn max_in_flight(&self, name: &str) -> usize {
        self.state
            .lock()
            .max_in_flight
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    /// Every batch posted to `endpoint`, heartbeats included.
    pub fn batches(&self, endpoint: &str) -> Vec<LogBatch> {
        self.state
            .lock()
            .batches
            .iter()
            .filter(|(e, _)| e == endpoint)
            .map(|(_, batch)| batch.clone())
            .collect()
    }

    /// Batches to `endpoint` that carried lines.
    pub fn line_posts(&self, endpoint: &str) -> Vec<LogBatch> {
        self.batches(endpoint)
            .into_iter()
            .filter(|batch| !batch.lines.is_empty())
            .collect()
    }

    /// Remote view of `endpoint` after applying every post in order.
    pub fn resolved_lines(&self, endpoint: &str) -> BTreeMap<u64, String> {
        let mut lines = BTreeMap::new();
        for batch in self.batches(endpoint) {
            for (seq, text) in batch.lines {
                lines.insert(seq, text);
            }
        }
        lines
    }

    pub fn completion(&self, endpoint: &str) -> Option<LogBatch> {
        self.batches(endpoint)
            .into_iter()
            .find(|batch| batch.complete)
    }

    fn wait_for_release(&self) {
        let mut held = self.held.lock();
        while *held {
            self.released.wait(&mut held);
        }
    }
}

impl RemoteStore for RecordingStore {
    fn resume_status(
        &self,
        _entity: &str,
        _project: &str,
        run_name: &str,
    ) -> Result<Option<ResumeStatus>, StoreError> {
        let (delay, unreachable) = {
            let state = self.state.lock();
            (state.resume_delay, state.resume_unreachable)
        };
        if let Some(delay) = delay {
            thread::sleep(delay);
        }
        if unreachable {
            return Err(StoreError::Transient("lookup unavailable".to_string()));
        }
        Ok(self.state.lock().resume.get(run_name).cloned())
    }

    fn upsert_run(&self, run: &UpsertRun) -> Result<RunRecord, StoreError> {
        let mut state = self.state.lock();
        if state.upsert_failures > 0 {
            state.upsert_failures -= 1;
            return Err(StoreError::Transient("upsert timed out".to_string()));
        }
        if run.storage_id.is_none() && state.existing_runs.contains(&run.name) {
            return Err(StoreError::Conflict(format!("run {} exists", run.name)));
        }
        state.upserts.push(run.clone());
        state.existing_runs.insert(run.name.clone());
        let id = run
            .storage_id
            .clone()
            .unwrap_or_else(|| format!("store-{}", run.name));
        Ok(RunRecord { id })
    }

    fn update_config(&self, _storage_id: &str, config: &Value) -> Result<(), StoreError> {
        self.state.lock().configs.push(config.clone());
        Ok(())
    }

    fn update_summary(&self, _storage_id: &str, summary: &Value) -> Result<(), StoreError> {
        self.state.lock().summaries.push(summary.clone());
        Ok(())
    }

    fn push_file(
        &self,
        _project: &str,
        _run_name: &str,
        name: &str,
        source: &Path,
        progress: &mut dyn FnMut(u64, u64),
    ) -> Result<(), StoreError> {
        {
            let mut state = self.state.lock();
            let count = state.in_flight.entry(name.to_string()).or_insert(0);
            *count += 1;
            let current = *count;
            let max = state.max_in_flight.entry(name.to_string()).or_insert(0);
            *max = (*max).max(current);
        }
        self.wait_for_release();

        let result = (|| -> Result<u64, StoreError> {
            let mut state = self.state.lock();
            if let Some(err) = state.rejected_uploads.get(name) {
                return Err(err.clone());
            }
            if let Some(remaining) = state.transient_uploads.get_mut(name)
                && *remaining > 0
            {
                *remaining -= 1;
                return Err(StoreError::Transient(format!("upload of {name} reset")));
            }
            let contents = fs::read(source)
                .map_err(|e| StoreError::Transient(format!("read {}: {e}", source.display())))?;
            let len = contents.len() as u64;
            state.uploads.push((name.to_string(), contents));
            Ok(len)
        })();

        if let Some(count) = self.state.lock().in_flight.get_mut(name) {
            *count -= 1;
        }
        let len = result?;
        progress(len, len);
        Ok(())
    }

    fn push_log_lines(
        &self,
        _run_name: &str,
        endpoint: &str,
        batch: &LogBatch,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        if state.failing_posts > 0 {
            state.failing_posts -= 1;
            return Err(StoreError::Transient("post failed".to_string()));
        }
        state.batches.push((endpoint.to_string(), batch.clone()));
        Ok(())
    }

    fn download_urls(
        &self,
        _project: &str,
        _run_name: &str,
    ) -> Result<BTreeMap<String, RemoteFile>, StoreError> {
        let state = self.state.lock();
        let mut out = BTreeMap::new();
        for (name, contents) in &state.uploads {
            let digest = state
                .digest_overrides
                .get(name)
                .cloned()
                .unwrap_or_else(|| sha256_hex(contents));
            out.insert(
                name.clone(),
                RemoteFile {
                    url: format!("mem://{name}"),
                    digest,
                },
            );
        }
        Ok(out)
    }
}
