//! Remote store contract and a directory-backed implementation.
//!
//! Every engine component talks to the remote through [`RemoteStore`]. Calls are blocking
//! and may be made from any thread. [`MirrorStore`] keeps the same data in a local
//! directory tree, which makes a run inspectable without a server:
//!
//! ```text
//! <root>/<project>/<run name>/
//!     run.json                  upserted run record
//!     config.json, summary.json structured updates
//!     files/<logical name>      uploaded files
//!     streams/<endpoint>.jsonl  appended `[seq, text]` records, last write wins
//!     streams/<endpoint>.complete.json
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use walkdir::WalkDir;

use crate::core::policy::RunFileNames;
use crate::error::StoreError;

/// Number of trailing history/events lines returned by a resume lookup.
pub const TAIL_LINES: usize = 10;

/// Remote state of an existing run, used to continue it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResumeStatus {
    pub storage_id: String,
    pub history_tail: Vec<String>,
    pub events_tail: Vec<String>,
    pub history_line_count: u64,
    pub events_line_count: u64,
    pub log_line_count: u64,
    pub summary: Option<Value>,
    pub config: Option<Value>,
}

/// Run record sent at initialization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpsertRun {
    /// Set when continuing an existing run.
    pub storage_id: Option<String>,
    pub name: String,
    pub project: String,
    pub entity: String,
    pub config: Value,
    pub description: Option<String>,
    pub host: Option<String>,
    pub program_path: Option<String>,
    pub repo_url: Option<String>,
    pub commit: Option<String>,
    pub sweep_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRecord {
    pub id: String,
}

/// One post to a line-oriented remote endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogBatch {
    /// `(sequence number, text)` pairs; a repeated number overwrites the earlier line.
    pub lines: Vec<(u64, String)>,
    /// Final post of the stream.
    pub complete: bool,
    pub exit_code: Option<i32>,
}

impl LogBatch {
    pub fn heartbeat() -> Self {
        Self::default()
    }

    pub fn is_heartbeat(&self) -> bool {
        self.lines.is_empty() && !self.complete
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    pub url: String,
    /// Hex SHA-256 of the stored contents.
    pub digest: String,
}

pub trait RemoteStore: Send + Sync {
    fn resume_status(
        &self,
        entity: &str,
        project: &str,
        run_name: &str,
    ) -> Result<Option<ResumeStatus>, StoreError>;

    fn upsert_run(&self, run: &UpsertRun) -> Result<RunRecord, StoreError>;

    fn update_config(&self, storage_id: &str, config: &Value) -> Result<(), StoreError>;

    fn update_summary(&self, storage_id: &str, summary: &Value) -> Result<(), StoreError>;

    /// Upload `source` as `name`. `progress` receives `(bytes sent, total bytes)`.
    fn push_file(
        &self,
        project: &str,
        run_name: &str,
        name: &str,
        source: &Path,
        progress: &mut dyn FnMut(u64, u64),
    ) -> Result<(), StoreError>;

    fn push_log_lines(
        &self,
        run_name: &str,
        endpoint: &str,
        batch: &LogBatch,
    ) -> Result<(), StoreError>;

    fn download_urls(
        &self,
        project: &str,
        run_name: &str,
    ) -> Result<BTreeMap<String, RemoteFile>, StoreError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct StreamCompletion {
    exit_code: Option<i32>,
}

/// [`RemoteStore`] backed by a local directory.
pub struct MirrorStore {
    root: PathBuf,
    names: RunFileNames,
    runs_by_id: Mutex<HashMap<String, PathBuf>>,
    runs_by_name: Mutex<HashMap<String, PathBuf>>,
    stream_lock: Mutex<()>,
}

impl MirrorStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            names: RunFileNames::default(),
            runs_by_id: Mutex::new(HashMap::new()),
            runs_by_name: Mutex::new(HashMap::new()),
            stream_lock: Mutex::new(()),
        }
    }

    /// Stream endpoints to read on resume lookups.
    pub fn with_file_names(mut self, names: RunFileNames) -> Self {
        self.names = names;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn run_dir(&self, project: &str, run_name: &str) -> PathBuf {
        self.root.join(project).join(run_name)
    }

    /// Resolved contents of a stream, keyed by sequence number.
    pub fn stream_lines(
        &self,
        project: &str,
        run_name: &str,
        endpoint: &str,
    ) -> Result<BTreeMap<u64, String>, StoreError> {
        read_stream(&stream_path(&self.run_dir(project, run_name), endpoint))
    }

    fn remember(&self, dir: &Path, id: &str, name: &str) {
        self.runs_by_id.lock().insert(id.to_string(), dir.to_path_buf());
        self.runs_by_name
            .lock()
            .insert(name.to_string(), dir.to_path_buf());
    }

    fn dir_for_id(&self, storage_id: &str) -> Result<PathBuf, StoreError> {
        if let Some(dir) = self.runs_by_id.lock().get(storage_id) {
            return Ok(dir.clone());
        }
        for record in self.run_records() {
            if let Ok(run) = read_run(&record)
                && run.storage_id.as_deref() == Some(storage_id)
                && let Some(dir) = record.parent()
            {
                self.remember(dir, storage_id, &run.name);
                return Ok(dir.to_path_buf());
            }
        }
        Err(not_found(format!("unknown run id {storage_id}")))
    }

    fn dir_for_name(&self, run_name: &str) -> Result<PathBuf, StoreError> {
        if let Some(dir) = self.runs_by_name.lock().get(run_name) {
            return Ok(dir.clone());
        }
        self.run_records()
            .into_iter()
            .filter_map(|record| record.parent().map(Path::to_path_buf))
            .find(|dir| dir.file_name().is_some_and(|name| name == run_name))
            .ok_or_else(|| not_found(format!("unknown run {run_name}")))
    }

    fn run_records(&self) -> Vec<PathBuf> {
        WalkDir::new(&self.root)
            .min_depth(3)
            .max_depth(3)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file() && entry.file_name() == "run.json")
            .map(walkdir::DirEntry::into_path)
            .collect()
    }
}

impl RemoteStore for MirrorStore {
    fn resume_status(
        &self,
        _entity: &str,
        project: &str,
        run_name: &str,
    ) -> Result<Option<ResumeStatus>, StoreError> {
        let dir = self.run_dir(project, run_name);
        let record = dir.join("run.json");
        if !record.exists() {
            return Ok(None);
        }
        let run = read_run(&record)?;
        let storage_id = run
            .storage_id
            .ok_or_else(|| transient(format!("{} has no id", record.display())))?;
        self.remember(&dir, &storage_id, run_name);

        let history = read_stream(&stream_path(&dir, &self.names.history))?;
        let events = read_stream(&stream_path(&dir, &self.names.events))?;
        let output = read_stream(&stream_path(&dir, &self.names.output))?;
        Ok(Some(ResumeStatus {
            storage_id,
            history_tail: tail(&history),
            events_tail: tail(&events),
            history_line_count: line_count(&history),
            events_line_count: line_count(&events),
            log_line_count: line_count(&output),
            summary: read_json(&dir.join("summary.json"))?,
            config: read_json(&dir.join("config.json"))?,
        }))
    }

    fn upsert_run(&self, run: &UpsertRun) -> Result<RunRecord, StoreError> {
        let dir = self.run_dir(&run.project, &run.name);
        let record_path = dir.join("run.json");
        let existing = if record_path.exists() {
            Some(read_run(&record_path)?)
        } else {
            None
        };
        let id = match (&run.storage_id, existing) {
            (None, Some(_)) => {
                return Err(StoreError::Conflict(format!(
                    "run {} already exists in {}",
                    run.name, run.project
                )));
            }
            (Some(id), Some(existing)) if existing.storage_id.as_deref() != Some(id) => {
                return Err(StoreError::Conflict(format!(
                    "run {} belongs to a different id",
                    run.name
                )));
            }
            (Some(id), _) => id.clone(),
            (None, None) => generate_id(),
        };

        let mut stored = run.clone();
        stored.storage_id = Some(id.clone());
        write_json(&record_path, &serde_json::to_value(&stored).map_err(json_err)?)?;
        write_json(&dir.join("config.json"), &run.config)?;
        self.remember(&dir, &id, &run.name);
        debug!(run = %run.name, id = %id, "upserted run");
        Ok(RunRecord { id })
    }

    fn update_config(&self, storage_id: &str, config: &Value) -> Result<(), StoreError> {
        let dir = self.dir_for_id(storage_id)?;
        write_json(&dir.join("config.json"), config)
    }

    fn update_summary(&self, storage_id: &str, summary: &Value) -> Result<(), StoreError> {
        let dir = self.dir_for_id(storage_id)?;
        write_json(&dir.join("summary.json"), summary)
    }

    fn push_file(
        &self,
        project: &str,
        run_name: &str,
        name: &str,
        source: &Path,
        progress: &mut dyn FnMut(u64, u64),
    ) -> Result<(), StoreError> {
        let dest = self.run_dir(project, run_name).join("files").join(name);
        let parent = dest
            .parent()
            .ok_or_else(|| transient(format!("bad file name {name}")))?;
        fs::create_dir_all(parent).map_err(|e| io_err("create files dir", e))?;

        let mut input = File::open(source).map_err(|e| io_err(&source.display().to_string(), e))?;
        let total = input
            .metadata()
            .map_err(|e| io_err("stat upload source", e))?
            .len();
        let tmp = part_path(&dest);
        let mut output = File::create(&tmp).map_err(|e| io_err("create upload", e))?;
        let mut buf = [0u8; 64 * 1024];
        let mut sent = 0u64;
        progress(0, total);
        loop {
            let n = input.read(&mut buf).map_err(|e| io_err("read upload", e))?;
            if n == 0 {
                break;
            }
            output
                .write_all(&buf[..n])
                .map_err(|e| io_err("write upload", e))?;
            sent += n as u64;
            progress(sent, total.max(sent));
        }
        output.flush().map_err(|e| io_err("flush upload", e))?;
        fs::rename(&tmp, &dest).map_err(|e| io_err("finalize upload", e))?;
        Ok(())
    }

    fn push_log_lines(
        &self,
        run_name: &str,
        endpoint: &str,
        batch: &LogBatch,
    ) -> Result<(), StoreError> {
        let dir = self.dir_for_name(run_name)?;
        let path = stream_path(&dir, endpoint);
        let _guard = self.stream_lock.lock();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| io_err("create streams dir", e))?;
        }
        if !batch.lines.is_empty() {
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(|e| io_err("open stream", e))?;
            let mut buf = String::new();
            for record in &batch.lines {
                buf.push_str(&serde_json::to_string(record).map_err(json_err)?);
                buf.push('\n');
            }
            file.write_all(buf.as_bytes())
                .map_err(|e| io_err("append stream", e))?;
        }
        if batch.complete {
            let completion = StreamCompletion {
                exit_code: batch.exit_code,
            };
            write_json(
                &path.with_extension("complete.json"),
                &serde_json::to_value(completion).map_err(json_err)?,
            )?;
        }
        Ok(())
    }

    fn download_urls(
        &self,
        project: &str,
        run_name: &str,
    ) -> Result<BTreeMap<String, RemoteFile>, StoreError> {
        let files = self.run_dir(project, run_name).join("files");
        let mut out = BTreeMap::new();
        if !files.exists() {
            return Ok(out);
        }
        for entry in WalkDir::new(&files).into_iter().filter_map(Result::ok) {
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(rel) = entry.path().strip_prefix(&files) else {
                continue;
            };
            let name = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            let digest =
                super::file_sha256(entry.path()).map_err(|e| transient(format!("{e:#}")))?;
            out.insert(
                name,
                RemoteFile {
                    url: format!("file://{}", entry.path().display()),
                    digest,
                },
            );
        }
        Ok(out)
    }
}

fn stream_path(run_dir: &Path, endpoint: &str) -> PathBuf {
    run_dir
        .join("streams")
        .join(format!("{}.jsonl", endpoint.replace('/', "__")))
}

fn read_stream(path: &Path) -> Result<BTreeMap<u64, String>, StoreError> {
    let mut lines = BTreeMap::new();
    if !path.exists() {
        return Ok(lines);
    }
    let file = File::open(path).map_err(|e| io_err("open stream", e))?;
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|e| io_err("read stream", e))?;
        if line.trim().is_empty() {
            continue;
        }
        let (seq, text): (u64, String) = serde_json::from_str(&line).map_err(json_err)?;
        lines.insert(seq, text);
    }
    Ok(lines)
}

fn tail(lines: &BTreeMap<u64, String>) -> Vec<String> {
    let skip = lines.len().saturating_sub(TAIL_LINES);
    lines.values().skip(skip).cloned().collect()
}

fn line_count(lines: &BTreeMap<u64, String>) -> u64 {
    lines.keys().next_back().copied().unwrap_or(0)
}

fn read_run(path: &Path) -> Result<UpsertRun, StoreError> {
    let contents = fs::read_to_string(path).map_err(|e| io_err("read run record", e))?;
    serde_json::from_str(&contents).map_err(json_err)
}

fn read_json(path: &Path) -> Result<Option<Value>, StoreError> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(path).map_err(|e| io_err("read json", e))?;
    serde_json::from_str(&contents).map(Some).map_err(json_err)
}

fn write_json(path: &Path, value: &Value) -> Result<(), StoreError> {
    let mut buf = serde_json::to_string_pretty(value).map_err(json_err)?;
    buf.push('\n');
    super::write_atomic(path, &buf).map_err(|e| transient(format!("{e:#}")))
}

fn generate_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect::<String>()
        .to_lowercase()
}

/// In-progress upload file next to `dest`; the full file name is kept so siblings that
/// differ only by extension never share it.
fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    dest.with_file_name(name)
}

fn transient(message: String) -> StoreError {
    StoreError::Transient(message)
}

fn not_found(message: String) -> StoreError {
    StoreError::Rejected {
        status: 404,
        message,
    }
}

fn io_err(context: &str, err: std::io::Error) -> StoreError {
    StoreError::Transient(format!("{context}: {err}"))
}

fn json_err(err: serde_json::Error) -> StoreError {
    StoreError::Rejected {
        status: 400,
        message: err.to_string(),
    }
}
