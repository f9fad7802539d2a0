//! Run lifecycle: initialize the run with the remote store, capture and wait for the user
//! process, then drain everything and report.

use std::fs;
use std::io::Read;
use std::path::Path;
use std::process::Command;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::anyhow;
use chrono::Utc;
use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};

use crate::context::RunContext;
use crate::core::lifecycle::{
    LookupOutcome, ResumeDecision, ResumeMode, RunLifecycleState, resume_decision,
    starting_step,
};
use crate::core::line_buffer::LineSource;
use crate::core::policy::SavePolicy;
use crate::dispatcher::{FileDispatcher, WatchedFileInfo};
use crate::error::{StoreError, SyncError};
use crate::exit_codes;
use crate::io::config::SyncConfig;
use crate::io::file_sha256;
use crate::io::metadata::{load_metadata, write_metadata};
use crate::io::process::{ManagedProcess, OutputCapture};
use crate::io::retry::Backoff;
use crate::io::run_state::{RunState, write_run_state};
use crate::io::store::{RemoteStore, ResumeStatus, UpsertRun};
use crate::io::stream_pusher::{PusherHandle, PusherOptions, StreamPusher};
use crate::io::tailer::TailStart;
use crate::io::tee::{Sink, Tee};
use crate::io::upload_queue::{UploadQueue, UploadTarget};
use crate::io::watcher::{DirWatcher, walk_files};
use crate::io::wire_channel::{WireClient, WireError, WireServer, WireSource};
use crate::policies::HandlerDeps;

/// Environment variable carrying the wire channel port to a launched process.
pub const PORT_ENV: &str = "RUNSYNC_PORT";
/// Environment variable carrying the run directory to a launched process.
pub const DIR_ENV: &str = "RUNSYNC_DIR";

/// Longest string shown for a summary value.
const SUMMARY_VALUE_WIDTH: usize = 20;

/// Run attributes sent with the upsert.
#[derive(Debug, Clone, Default)]
pub struct RunEnvironment {
    pub config: Value,
    pub description: Option<String>,
    pub host: Option<String>,
    pub program_path: Option<String>,
    pub repo_url: Option<String>,
    pub commit: Option<String>,
    pub sweep_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitOutcome {
    pub storage_id: String,
    pub resumed: bool,
    pub starting_step: u64,
}

/// Everything shutdown found out.
#[derive(Debug)]
pub struct ShutdownReport {
    pub exit_code: i32,
    pub state: RunLifecycleState,
    pub errors: Vec<SyncError>,
    pub uploaded_files: usize,
    pub uploaded_bytes: u64,
    pub verified_files: usize,
    /// Displayable `(key, value)` rows from the summary file.
    pub summary: Vec<(String, String)>,
    pub program: Option<String>,
}

impl ShutdownReport {
    pub fn synced(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn render(&self) -> String {
        let mut lines = Vec::new();
        if let Some(program) = &self.program {
            lines.push(format!("program: {program}"));
        }
        if !self.summary.is_empty() {
            let width = self
                .summary
                .iter()
                .map(|(key, _)| key.len())
                .max()
                .unwrap_or(0);
            lines.push("run summary:".to_string());
            for (key, value) in &self.summary {
                lines.push(format!("  {key:>width$} {value}"));
            }
        }
        lines.push(format!(
            "run {} (exit code {}), {} files uploaded ({} bytes), {} verified",
            self.state,
            self.exit_code,
            self.uploaded_files,
            self.uploaded_bytes,
            self.verified_files
        ));
        if self.synced() {
            lines.push("synced".to_string());
        } else {
            lines.push(format!("sync failed ({} errors):", self.errors.len()));
            for err in &self.errors {
                lines.push(format!("  - {err}"));
            }
        }
        lines.join("\n")
    }
}

pub struct RunManager {
    ctx: Arc<RunContext>,
    store: Arc<dyn RemoteStore>,
    config: Arc<SyncConfig>,
    queue: Arc<UploadQueue>,
    dispatcher: Arc<FileDispatcher>,
    run_state: RunState,
    console_start_line: u64,
    console: Option<StreamPusher>,
    tees: Vec<Tee>,
    watcher: Option<DirWatcher>,
    process: Option<ManagedProcess>,
    wire: Option<Box<dyn WireSource>>,
    program: Option<String>,
}

impl RunManager {
    pub fn new(
        ctx: Arc<RunContext>,
        store: Arc<dyn RemoteStore>,
        config: SyncConfig,
    ) -> Result<Self, SyncError> {
        fs::create_dir_all(ctx.run_dir()).map_err(|e| {
            SyncError::io(format!("create run directory {}", ctx.run_dir().display()), e)
        })?;
        let config = Arc::new(config);
        let queue = Arc::new(UploadQueue::new(
            Arc::clone(&store),
            UploadTarget {
                project: ctx.project.clone(),
                run_name: ctx.run_id.clone(),
            },
            config.upload.workers,
            Backoff::from(config.upload.retry),
        )?);
        let dispatcher = Arc::new(FileDispatcher::new(HandlerDeps {
            store: Arc::clone(&store),
            queue: Arc::clone(&queue),
            ctx: Arc::clone(&ctx),
            config: Arc::clone(&config),
        })?);
        let run_state = RunState {
            run_id: Some(ctx.run_id.clone()),
            ..RunState::default()
        };
        Ok(Self {
            ctx,
            store,
            config,
            queue,
            dispatcher,
            run_state,
            console_start_line: 0,
            console: None,
            tees: Vec::new(),
            watcher: None,
            process: None,
            wire: None,
            program: None,
        })
    }

    pub fn ctx(&self) -> &Arc<RunContext> {
        &self.ctx
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn queue(&self) -> &UploadQueue {
        &self.queue
    }

    pub fn dispatcher(&self) -> &FileDispatcher {
        &self.dispatcher
    }

    pub fn run_state(&self) -> &RunState {
        &self.run_state
    }

    pub fn watched(&self) -> Vec<WatchedFileInfo> {
        self.dispatcher.watched()
    }

    pub fn register_save_policy(&self, glob: &str, policy: SavePolicy) -> Result<(), SyncError> {
        self.dispatcher.register_save_policy(glob, policy)
    }

    /// Establish the run with the remote store, continuing an existing run when the resume
    /// mode allows it.
    #[instrument(skip_all, fields(run_id = %self.ctx.run_id, mode = ?self.config.resume.mode))]
    pub fn init_run(&mut self, env: &RunEnvironment) -> Result<InitOutcome, SyncError> {
        let mode = self.config.resume.mode;
        let (outcome, status) = match mode {
            ResumeMode::Never => (LookupOutcome::NotFound, None),
            _ => self.lookup_resume(),
        };
        let decision = resume_decision(mode, outcome, &self.ctx.run_id)?;
        let status = match decision {
            ResumeDecision::Resume => status,
            ResumeDecision::Fresh => None,
        };

        let upsert = UpsertRun {
            storage_id: status.as_ref().map(|s| s.storage_id.clone()),
            name: self.ctx.run_id.clone(),
            project: self.ctx.project.clone(),
            entity: self.ctx.entity.clone(),
            config: match status.as_ref().and_then(|s| s.config.as_ref()) {
                Some(remote) => restored_config(remote, &env.config),
                None => env.config.clone(),
            },
            description: env.description.clone(),
            host: env.host.clone(),
            program_path: env.program_path.clone(),
            repo_url: env.repo_url.clone(),
            commit: env.commit.clone(),
            sweep_name: env.sweep_name.clone(),
        };
        let backoff = Backoff::from(self.config.upload.retry);
        let record = backoff
            .retry("upsert run", || self.store.upsert_run(&upsert))
            .map_err(|err| match err {
                StoreError::Conflict(reason) if upsert.storage_id.is_none() => {
                    SyncError::ResumeConflict {
                        run_id: self.ctx.run_id.clone(),
                        reason,
                    }
                }
                other => SyncError::Launch(format!("upsert run {}: {other}", self.ctx.run_id)),
            })?;

        self.ctx.set_storage_id(record.id.clone());
        let mut step = 0;
        if let Some(status) = &status {
            self.ctx.set_resumed(true);
            self.seed_resumed_run(status)?;
            step = starting_step(&status.history_tail);
            self.console_start_line = status.log_line_count;
        }

        self.run_state.storage_id = Some(record.id.clone());
        self.run_state.resumed = status.is_some();
        self.run_state.starting_step = step;
        self.run_state.state = RunLifecycleState::Running;
        self.run_state.started_at = Some(Utc::now().to_rfc3339());
        write_run_state(&self.ctx.paths.run_state_path, &self.run_state)?;
        info!(storage_id = %record.id, resumed = status.is_some(), starting_step = step, "run initialized");

        Ok(InitOutcome {
            storage_id: record.id,
            resumed: status.is_some(),
            starting_step: step,
        })
    }

    fn lookup_resume(&self) -> (LookupOutcome, Option<ResumeStatus>) {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let store = Arc::clone(&self.store);
        let (entity, project, run_id) = (
            self.ctx.entity.clone(),
            self.ctx.project.clone(),
            self.ctx.run_id.clone(),
        );
        let spawned = thread::Builder::new()
            .name("resume-lookup".to_string())
            .spawn(move || {
                let _ = tx.send(store.resume_status(&entity, &project, &run_id));
            });
        if let Err(err) = spawned {
            warn!(err = %err, "could not start resume lookup");
            return (LookupOutcome::Unreachable, None);
        }
        let timeout = self.config.resume.lookup_timeout();
        match rx.recv_timeout(timeout) {
            Ok(Ok(Some(status))) => (LookupOutcome::Found, Some(status)),
            Ok(Ok(None)) => (LookupOutcome::NotFound, None),
            Ok(Err(err)) => {
                warn!(err = %err, "resume lookup failed");
                (LookupOutcome::Unreachable, None)
            }
            Err(_) => {
                warn!(timeout_secs = timeout.as_secs(), "resume lookup timed out");
                (LookupOutcome::Unreachable, None)
            }
        }
    }

    /// Recreate the local tails of the remote streams and continue them where the remote
    /// left off.
    fn seed_resumed_run(&self, status: &ResumeStatus) -> Result<(), SyncError> {
        let names = &self.config.policy.files;
        for (name, tail, count) in [
            (&names.history, &status.history_tail, status.history_line_count),
            (&names.events, &status.events_tail, status.events_line_count),
        ] {
            let path = self.ctx.path_of(name);
            if !path.exists() {
                let mut seed = tail.join("\n");
                if !seed.is_empty() {
                    seed.push('\n');
                }
                write_seed(&path, &seed)?;
            }
            self.dispatcher
                .open_text_stream(name, TailStart::End, count)?;
        }
        if let Some(config) = &status.config {
            let path = self.ctx.path_of(&names.config);
            if !path.exists() {
                let text = serde_yaml::to_string(config)
                    .map_err(|e| SyncError::Other(anyhow!("serialize remote config: {e}")))?;
                write_seed(&path, &text)?;
            }
        }
        if let Some(summary) = &status.summary {
            let path = self.ctx.path_of(&names.summary);
            if !path.exists() {
                let text = serde_json::to_string_pretty(summary)
                    .map_err(|e| SyncError::Other(anyhow!("serialize remote summary: {e}")))?;
                write_seed(&path, &text)?;
            }
        }
        Ok(())
    }

    fn start_watching(&mut self) -> Result<(), SyncError> {
        let dispatcher = Arc::clone(&self.dispatcher);
        let watch = &self.config.watch;
        let watcher = DirWatcher::start(
            self.ctx.run_dir(),
            watch.poll_interval(),
            watch.compare_contents,
            move |path| dispatcher.dispatch(path),
        )?;
        self.watcher = Some(watcher);
        Ok(())
    }

    fn start_console(&mut self) -> Result<PusherHandle, SyncError> {
        let names = &self.config.policy.files;
        let mut options = PusherOptions::from_config(names.output.clone(), &self.config.stream);
        options.start_line = self.console_start_line;
        options.timestamps = self.config.stream.timestamp_console;
        options.spill_path = Some(self.ctx.path_of(&names.output));
        let pusher = StreamPusher::start(Arc::clone(&self.store), &self.ctx.run_id, options)?;
        let handle = pusher.handle();
        self.console = Some(pusher);
        Ok(handle)
    }

    fn tee_output(
        &mut self,
        name: &str,
        reader: impl Read + Send + 'static,
        console: &PusherHandle,
        source: LineSource,
        terminal: Option<Sink>,
    ) -> Result<(), SyncError> {
        let mut sinks: Vec<Sink> = Vec::new();
        if let Some(terminal) = terminal {
            sinks.push(terminal);
        }
        sinks.push(Box::new(console.writer(source)));
        self.tees.push(Tee::spawn(name, reader, sinks)?);
        Ok(())
    }

    /// Launch the user program with its output captured and the run directory watched.
    #[instrument(skip_all, fields(program = %program))]
    pub fn run_user_process(&mut self, program: &str, args: &[String]) -> Result<(), SyncError> {
        let server = WireServer::bind()
            .map_err(|e| SyncError::Launch(format!("bind wire channel: {e}")))?;
        let port = server
            .port()
            .map_err(|e| SyncError::Launch(format!("read wire channel port: {e}")))?;

        let command_line = std::iter::once(program.to_string())
            .chain(args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ");
        let console = self.start_console()?;
        console.write(LineSource::Plain, format!("{command_line}\n").as_bytes())?;
        self.start_watching()?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .env(PORT_ENV, port.to_string())
            .env(DIR_ENV, self.ctx.run_dir());
        let spawned = ManagedProcess::spawn(cmd, OutputCapture::Pipe)
            .map_err(|e| SyncError::Launch(format!("{e:#}")))?;
        if let Some(stdout) = spawned.stdout {
            self.tee_output(
                "stdout",
                stdout,
                &console,
                LineSource::Stdout,
                Some(Box::new(std::io::stdout())),
            )?;
        }
        if let Some(stderr) = spawned.stderr {
            self.tee_output(
                "stderr",
                stderr,
                &console,
                LineSource::Stderr,
                Some(Box::new(std::io::stderr())),
            )?;
        }
        info!(pid = spawned.process.pid(), port, "user process started");
        self.process = Some(spawned.process);
        self.wire = Some(Box::new(server));
        self.program = Some(command_line);
        Ok(())
    }

    /// Sync for a process that is already running. `READY` goes out on the wire once output
    /// capture and the watcher are in place.
    #[instrument(skip_all, fields(pid = pid))]
    pub fn attach_to_existing_process(
        &mut self,
        pid: u32,
        stdout: Option<Box<dyn Read + Send>>,
        stderr: Option<Box<dyn Read + Send>>,
        wire: Option<WireClient>,
    ) -> Result<(), SyncError> {
        let process =
            ManagedProcess::attach(pid).map_err(|e| SyncError::Launch(format!("{e:#}")))?;
        if stdout.is_some() || stderr.is_some() {
            let console = self.start_console()?;
            if let Some(stdout) = stdout {
                self.tee_output("stdout", stdout, &console, LineSource::Stdout, None)?;
            }
            if let Some(stderr) = stderr {
                self.tee_output("stderr", stderr, &console, LineSource::Stderr, None)?;
            }
        }
        self.start_watching()?;
        self.process = Some(process);

        if let Some(mut client) = wire {
            if let Err(err) = client.ready() {
                warn!(err = %err, "could not signal ready");
            }
            self.wire = Some(Box::new(client));
        }
        info!(pid, "attached to user process");
        Ok(())
    }

    /// Wait for the user process to finish. Setting `interrupt` stops it.
    #[instrument(skip_all)]
    pub fn await_completion(&mut self, interrupt: &AtomicBool) -> Result<i32, SyncError> {
        if self.process.is_none() {
            return Err(SyncError::Other(anyhow!("no user process to wait for")));
        }
        let poll = self.config.process.control_poll();
        loop {
            if interrupt.load(Ordering::Acquire) {
                return Ok(self.stop_after_interrupt());
            }
            let timeout = match self.wire.as_mut() {
                Some(wire) => {
                    match wire.recv(poll) {
                        Ok(msg) => match msg.exit_code_or_default() {
                            Some(code) => {
                                info!(code, "done received on wire channel");
                                return Ok(code);
                            }
                            None => debug!("peer ready"),
                        },
                        Err(WireError::Timeout) => {}
                        Err(err) => {
                            warn!(err = %err, "wire channel unusable; polling the process");
                            self.wire = None;
                        }
                    }
                    Duration::ZERO
                }
                None => poll,
            };
            let Some(process) = self.process.as_mut() else {
                return Err(SyncError::Other(anyhow!("user process handle lost")));
            };
            if let Some(code) = process.wait_for(timeout)? {
                info!(code, "user process exited");
                return Ok(code);
            }
        }
    }

    fn stop_after_interrupt(&mut self) -> i32 {
        let grace = self.config.process.kill_grace();
        let Some(process) = self.process.as_mut() else {
            return exit_codes::KILLED;
        };
        warn!(pid = process.pid(), "interrupted; stopping user process");
        match process.terminate(grace) {
            Ok(Some(_)) => exit_codes::KILLED,
            Ok(None) => {
                error!(pid = process.pid(), "user process did not stop");
                exit_codes::UNKNOWN
            }
            Err(err) => {
                error!(err = %format!("{err:#}"), "could not stop user process");
                exit_codes::UNKNOWN
            }
        }
    }

    /// Drain everything and record the outcome. Every step runs even when an earlier one
    /// failed; failures are collected into the report.
    #[instrument(skip_all, fields(run_id = %self.ctx.run_id, exit_code = exit_code))]
    pub fn shutdown(&mut self, exit_code: i32) -> ShutdownReport {
        let mut errors = Vec::new();
        let state = RunLifecycleState::from_exit_code(exit_code);

        for tee in self.tees.drain(..) {
            if let Err(err) = tee.join() {
                errors.push(SyncError::Other(err));
            }
        }
        if let Err(err) = self.record_exit(exit_code) {
            errors.push(err);
        }

        if let Some(watcher) = self.watcher.take()
            && let Err(err) = watcher.stop()
        {
            errors.push(SyncError::Other(err));
        }
        for path in walk_files(self.ctx.run_dir()) {
            if let Err(err) = self.dispatcher.notice(&path) {
                errors.push(err);
            }
        }
        errors.extend(self.dispatcher.finish_all());

        if let Some(console) = self.console.take()
            && let Err(err) = console.finish(Some(exit_code))
        {
            errors.push(err);
        }
        if let Err(err) = self.queue.finish() {
            errors.push(err);
        }

        let (verified_files, mismatches) = self.verify();
        errors.extend(mismatches);

        let stats = self.queue.stats();
        self.run_state.state = state;
        self.run_state.exit_code = Some(exit_code);
        self.run_state.finished_at = Some(Utc::now().to_rfc3339());
        self.run_state.uploaded_files = stats.uploaded_files;
        self.run_state.sync_errors = errors.iter().map(ToString::to_string).collect();
        if let Err(err) = write_run_state(&self.ctx.paths.run_state_path, &self.run_state) {
            errors.push(SyncError::Other(err));
        }

        let summary = self.summary_rows();
        info!(
            state = %state,
            uploaded = stats.uploaded_files,
            verified = verified_files,
            errors = errors.len(),
            "run shut down"
        );
        ShutdownReport {
            exit_code,
            state,
            errors,
            uploaded_files: stats.uploaded_files,
            uploaded_bytes: stats.uploaded_bytes,
            verified_files,
            summary,
            program: self.program.clone(),
        }
    }

    fn record_exit(&mut self, exit_code: i32) -> Result<(), SyncError> {
        let path = self.ctx.path_of(&self.config.policy.files.metadata);
        let mut meta = load_metadata(&path)?.unwrap_or_default();
        meta.record_exit(exit_code);
        if meta.program.is_none() {
            meta.program.clone_from(&self.program);
        }
        if self.program.is_none() {
            self.program.clone_from(&meta.program);
        }
        write_metadata(&path, &meta)?;
        self.dispatcher.file_changed(&path)?;
        Ok(())
    }

    /// Compare the remote digest of every uploaded file with the local file.
    fn verify(&self) -> (usize, Vec<SyncError>) {
        let uploaded = self.queue.uploaded();
        if uploaded.is_empty() {
            return (0, Vec::new());
        }
        let remote = match self
            .store
            .download_urls(&self.ctx.project, &self.ctx.run_id)
        {
            Ok(remote) => remote,
            Err(err) => return (0, vec![SyncError::store("list uploaded files", err)]),
        };
        let mut verified = 0;
        let mut errors = Vec::new();
        for (name, path) in uploaded {
            if !path.exists() {
                debug!(name = %name, "uploaded file moved or removed locally; not verified");
                continue;
            }
            let local = match file_sha256(&path) {
                Ok(digest) => digest,
                Err(err) => {
                    errors.push(SyncError::Other(err.context(format!("verify {name}"))));
                    continue;
                }
            };
            match remote.get(&name) {
                Some(file) if file.digest == local => verified += 1,
                Some(file) => errors.push(SyncError::VerificationMismatch {
                    name,
                    local,
                    remote: file.digest.clone(),
                }),
                None => errors.push(SyncError::VerificationMismatch {
                    name,
                    local,
                    remote: "missing".to_string(),
                }),
            }
        }
        debug!(verified, mismatched = errors.len(), "verification pass done");
        (verified, errors)
    }

    fn summary_rows(&self) -> Vec<(String, String)> {
        let path = self.ctx.path_of(&self.config.policy.files.summary);
        let Ok(text) = fs::read_to_string(&path) else {
            return Vec::new();
        };
        match serde_json::from_str::<Value>(&text) {
            Ok(value) => summary_rows(&value),
            Err(err) => {
                warn!(path = %path.display(), err = %err, "summary is not valid json");
                Vec::new()
            }
        }
    }
}

/// Config of a resumed run: the remote keys with the local ones laid over them.
fn restored_config(remote: &Value, local: &Value) -> Value {
    match (remote, local) {
        (Value::Object(remote), Value::Object(local)) => {
            let mut merged = remote.clone();
            merged.extend(local.iter().map(|(key, value)| (key.clone(), value.clone())));
            Value::Object(merged)
        }
        (_, Value::Null) => remote.clone(),
        _ => local.clone(),
    }
}

fn write_seed(path: &Path, contents: &str) -> Result<(), SyncError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| SyncError::io(format!("create {}", parent.display()), e))?;
    }
    fs::write(path, contents).map_err(|e| SyncError::io(format!("seed {}", path.display()), e))
}

/// Scalar top-level summary entries, sorted by key. Keys starting with `_` are internal.
pub fn summary_rows(summary: &Value) -> Vec<(String, String)> {
    let Some(map) = summary.as_object() else {
        return Vec::new();
    };
    let mut rows: Vec<(String, String)> = map
        .iter()
        .filter(|(key, _)| !key.starts_with('_'))
        .filter_map(|(key, value)| {
            let shown = match value {
                Value::String(s) if s.chars().count() > SUMMARY_VALUE_WIDTH => {
                    let head: String = s.chars().take(SUMMARY_VALUE_WIDTH - 3).collect();
                    format!("{head}...")
                }
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                _ => return None,
            };
            Some((key.clone(), shown))
        })
        .collect();
    rows.sort();
    rows
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::test_support::{RecordingStore, fast_config};

    fn manager(store: &Arc<RecordingStore>, config: SyncConfig) -> (tempfile::TempDir, RunManager) {
        let temp = tempfile::tempdir().expect("tempdir");
        let ctx = Arc::new(RunContext::new("run1", "me", "proj", &temp.path().join("run")));
        let manager = RunManager::new(ctx, Arc::clone(store) as Arc<dyn RemoteStore>, config)
            .expect("manager");
        (temp, manager)
    }

    #[test]
    fn summary_rows_truncate_and_skip_nested_values() {
        let rows = summary_rows(&json!({
            "loss": 0.25,
            "name": "a very long run description indeed",
            "_runtime": 12,
            "table": {"rows": 3},
            "done": true,
        }));
        assert_eq!(
            rows,
            vec![
                ("done".to_string(), "true".to_string()),
                ("loss".to_string(), "0.25".to_string()),
                ("name".to_string(), "a very long run d...".to_string()),
            ]
        );
    }

    #[test]
    fn render_distinguishes_synced_from_failed() {
        let mut report = ShutdownReport {
            exit_code: 0,
            state: RunLifecycleState::Finished,
            errors: Vec::new(),
            uploaded_files: 2,
            uploaded_bytes: 10,
            verified_files: 2,
            summary: vec![("loss".to_string(), "0.1".to_string())],
            program: Some("train.py".to_string()),
        };
        let text = report.render();
        assert!(text.contains("program: train.py"));
        assert!(text.ends_with("synced"));

        report.errors.push(SyncError::VerificationMismatch {
            name: "model.bin".to_string(),
            local: "aa".to_string(),
            remote: "bb".to_string(),
        });
        let text = report.render();
        assert!(text.contains("sync failed"));
        assert!(text.contains("model.bin"));
    }

    #[test]
    fn fresh_run_upserts_and_persists_state() {
        let store = Arc::new(RecordingStore::new());
        let (_temp, mut manager) = manager(&store, fast_config());
        let outcome = manager
            .init_run(&RunEnvironment {
                config: json!({"lr": 0.1}),
                ..RunEnvironment::default()
            })
            .expect("init");
        assert_eq!(
            outcome,
            InitOutcome {
                storage_id: "store-run1".to_string(),
                resumed: false,
                starting_step: 0,
            }
        );
        assert_eq!(store.upserts()[0].config, json!({"lr": 0.1}));
        assert_eq!(manager.run_state().state, RunLifecycleState::Running);
        assert!(manager.ctx().paths.run_state_path.exists());
        let report = manager.shutdown(0);
        assert!(report.synced(), "{}", report.render());
    }

    #[test]
    fn resumed_run_restores_the_remote_config() {
        let status = ResumeStatus {
            storage_id: "remote-7".to_string(),
            config: Some(json!({"lr": 0.1, "epochs": 10})),
            ..ResumeStatus::default()
        };
        let store = Arc::new(RecordingStore::new().with_resume("run1", status));
        let mut config = fast_config();
        config.resume.mode = ResumeMode::Must;
        let (_temp, mut manager) = manager(&store, config);
        manager
            .init_run(&RunEnvironment {
                config: json!({"epochs": 20}),
                ..RunEnvironment::default()
            })
            .expect("resume");

        assert_eq!(store.upserts()[0].config, json!({"lr": 0.1, "epochs": 20}));
        let seeded = fs::read_to_string(manager.ctx().path_of("config.yaml")).expect("seeded");
        let seeded: Value = serde_yaml::from_str(&seeded).expect("yaml");
        assert_eq!(seeded, json!({"lr": 0.1, "epochs": 10}));
        manager.shutdown(0);
    }

    #[test]
    fn restored_config_keeps_remote_when_nothing_is_local() {
        let remote = json!({"lr": 0.1});
        assert_eq!(restored_config(&remote, &Value::Null), remote);
        assert_eq!(
            restored_config(&remote, &json!({"lr": 0.2, "bs": 8})),
            json!({"lr": 0.2, "bs": 8})
        );
    }

    #[test]
    fn never_mode_conflicts_with_existing_run() {
        let store = Arc::new(RecordingStore::new().with_existing_run("run1"));
        let (_temp, mut manager) = manager(&store, fast_config());
        let err = manager
            .init_run(&RunEnvironment::default())
            .expect_err("conflict");
        assert!(matches!(err, SyncError::ResumeConflict { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn slow_lookup_starts_fresh_in_auto_mode() {
        let store = Arc::new(RecordingStore::new());
        store.delay_resume_lookup(Duration::from_secs(3));
        let mut config = fast_config();
        config.resume.mode = ResumeMode::Auto;
        config.resume.lookup_timeout_secs = 1;
        let (_temp, mut manager) = manager(&store, config);
        let outcome = manager
            .init_run(&RunEnvironment::default())
            .expect("init");
        assert!(!outcome.resumed);
    }

    #[test]
    fn unreachable_lookup_fails_must_mode() {
        let store = Arc::new(RecordingStore::new());
        store.make_resume_unreachable();
        let mut config = fast_config();
        config.resume.mode = ResumeMode::Must;
        let (_temp, mut manager) = manager(&store, config);
        let err = manager
            .init_run(&RunEnvironment::default())
            .expect_err("launch");
        assert!(matches!(err, SyncError::Launch(_)));
    }

    #[test]
    fn transient_upsert_failures_are_retried() {
        let store = Arc::new(RecordingStore::new());
        store.fail_next_upserts(2);
        let (_temp, mut manager) = manager(&store, fast_config());
        manager
            .init_run(&RunEnvironment::default())
            .expect("init after retries");
        assert_eq!(store.upserts().len(), 1);
    }

    #[test]
    fn upsert_failures_past_the_retry_budget_fail_launch() {
        let store = Arc::new(RecordingStore::new());
        store.fail_next_upserts(10);
        let (_temp, mut manager) = manager(&store, fast_config());
        let err = manager
            .init_run(&RunEnvironment::default())
            .expect_err("launch");
        assert!(matches!(err, SyncError::Launch(_)));
    }
}
