//! Per-file upload handlers, one variant per [`PolicyKind`].
//!
//! A handler is built the first time its logical name is seen, receives every later change
//! event through [`FileHandler::on_change`], and is finished once when the run shuts down.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};

use anyhow::{Context, anyhow};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::context::RunContext;
use crate::core::line_buffer::LineSource;
use crate::core::policy::{PolicyKind, min_wait_for_size};
use crate::error::SyncError;
use crate::io::config::SyncConfig;
use crate::io::retry::Backoff;
use crate::io::store::RemoteStore;
use crate::io::stream_pusher::{PushStats, PusherOptions, StreamPusher};
use crate::io::tailer::{FileTailer, TailStart};
use crate::io::upload_queue::{UploadQueue, UploadTask};

/// Everything a handler may talk to.
#[derive(Clone)]
pub struct HandlerDeps {
    pub store: Arc<dyn RemoteStore>,
    pub queue: Arc<UploadQueue>,
    pub ctx: Arc<RunContext>,
    pub config: Arc<SyncConfig>,
}

pub enum FileHandler {
    TextStream(TextStreamHandler),
    Config(StructuredHandler),
    Summary(StructuredHandler),
    Immediate(ImmediateHandler),
    Deferred(DeferredHandler),
    Throttled(ThrottledHandler),
}

impl FileHandler {
    /// Build the handler for `kind`. Text streams start reading at the beginning of the file.
    pub fn build(
        kind: PolicyKind,
        logical_name: &str,
        path: &Path,
        deps: &HandlerDeps,
    ) -> Result<Self, SyncError> {
        let handler = match kind {
            PolicyKind::TextStream => FileHandler::TextStream(TextStreamHandler::open(
                logical_name,
                path,
                TailStart::Beginning,
                0,
                deps,
            )?),
            PolicyKind::Config => FileHandler::Config(StructuredHandler::start(
                StructuredKind::Config,
                logical_name,
                path,
                deps,
            )?),
            PolicyKind::Summary => FileHandler::Summary(StructuredHandler::start(
                StructuredKind::Summary,
                logical_name,
                path,
                deps,
            )?),
            PolicyKind::Immediate => {
                FileHandler::Immediate(ImmediateHandler::new(logical_name, path, deps))
            }
            PolicyKind::Deferred => {
                FileHandler::Deferred(DeferredHandler::new(logical_name, path, deps))
            }
            PolicyKind::Throttled => {
                FileHandler::Throttled(ThrottledHandler::new(logical_name, path, deps))
            }
        };
        Ok(handler)
    }

    pub fn kind(&self) -> PolicyKind {
        match self {
            FileHandler::TextStream(_) => PolicyKind::TextStream,
            FileHandler::Config(_) => PolicyKind::Config,
            FileHandler::Summary(_) => PolicyKind::Summary,
            FileHandler::Immediate(_) => PolicyKind::Immediate,
            FileHandler::Deferred(_) => PolicyKind::Deferred,
            FileHandler::Throttled(_) => PolicyKind::Throttled,
        }
    }

    pub fn on_change(&mut self) -> Result<(), SyncError> {
        match self {
            // The tail reader follows the file on its own.
            FileHandler::TextStream(_) => Ok(()),
            FileHandler::Config(handler) | FileHandler::Summary(handler) => {
                handler.on_change();
                Ok(())
            }
            FileHandler::Immediate(handler) => handler.on_change(),
            FileHandler::Deferred(handler) => {
                handler.on_change();
                Ok(())
            }
            FileHandler::Throttled(handler) => handler.on_change(Instant::now()),
        }
    }

    /// Follow the file to a new name and path. Only whole-file upload handlers can move;
    /// returns `false` and leaves the handler untouched for the others.
    pub fn rename(&mut self, logical_name: &str, path: &Path) -> bool {
        let (name, target) = match self {
            FileHandler::Immediate(handler) => (&mut handler.logical_name, &mut handler.path),
            FileHandler::Deferred(handler) => (&mut handler.logical_name, &mut handler.path),
            FileHandler::Throttled(handler) => {
                handler.forget_uploads();
                (&mut handler.logical_name, &mut handler.path)
            }
            FileHandler::TextStream(_) | FileHandler::Config(_) | FileHandler::Summary(_) => {
                return false;
            }
        };
        *name = logical_name.to_string();
        *target = path.to_path_buf();
        true
    }

    pub fn finish(&mut self) -> Result<(), SyncError> {
        match self {
            FileHandler::TextStream(handler) => handler.finish().map(|_| ()),
            FileHandler::Config(handler) | FileHandler::Summary(handler) => handler.finish(),
            FileHandler::Immediate(_) => Ok(()),
            FileHandler::Deferred(handler) => handler.finish(),
            FileHandler::Throttled(handler) => handler.finish(),
        }
    }
}

/// Follows an append-only file and streams its lines to the endpoint named after it.
pub struct TextStreamHandler {
    logical_name: String,
    active: Option<(FileTailer, StreamPusher)>,
}

impl TextStreamHandler {
    pub fn open(
        logical_name: &str,
        path: &Path,
        start: TailStart,
        start_line: u64,
        deps: &HandlerDeps,
    ) -> Result<Self, SyncError> {
        let mut options = PusherOptions::from_config(logical_name, &deps.config.stream);
        options.start_line = start_line;
        let pusher = StreamPusher::start(Arc::clone(&deps.store), &deps.ctx.run_id, options)?;
        let handle = pusher.handle();
        let name = logical_name.to_string();
        let tailer = FileTailer::start(
            path,
            start,
            deps.config.policy.tail_poll_interval(),
            move |data| {
                if let Err(err) = handle.write(LineSource::Plain, data) {
                    warn!(name = %name, err = %err, "dropping tailed bytes");
                }
            },
        )?;
        Ok(Self {
            logical_name: logical_name.to_string(),
            active: Some((tailer, pusher)),
        })
    }

    /// Drain the file, then flush and complete the stream.
    pub fn finish(&mut self) -> Result<PushStats, SyncError> {
        let Some((tailer, pusher)) = self.active.take() else {
            return Ok(PushStats::default());
        };
        let tail_result = tailer
            .stop()
            .with_context(|| format!("stop tailing {}", self.logical_name));
        let stats = pusher.finish(None)?;
        tail_result?;
        Ok(stats)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StructuredKind {
    Config,
    Summary,
}

enum Signal {
    Changed,
    Finish,
}

/// Parses a structured file and pushes it as a run config or summary update, rate limited
/// to one update per interval with a trailing update once changes stop.
pub struct StructuredHandler {
    logical_name: String,
    path: PathBuf,
    queue: Arc<UploadQueue>,
    tx: Sender<Signal>,
    worker: Option<JoinHandle<usize>>,
    updates: usize,
}

impl StructuredHandler {
    pub fn start(
        kind: StructuredKind,
        logical_name: &str,
        path: &Path,
        deps: &HandlerDeps,
    ) -> Result<Self, SyncError> {
        let updater = Updater {
            kind,
            logical_name: logical_name.to_string(),
            path: path.to_path_buf(),
            store: Arc::clone(&deps.store),
            ctx: Arc::clone(&deps.ctx),
            backoff: Backoff::from(deps.config.upload.retry),
        };
        let interval = deps.config.policy.structured_update_interval();
        let (tx, rx) = crossbeam_channel::unbounded();
        let worker = thread::Builder::new()
            .name(format!("update-{logical_name}"))
            .spawn(move || updater.run(&rx, interval))
            .map_err(|e| SyncError::io("spawn structured updater", e))?;
        Ok(Self {
            logical_name: logical_name.to_string(),
            path: path.to_path_buf(),
            queue: Arc::clone(&deps.queue),
            tx,
            worker: Some(worker),
            updates: 0,
        })
    }

    pub fn on_change(&self) {
        let _ = self.tx.send(Signal::Changed);
    }

    /// Remote updates made so far; known once the handler has finished.
    pub fn updates(&self) -> usize {
        self.updates
    }

    pub fn finish(&mut self) -> Result<(), SyncError> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        let _ = self.tx.send(Signal::Finish);
        self.updates = worker
            .join()
            .map_err(|_| anyhow!("updater for {} panicked", self.logical_name))?;
        if self.path.exists() {
            self.queue
                .enqueue(UploadTask::new(&self.logical_name, &self.path, false))?;
        }
        Ok(())
    }
}

struct Updater {
    kind: StructuredKind,
    logical_name: String,
    path: PathBuf,
    store: Arc<dyn RemoteStore>,
    ctx: Arc<RunContext>,
    backoff: Backoff,
}

impl Updater {
    fn run(self, rx: &Receiver<Signal>, interval: Duration) -> usize {
        let mut updates = 0;
        let mut dirty = false;
        let mut last_update: Option<Instant> = None;
        loop {
            let signal = if dirty {
                let due = last_update.map_or_else(Instant::now, |at| at + interval);
                match rx.recv_timeout(due.saturating_duration_since(Instant::now())) {
                    Ok(signal) => Some(signal),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => Some(Signal::Finish),
                }
            } else {
                Some(rx.recv().unwrap_or(Signal::Finish))
            };
            match signal {
                Some(Signal::Changed) => dirty = true,
                Some(Signal::Finish) => break,
                None => {}
            }
            let now = Instant::now();
            if dirty && last_update.is_none_or(|at| now.duration_since(at) >= interval) {
                if self.push() {
                    updates += 1;
                }
                dirty = false;
                last_update = Some(now);
            }
        }
        if self.push() {
            updates += 1;
        }
        debug!(name = %self.logical_name, updates, "updater stopped");
        updates
    }

    fn parse(&self) -> anyhow::Result<Option<Value>> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("read {}", self.path.display()));
            }
        };
        let value = match self.kind {
            StructuredKind::Config => serde_yaml::from_str(&text)
                .with_context(|| format!("parse yaml {}", self.path.display()))?,
            StructuredKind::Summary => serde_json::from_str(&text)
                .with_context(|| format!("parse json {}", self.path.display()))?,
        };
        Ok(Some(value))
    }

    fn push(&self) -> bool {
        let Some(storage_id) = self.ctx.storage_id() else {
            debug!(name = %self.logical_name, "no storage id yet; skipping update");
            return false;
        };
        let value = match self.parse() {
            Ok(Some(value)) => value,
            Ok(None) => return false,
            Err(err) => {
                warn!(name = %self.logical_name, err = %format!("{err:#}"), "skipping unreadable update");
                return false;
            }
        };
        let what = format!("update {}", self.logical_name);
        let result = self.backoff.retry(&what, || match self.kind {
            StructuredKind::Config => self.store.update_config(storage_id, &value),
            StructuredKind::Summary => self.store.update_summary(storage_id, &value),
        });
        match result {
            Ok(()) => true,
            Err(err) => {
                warn!(name = %self.logical_name, err = %err, "remote update failed");
                false
            }
        }
    }
}

/// Snapshots and uploads the file on every change.
pub struct ImmediateHandler {
    logical_name: String,
    path: PathBuf,
    queue: Arc<UploadQueue>,
}

impl ImmediateHandler {
    fn new(logical_name: &str, path: &Path, deps: &HandlerDeps) -> Self {
        Self {
            logical_name: logical_name.to_string(),
            path: path.to_path_buf(),
            queue: Arc::clone(&deps.queue),
        }
    }

    pub fn on_change(&self) -> Result<(), SyncError> {
        self.queue
            .enqueue(UploadTask::new(&self.logical_name, &self.path, true))
    }
}

/// Uploads the file once, at the end of the run.
pub struct DeferredHandler {
    logical_name: String,
    path: PathBuf,
    queue: Arc<UploadQueue>,
    changes: usize,
}

impl DeferredHandler {
    fn new(logical_name: &str, path: &Path, deps: &HandlerDeps) -> Self {
        Self {
            logical_name: logical_name.to_string(),
            path: path.to_path_buf(),
            queue: Arc::clone(&deps.queue),
            changes: 0,
        }
    }

    pub fn on_change(&mut self) {
        self.changes += 1;
    }

    pub fn changes(&self) -> usize {
        self.changes
    }

    pub fn finish(&mut self) -> Result<(), SyncError> {
        if !self.path.exists() {
            debug!(name = %self.logical_name, "deferred file vanished before upload");
            return Ok(());
        }
        self.queue
            .enqueue(UploadTask::new(&self.logical_name, &self.path, false))
    }
}

/// Uploads on change, no more often than a minimum wait that grows with file size.
pub struct ThrottledHandler {
    logical_name: String,
    path: PathBuf,
    queue: Arc<UploadQueue>,
    fixed_wait: Option<Duration>,
    min_wait: Duration,
    last_seen: Option<SystemTime>,
    uploaded_mtime: Option<SystemTime>,
    last_upload: Option<Instant>,
    uploads: usize,
}

impl ThrottledHandler {
    fn new(logical_name: &str, path: &Path, deps: &HandlerDeps) -> Self {
        let fixed_wait = deps.config.policy.throttle_min_wait();
        Self {
            logical_name: logical_name.to_string(),
            path: path.to_path_buf(),
            queue: Arc::clone(&deps.queue),
            fixed_wait,
            min_wait: fixed_wait.unwrap_or_else(|| min_wait_for_size(0)),
            last_seen: None,
            uploaded_mtime: None,
            last_upload: None,
            uploads: 0,
        }
    }

    /// Current minimum spacing between uploads.
    pub fn min_wait(&self) -> Duration {
        self.min_wait
    }

    pub fn uploads(&self) -> usize {
        self.uploads
    }

    /// The remote has nothing under a new name yet, so the next change uploads at once.
    fn forget_uploads(&mut self) {
        self.last_seen = None;
        self.uploaded_mtime = None;
        self.last_upload = None;
    }

    fn stat(&self) -> Option<(u64, SystemTime)> {
        let meta = fs::metadata(&self.path).ok()?;
        Some((meta.len(), meta.modified().ok()?))
    }

    pub fn on_change(&mut self, now: Instant) -> Result<(), SyncError> {
        let Some((size, mtime)) = self.stat() else {
            return Ok(());
        };
        if size == 0 || self.last_seen == Some(mtime) {
            return Ok(());
        }
        self.last_seen = Some(mtime);
        self.min_wait = self.fixed_wait.unwrap_or_else(|| min_wait_for_size(size));
        let due = self
            .last_upload
            .is_none_or(|at| now.duration_since(at) >= self.min_wait);
        if !due {
            debug!(name = %self.logical_name, min_wait_secs = self.min_wait.as_secs(), "throttled");
            return Ok(());
        }
        self.upload(mtime, now)
    }

    fn upload(&mut self, mtime: SystemTime, now: Instant) -> Result<(), SyncError> {
        self.queue
            .enqueue(UploadTask::new(&self.logical_name, &self.path, true))?;
        self.uploaded_mtime = Some(mtime);
        self.last_upload = Some(now);
        self.uploads += 1;
        Ok(())
    }

    pub fn finish(&mut self) -> Result<(), SyncError> {
        let Some((size, mtime)) = self.stat() else {
            return Ok(());
        };
        if size == 0 || self.uploaded_mtime == Some(mtime) {
            return Ok(());
        }
        info!(name = %self.logical_name, "uploading final state of throttled file");
        self.upload(mtime, Instant::now())
    }
}

#[cfg(test)]
mod tests {
    use std::fs::OpenOptions;
    use std::io::Write;

    use super::*;
    use crate::io::upload_queue::UploadTarget;
    use crate::test_support::{RecordingStore, fast_config, wait_until};

    struct Fixture {
        _temp: tempfile::TempDir,
        store: Arc<RecordingStore>,
        deps: HandlerDeps,
    }

    impl Fixture {
        fn new(config: SyncConfig) -> Self {
            let temp = tempfile::tempdir().expect("tempdir");
            let store = Arc::new(RecordingStore::new());
            let ctx = Arc::new(RunContext::new("run1", "me", "proj", temp.path()));
            ctx.set_storage_id("store-run1".to_string());
            let queue = UploadQueue::new(
                Arc::clone(&store) as Arc<dyn RemoteStore>,
                UploadTarget {
                    project: "proj".to_string(),
                    run_name: "run1".to_string(),
                },
                2,
                Backoff::from(config.upload.retry),
            )
            .expect("queue");
            let deps = HandlerDeps {
                store: Arc::clone(&store) as Arc<dyn RemoteStore>,
                queue: Arc::new(queue),
                ctx,
                config: Arc::new(config),
            };
            Self {
                _temp: temp,
                store,
                deps,
            }
        }

        fn path(&self, name: &str) -> PathBuf {
            self.deps.ctx.path_of(name)
        }

        fn build(&self, kind: PolicyKind, name: &str) -> FileHandler {
            FileHandler::build(kind, name, &self.path(name), &self.deps).expect("build")
        }

        fn drain(&self) {
            self.deps.queue.finish().expect("drain");
        }
    }

    #[test]
    fn immediate_uploads_a_snapshot_per_change() {
        let fx = Fixture::new(fast_config());
        let path = fx.path("media/a.png");
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        let mut handler = fx.build(PolicyKind::Immediate, "media/a.png");

        fs::write(&path, "one").expect("write");
        handler.on_change().expect("change");
        assert!(wait_until(Duration::from_secs(5), || {
            fx.store.uploads_of("media/a.png").len() == 1
        }));
        fs::write(&path, "two").expect("write");
        handler.on_change().expect("change");
        handler.finish().expect("finish");
        fx.drain();
        assert_eq!(
            fx.store.uploads_of("media/a.png"),
            vec![b"one".to_vec(), b"two".to_vec()]
        );
    }

    #[test]
    fn deferred_uploads_once_at_finish() {
        let fx = Fixture::new(fast_config());
        let path = fx.path("model.bin");
        let mut handler = fx.build(PolicyKind::Deferred, "model.bin");
        for round in 0..3 {
            fs::write(&path, format!("v{round}")).expect("write");
            handler.on_change().expect("change");
        }
        thread::sleep(Duration::from_millis(50));
        assert!(fx.store.uploads_of("model.bin").is_empty());

        handler.finish().expect("finish");
        fx.drain();
        assert_eq!(fx.store.uploads_of("model.bin"), vec![b"v2".to_vec()]);
    }

    #[test]
    fn throttled_waits_between_uploads_and_flushes_at_finish() {
        let fx = Fixture::new(fast_config());
        let path = fx.path("ckpt_0.txt");
        let FileHandler::Throttled(mut handler) = fx.build(PolicyKind::Throttled, "ckpt_0.txt")
        else {
            panic!("expected throttled handler");
        };

        fs::write(&path, "").expect("write");
        handler.on_change(Instant::now()).expect("empty");
        assert_eq!(handler.uploads(), 0);

        fs::write(&path, "first").expect("write");
        let start = Instant::now();
        handler.on_change(start).expect("first");
        assert_eq!(handler.uploads(), 1);
        assert_eq!(handler.min_wait(), Duration::from_secs(60));

        thread::sleep(Duration::from_millis(20));
        fs::write(&path, "second").expect("write");
        handler
            .on_change(start + Duration::from_secs(1))
            .expect("second");
        assert_eq!(handler.uploads(), 1);

        handler.finish().expect("finish");
        assert_eq!(handler.uploads(), 2);
        fx.drain();
        assert_eq!(
            fx.store.uploads_of("ckpt_0.txt"),
            vec![b"first".to_vec(), b"second".to_vec()]
        );
    }

    #[test]
    fn renamed_throttled_file_uploads_under_its_new_name() {
        let fx = Fixture::new(fast_config());
        let old = fx.path("ckpt.bin");
        let mut handler = fx.build(PolicyKind::Throttled, "ckpt.bin");
        fs::write(&old, "weights").expect("write");
        handler.on_change().expect("first");

        let new = fx.path("ckpt_final.bin");
        fs::rename(&old, &new).expect("rename");
        assert!(handler.rename("ckpt_final.bin", &new));
        handler.on_change().expect("after rename");
        handler.finish().expect("finish");
        fx.drain();

        assert_eq!(fx.store.uploads_of("ckpt.bin"), vec![b"weights".to_vec()]);
        assert_eq!(fx.store.uploads_of("ckpt_final.bin"), vec![b"weights".to_vec()]);
    }

    #[test]
    fn streams_and_updaters_do_not_follow_renames() {
        let fx = Fixture::new(fast_config());
        let mut handler = fx.build(PolicyKind::Summary, "summary.json");
        assert!(!handler.rename("summary_old.json", &fx.path("summary_old.json")));
        handler.finish().expect("finish");
    }

    #[test]
    fn throttled_uses_configured_wait() {
        let mut config = fast_config();
        config.policy.throttle_min_wait_secs = Some(0);
        let fx = Fixture::new(config);
        let path = fx.path("events.tfevents.1");
        let FileHandler::Throttled(mut handler) =
            fx.build(PolicyKind::Throttled, "events.tfevents.1")
        else {
            panic!("expected throttled handler");
        };
        fs::write(&path, "a").expect("write");
        handler.on_change(Instant::now()).expect("first");
        thread::sleep(Duration::from_millis(20));
        fs::write(&path, "ab").expect("write");
        handler.on_change(Instant::now()).expect("second");
        assert_eq!(handler.min_wait(), Duration::ZERO);
        assert_eq!(handler.uploads(), 2);

        handler.finish().expect("finish");
        assert_eq!(handler.uploads(), 2);
        fx.drain();
    }

    #[test]
    fn config_changes_become_remote_updates() {
        let fx = Fixture::new(fast_config());
        let path = fx.path("config.yaml");
        fs::write(&path, "lr: 0.1\nepochs: 3\n").expect("write");
        let mut handler = fx.build(PolicyKind::Config, "config.yaml");
        handler.on_change().expect("change");
        assert!(wait_until(Duration::from_secs(5), || {
            !fx.store.configs().is_empty()
        }));
        fs::write(&path, "lr: 0.2\nepochs: 3\n").expect("write");
        handler.on_change().expect("change");
        handler.finish().expect("finish");
        fx.drain();

        let configs = fx.store.configs();
        assert_eq!(configs[0]["lr"], serde_json::json!(0.1));
        assert_eq!(
            configs.last().expect("final update")["lr"],
            serde_json::json!(0.2)
        );
        assert_eq!(fx.store.uploads_of("config.yaml").len(), 1);
    }

    #[test]
    fn unparseable_summary_is_skipped_but_uploaded() {
        let fx = Fixture::new(fast_config());
        let path = fx.path("summary.json");
        fs::write(&path, "{not json").expect("write");
        let mut handler = fx.build(PolicyKind::Summary, "summary.json");
        handler.on_change().expect("change");
        handler.finish().expect("finish");
        fx.drain();

        assert!(fx.store.summaries().is_empty());
        assert_eq!(fx.store.uploads_of("summary.json"), vec![b"{not json".to_vec()]);
    }

    #[test]
    fn text_stream_forwards_appended_lines() {
        let fx = Fixture::new(fast_config());
        let path = fx.path("history.jsonl");
        fs::write(&path, "{\"_step\": 0}\n").expect("write");
        let mut handler = fx.build(PolicyKind::TextStream, "history.jsonl");
        let mut file = OpenOptions::new().append(true).open(&path).expect("open");
        file.write_all(b"{\"_step\": 1}\n").expect("append");
        drop(file);

        handler.finish().expect("finish");
        let lines: Vec<(u64, String)> = fx
            .store
            .resolved_lines("history.jsonl")
            .into_iter()
            .collect();
        assert_eq!(
            lines,
            vec![
                (1, "{\"_step\": 0}".to_string()),
                (2, "{\"_step\": 1}".to_string())
            ]
        );
        assert!(fx.store.completion("history.jsonl").is_some());
        fx.drain();
    }
}
