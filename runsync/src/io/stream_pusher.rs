//! Streams lines from a source to a line-oriented remote endpoint.
//!
//! Writers hand raw chunks to a [`PusherHandle`]; a dedicated thread assembles them into
//! lines with a [`LineBuffer`], posts batches when they become due, sends keep-alive
//! heartbeats while idle, and retries failed posts with backoff. Lines are never dropped on
//! a transient failure: the batch goes back in front of the buffer. After
//! `max_consecutive_failures` failed posts the stream gives up and reports the error from
//! [`StreamPusher::finish`].

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::anyhow;
use chrono::Utc;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::core::line_buffer::{FlushPolicy, LineBuffer, LineSource, Prefixer};
use crate::error::{StoreError, SyncError};
use crate::io::config::StreamConfig;
use crate::io::retry::Backoff;
use crate::io::store::{LogBatch, RemoteStore};

#[derive(Debug, Clone)]
pub struct PusherOptions {
    /// Remote endpoint, which is also the stream's logical file name.
    pub endpoint: String,
    pub flush: FlushPolicy,
    pub heartbeat: Duration,
    pub max_consecutive_failures: u32,
    pub backoff: Backoff,
    /// Lines the remote already holds for this endpoint.
    pub start_line: u64,
    /// Prefix every line with a UTC timestamp.
    pub timestamps: bool,
    /// Local file receiving a raw copy of every chunk.
    pub spill_path: Option<PathBuf>,
}

impl PusherOptions {
    pub fn from_config(endpoint: impl Into<String>, cfg: &StreamConfig) -> Self {
        Self {
            endpoint: endpoint.into(),
            flush: cfg.flush_policy(),
            heartbeat: cfg.heartbeat(),
            max_consecutive_failures: cfg.max_consecutive_failures,
            backoff: Backoff::from(cfg.retry),
            start_line: 0,
            timestamps: false,
            spill_path: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PushStats {
    pub posts: usize,
    pub lines_sent: usize,
    pub failed_posts: usize,
    pub heartbeats: usize,
    /// Times the worker thread woke up, for input or a deadline.
    pub wakeups: usize,
}

enum Command {
    Write { source: LineSource, data: Vec<u8> },
    Finish { exit_code: Option<i32> },
}

/// Cloneable write side of a stream.
#[derive(Clone)]
pub struct PusherHandle {
    tx: Sender<Command>,
    spill: Option<Arc<Mutex<File>>>,
    endpoint: Arc<str>,
}

impl PusherHandle {
    /// Spill `data` locally, then hand it to the pusher thread.
    pub fn write(&self, source: LineSource, data: &[u8]) -> Result<(), SyncError> {
        if data.is_empty() {
            return Ok(());
        }
        if let Some(spill) = &self.spill
            && let Err(err) = spill.lock().write_all(data)
        {
            warn!(endpoint = %self.endpoint, err = %err, "spill write failed");
        }
        self.tx
            .send(Command::Write {
                source,
                data: data.to_vec(),
            })
            .map_err(|_| {
                SyncError::Other(anyhow!("stream {} stopped accepting lines", self.endpoint))
            })
    }

    pub fn writer(&self, source: LineSource) -> PusherWriter {
        PusherWriter {
            handle: self.clone(),
            source,
        }
    }
}

/// [`Write`] adapter tagging every chunk with one source.
pub struct PusherWriter {
    handle: PusherHandle,
    source: LineSource,
}

impl Write for PusherWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.handle
            .write(self.source, buf)
            .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e.to_string()))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub struct StreamPusher {
    handle: PusherHandle,
    worker: Option<JoinHandle<Result<PushStats, SyncError>>>,
}

impl StreamPusher {
    pub fn start(
        store: Arc<dyn RemoteStore>,
        run_name: &str,
        options: PusherOptions,
    ) -> Result<Self, SyncError> {
        let spill = match &options.spill_path {
            Some(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|e| SyncError::io(format!("open spill {}", path.display()), e))?;
                Some(Arc::new(Mutex::new(file)))
            }
            None => None,
        };

        let mut buffer = LineBuffer::new(options.flush, options.start_line);
        if options.timestamps || options.spill_path.is_some() {
            buffer = buffer.with_prefixer(console_prefixer(options.timestamps));
        }
        let (tx, rx) = crossbeam_channel::unbounded();
        let endpoint: Arc<str> = Arc::from(options.endpoint.as_str());
        let worker = Worker {
            store,
            run_name: run_name.to_string(),
            endpoint: options.endpoint.clone(),
            buffer,
            heartbeat: options.heartbeat,
            max_failures: options.max_consecutive_failures.max(1),
            backoff: options.backoff,
            failures: 0,
            retry_at: None,
            last_activity: Instant::now(),
            stats: PushStats::default(),
        };
        let handle = thread::Builder::new()
            .name(format!("stream-{}", options.endpoint))
            .spawn(move || worker.run(&rx))
            .map_err(|e| SyncError::io("spawn stream pusher", e))?;
        debug!(endpoint = %options.endpoint, start_line = options.start_line, "stream started");

        Ok(Self {
            handle: PusherHandle { tx, spill, endpoint },
            worker: Some(handle),
        })
    }

    pub fn handle(&self) -> PusherHandle {
        self.handle.clone()
    }

    pub fn write(&self, source: LineSource, data: &[u8]) -> Result<(), SyncError> {
        self.handle.write(source, data)
    }

    /// Flush everything, post the completion marker, and stop the thread.
    pub fn finish(mut self, exit_code: Option<i32>) -> Result<PushStats, SyncError> {
        let _ = self.handle.tx.send(Command::Finish { exit_code });
        let Some(worker) = self.worker.take() else {
            return Ok(PushStats::default());
        };
        match worker.join() {
            Ok(result) => result,
            Err(_) => Err(SyncError::Other(anyhow!(
                "stream {} pusher thread panicked",
                self.handle.endpoint
            ))),
        }
    }
}

fn console_prefixer(timestamps: bool) -> Prefixer {
    Box::new(move |source| {
        let mut prefix = String::new();
        if timestamps {
            prefix.push_str(&Utc::now().format("%Y-%m-%dT%H:%M:%S%.6f ").to_string());
        }
        if source == LineSource::Stderr {
            prefix.push_str("ERROR ");
        }
        prefix
    })
}

struct Worker {
    store: Arc<dyn RemoteStore>,
    run_name: String,
    endpoint: String,
    buffer: LineBuffer,
    heartbeat: Duration,
    max_failures: u32,
    backoff: Backoff,
    failures: u32,
    retry_at: Option<Instant>,
    last_activity: Instant,
    stats: PushStats,
}

impl Worker {
    fn run(mut self, rx: &Receiver<Command>) -> Result<PushStats, SyncError> {
        loop {
            let now = Instant::now();
            let timeout = self.next_wakeup(now).saturating_duration_since(now);
            self.stats.wakeups += 1;
            match rx.recv_timeout(timeout) {
                Ok(Command::Write { source, data }) => {
                    self.buffer.push(source, &data, Instant::now());
                }
                Ok(Command::Finish { exit_code }) => return self.finish(exit_code),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return self.finish(None),
            }
            if let Err(err) = self.tick(Instant::now()) {
                error!(endpoint = %self.endpoint, err = %err, "stream giving up");
                return Err(err);
            }
        }
    }

    fn next_wakeup(&self, now: Instant) -> Instant {
        // Heartbeats only go out when nothing is buffered, so their deadline must not drive
        // the wait while lines are pending.
        let mut wake = if self.buffer.pending() == 0 {
            self.last_activity + self.heartbeat
        } else {
            self.buffer
                .next_deadline(now)
                .unwrap_or(now + self.heartbeat)
        };
        if let Some(at) = self.retry_at {
            wake = wake.max(at);
        }
        wake
    }

    fn tick(&mut self, now: Instant) -> Result<(), SyncError> {
        if self.retry_at.is_some_and(|at| now < at) {
            return Ok(());
        }
        if self.buffer.is_due(now) {
            return self.post_lines(now);
        }
        if self.buffer.pending() == 0
            && now.saturating_duration_since(self.last_activity) >= self.heartbeat
        {
            self.post_heartbeat(now);
        }
        Ok(())
    }

    fn post_lines(&mut self, now: Instant) -> Result<(), SyncError> {
        let batch = self.buffer.take_batch();
        if batch.is_empty() {
            return Ok(());
        }
        let payload = LogBatch {
            lines: batch
                .iter()
                .map(|line| (line.sequence_number, line.text.clone()))
                .collect(),
            complete: false,
            exit_code: None,
        };
        self.buffer.mark_posted(now);
        match self
            .store
            .push_log_lines(&self.run_name, &self.endpoint, &payload)
        {
            Ok(()) => {
                self.record_success(now);
                self.stats.posts += 1;
                self.stats.lines_sent += payload.lines.len();
                Ok(())
            }
            Err(err) => {
                self.buffer.requeue(batch);
                self.record_failure(now, err)
            }
        }
    }

    fn post_heartbeat(&mut self, now: Instant) {
        match self
            .store
            .push_log_lines(&self.run_name, &self.endpoint, &LogBatch::heartbeat())
        {
            Ok(()) => self.stats.heartbeats += 1,
            Err(err) => warn!(endpoint = %self.endpoint, err = %err, "heartbeat failed"),
        }
        self.last_activity = now;
    }

    fn record_success(&mut self, now: Instant) {
        self.failures = 0;
        self.retry_at = None;
        self.last_activity = now;
    }

    fn record_failure(&mut self, now: Instant, err: StoreError) -> Result<(), SyncError> {
        self.stats.failed_posts += 1;
        let context = format!("stream {}", self.endpoint);
        if !err.is_retryable() {
            return Err(SyncError::store(context, err));
        }
        self.failures += 1;
        if self.failures >= self.max_failures {
            return Err(SyncError::store(
                format!("{context} after {} consecutive failures", self.failures),
                err,
            ));
        }
        let delay = self.backoff.delay(self.failures - 1);
        self.retry_at = Some(now + delay);
        warn!(
            endpoint = %self.endpoint,
            failures = self.failures,
            retry_in_ms = delay.as_millis() as u64,
            err = %err,
            "post failed; lines kept for retry"
        );
        Ok(())
    }

    fn wait_for_retry(&self) {
        if let Some(at) = self.retry_at {
            let now = Instant::now();
            if at > now {
                thread::sleep(at - now);
            }
        }
    }

    fn finish(mut self, exit_code: Option<i32>) -> Result<PushStats, SyncError> {
        self.buffer.finish_partials(Instant::now());
        while self.buffer.pending() > 0 {
            self.wait_for_retry();
            self.post_lines(Instant::now())?;
        }

        let complete = LogBatch {
            lines: Vec::new(),
            complete: true,
            exit_code,
        };
        loop {
            self.wait_for_retry();
            match self
                .store
                .push_log_lines(&self.run_name, &self.endpoint, &complete)
            {
                Ok(()) => break,
                Err(err) => self.record_failure(Instant::now(), err)?,
            }
        }
        info!(
            endpoint = %self.endpoint,
            posts = self.stats.posts,
            lines = self.stats.lines_sent,
            failed = self.stats.failed_posts,
            "stream finished"
        );
        Ok(self.stats)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::test_support::{RecordingStore, wait_until};

    fn options(threshold: usize, staleness_ms: u64) -> PusherOptions {
        PusherOptions {
            endpoint: "output.log".to_string(),
            flush: FlushPolicy {
                line_threshold: threshold,
                min_post_interval: Duration::from_millis(10),
                staleness: Duration::from_millis(staleness_ms),
            },
            heartbeat: Duration::from_secs(60),
            max_consecutive_failures: 5,
            backoff: Backoff::new(Duration::from_millis(1), Duration::from_millis(5), 5),
            start_line: 0,
            timestamps: false,
            spill_path: None,
        }
    }

    fn start(store: &Arc<RecordingStore>, options: PusherOptions) -> StreamPusher {
        StreamPusher::start(Arc::clone(store) as Arc<dyn RemoteStore>, "run1", options)
            .expect("start")
    }

    #[test]
    fn idle_pusher_with_undue_lines_blocks() {
        let store = Arc::new(RecordingStore::new());
        let mut opts = options(100, 60_000);
        opts.heartbeat = Duration::from_millis(20);
        let pusher = start(&store, opts);
        pusher.write(LineSource::Plain, b"one line\n").expect("write");
        thread::sleep(Duration::from_millis(500));

        let stats = pusher.finish(None).expect("finish");
        assert!(stats.wakeups < 20, "worker woke {} times", stats.wakeups);
        assert_eq!(stats.lines_sent, 1);
        assert_eq!(stats.heartbeats, 0);
    }

    #[test]
    fn burst_at_threshold_posts_once() {
        let store = Arc::new(RecordingStore::new());
        let pusher = start(&store, options(5, 60_000));
        for i in 0..5 {
            pusher
                .write(LineSource::Plain, format!("line {i}\n").as_bytes())
                .expect("write");
        }
        assert!(wait_until(Duration::from_secs(5), || {
            store.line_posts("output.log").len() == 1
        }));
        thread::sleep(Duration::from_millis(100));
        let posts = store.line_posts("output.log");
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].lines.len(), 5);

        pusher.finish(Some(0)).expect("finish");
        let done = store.completion("output.log").expect("complete");
        assert_eq!(done.exit_code, Some(0));
    }

    #[test]
    fn stale_line_posts_below_threshold() {
        let store = Arc::new(RecordingStore::new());
        let pusher = start(&store, options(100, 150));
        let started = Instant::now();
        pusher.write(LineSource::Plain, b"lonely\n").expect("write");
        assert!(wait_until(Duration::from_secs(5), || {
            !store.line_posts("output.log").is_empty()
        }));
        assert!(started.elapsed() >= Duration::from_millis(150));
        assert_eq!(
            store.line_posts("output.log")[0].lines,
            vec![(1, "lonely".to_string())]
        );
        pusher.finish(None).expect("finish");
    }

    #[test]
    fn failed_posts_keep_lines_in_order() {
        let store = Arc::new(RecordingStore::new());
        store.fail_next_posts(2);
        let pusher = start(&store, options(1, 60_000));
        pusher.write(LineSource::Plain, b"a\n").expect("write");
        pusher.write(LineSource::Plain, b"b\n").expect("write");
        let stats = pusher.finish(Some(0)).expect("finish");

        let lines = store.resolved_lines("output.log");
        assert_eq!(
            lines.into_iter().collect::<Vec<_>>(),
            vec![(1, "a".to_string()), (2, "b".to_string())]
        );
        assert_eq!(stats.failed_posts, 2);
    }

    #[test]
    fn repeated_failures_escalate() {
        let store = Arc::new(RecordingStore::new());
        store.fail_next_posts(1_000);
        let mut opts = options(1, 60_000);
        opts.max_consecutive_failures = 3;
        let pusher = start(&store, opts);
        let handle = pusher.handle();
        pusher.write(LineSource::Plain, b"x\n").expect("write");

        assert!(wait_until(Duration::from_secs(5), || {
            handle.write(LineSource::Plain, b"y\n").is_err()
        }));
        let err = pusher.finish(Some(1)).expect_err("escalated");
        assert!(err.to_string().contains("consecutive failures"));
    }

    #[test]
    fn idle_stream_sends_heartbeats() {
        let store = Arc::new(RecordingStore::new());
        let mut opts = options(100, 60_000);
        opts.heartbeat = Duration::from_millis(50);
        let pusher = start(&store, opts);
        assert!(wait_until(Duration::from_secs(5), || {
            store
                .batches("output.log")
                .iter()
                .any(LogBatch::is_heartbeat)
        }));
        let stats = pusher.finish(None).expect("finish");
        assert!(stats.heartbeats >= 1);
    }

    #[test]
    fn progress_redraws_collapse_remotely() {
        let store = Arc::new(RecordingStore::new());
        let pusher = start(&store, options(100, 60_000));
        for pct in 0..50 {
            pusher
                .write(LineSource::Stdout, format!("{pct}%\r").as_bytes())
                .expect("write");
        }
        pusher.finish(Some(0)).expect("finish");
        let lines = store.resolved_lines("output.log");
        assert_eq!(
            lines.into_iter().collect::<Vec<_>>(),
            vec![(1, "49%".to_string())]
        );
    }

    #[test]
    fn spill_keeps_raw_bytes_and_stream_marks_stderr() {
        let temp = tempfile::tempdir().expect("tempdir");
        let spill = temp.path().join("output.log");
        let store = Arc::new(RecordingStore::new());
        let mut opts = options(100, 60_000);
        opts.spill_path = Some(spill.clone());
        let pusher = start(&store, opts);
        let mut err_writer = pusher.handle().writer(LineSource::Stderr);
        err_writer.write_all(b"boom\n").expect("write");
        pusher.write(LineSource::Stdout, b"fine\n").expect("write");
        pusher.finish(Some(1)).expect("finish");

        assert_eq!(fs::read_to_string(&spill).expect("read"), "boom\nfine\n");
        let lines: Vec<String> = store.resolved_lines("output.log").into_values().collect();
        assert_eq!(lines, vec!["ERROR boom".to_string(), "fine".to_string()]);
    }

    #[test]
    fn resumed_stream_continues_numbering() {
        let store = Arc::new(RecordingStore::new());
        let mut opts = options(100, 60_000);
        opts.endpoint = "history.jsonl".to_string();
        opts.start_line = 15;
        let pusher = start(&store, opts);
        pusher
            .write(LineSource::Plain, b"{\"_step\": 15}\n")
            .expect("write");
        pusher.finish(None).expect("finish");
        let first = store.line_posts("history.jsonl")[0].lines[0].clone();
        assert_eq!(first.0, 16);
    }
}
