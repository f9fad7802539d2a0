//! Bounded-concurrency upload queue with per-file coalescing.
//!
//! At most one task per logical name is pending and at most one is in flight. Enqueueing a
//! name that is already pending replaces the pending task (the newest source wins). A name
//! that is in flight stays queued behind itself until the running upload completes.
//!
//! Tasks enqueued with `copy_on_enqueue` are snapshotted into a staging directory first, so
//! the upload sees the file as it was at enqueue time even if the user keeps writing to it.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::anyhow;
use parking_lot::{Condvar, Mutex};
use tempfile::TempDir;
use tracing::{debug, error, info, instrument};

use crate::error::SyncError;
use crate::io::retry::Backoff;
use crate::io::store::RemoteStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadTask {
    pub logical_name: String,
    pub source_path: PathBuf,
    pub copy_on_enqueue: bool,
}

impl UploadTask {
    pub fn new(logical_name: impl Into<String>, source_path: impl Into<PathBuf>, copy: bool) -> Self {
        Self {
            logical_name: logical_name.into(),
            source_path: source_path.into(),
            copy_on_enqueue: copy,
        }
    }
}

/// Where uploads land remotely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadTarget {
    pub project: String,
    pub run_name: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileProgress {
    pub sent: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UploadStats {
    pub enqueued: usize,
    /// Enqueues that replaced a pending task for the same name.
    pub coalesced: usize,
    pub uploaded_files: usize,
    pub uploaded_bytes: u64,
    pub failed: usize,
}

struct Job {
    task: UploadTask,
    upload_from: PathBuf,
    snapshot: bool,
}

#[derive(Default)]
struct QueueState {
    order: VecDeque<String>,
    pending: HashMap<String, Job>,
    running: HashSet<String>,
    closed: bool,
    first_error: Option<SyncError>,
    uploaded: BTreeMap<String, PathBuf>,
    progress: BTreeMap<String, FileProgress>,
    stats: UploadStats,
    next_snapshot: u64,
}

impl QueueState {
    fn idle(&self) -> bool {
        self.order.is_empty() && self.running.is_empty()
    }
}

struct Shared {
    state: Mutex<QueueState>,
    changed: Condvar,
    store: Arc<dyn RemoteStore>,
    target: UploadTarget,
    backoff: Backoff,
}

pub struct UploadQueue {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    staging: TempDir,
}

impl UploadQueue {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        target: UploadTarget,
        workers: usize,
        backoff: Backoff,
    ) -> Result<Self, SyncError> {
        let staging = tempfile::Builder::new()
            .prefix("runsync-staging-")
            .tempdir()
            .map_err(|e| SyncError::io("create upload staging dir", e))?;
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState::default()),
            changed: Condvar::new(),
            store,
            target,
            backoff,
        });
        let mut handles = Vec::with_capacity(workers);
        for index in 0..workers.max(1) {
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("upload-{index}"))
                .spawn(move || shared.work())
                .map_err(|e| SyncError::io("spawn upload worker", e))?;
            handles.push(handle);
        }
        debug!(workers = handles.len(), staging = %staging.path().display(), "upload queue started");
        Ok(Self {
            shared,
            workers: Mutex::new(handles),
            staging,
        })
    }

    /// Queue an upload, replacing any pending task for the same name.
    pub fn enqueue(&self, task: UploadTask) -> Result<(), SyncError> {
        if self.shared.state.lock().closed {
            return Err(SyncError::Other(anyhow!(
                "upload queue is closed; dropped {}",
                task.logical_name
            )));
        }
        let (upload_from, snapshot) = if task.copy_on_enqueue {
            (self.snapshot(&task)?, true)
        } else {
            (task.source_path.clone(), false)
        };

        let name = task.logical_name.clone();
        let job = Job {
            task,
            upload_from,
            snapshot,
        };
        let mut state = self.shared.state.lock();
        if state.closed {
            drop(state);
            if job.snapshot {
                let _ = fs::remove_file(&job.upload_from);
            }
            return Err(SyncError::Other(anyhow!(
                "upload queue closed while enqueueing {name}"
            )));
        }
        state.stats.enqueued += 1;
        if let Some(replaced) = state.pending.insert(name.clone(), job) {
            state.stats.coalesced += 1;
            debug!(name = %name, "coalesced pending upload");
            if replaced.snapshot {
                let _ = fs::remove_file(&replaced.upload_from);
            }
        } else {
            state.order.push_back(name);
        }
        self.shared.changed.notify_all();
        Ok(())
    }

    /// Wait until nothing is pending or in flight, then stop the workers.
    ///
    /// Returns the first upload error; every other task still ran to completion.
    #[instrument(skip_all)]
    pub fn finish(&self) -> Result<(), SyncError> {
        {
            let mut state = self.shared.state.lock();
            while !state.idle() {
                self.shared.changed.wait(&mut state);
            }
            state.closed = true;
            self.shared.changed.notify_all();
        }
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if worker.join().is_err() {
                error!("upload worker panicked");
            }
        }
        let mut state = self.shared.state.lock();
        info!(
            uploaded = state.stats.uploaded_files,
            bytes = state.stats.uploaded_bytes,
            failed = state.stats.failed,
            "upload queue drained"
        );
        match state.first_error.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Pending or running uploads exist.
    pub fn is_alive(&self) -> bool {
        !self.shared.state.lock().idle()
    }

    pub fn pending(&self) -> usize {
        self.shared.state.lock().order.len()
    }

    pub fn stats(&self) -> UploadStats {
        self.shared.state.lock().stats
    }

    /// Successfully uploaded names and the local paths they came from.
    pub fn uploaded(&self) -> BTreeMap<String, PathBuf> {
        self.shared.state.lock().uploaded.clone()
    }

    pub fn progress(&self) -> BTreeMap<String, FileProgress> {
        self.shared.state.lock().progress.clone()
    }

    pub fn target(&self) -> &UploadTarget {
        &self.shared.target
    }

    fn snapshot(&self, task: &UploadTask) -> Result<PathBuf, SyncError> {
        let seq = {
            let mut state = self.shared.state.lock();
            state.next_snapshot += 1;
            state.next_snapshot
        };
        let flat = task.logical_name.replace('/', "__");
        let dest = self.staging.path().join(format!("{seq:06}-{flat}"));
        fs::copy(&task.source_path, &dest).map_err(|e| {
            SyncError::io(format!("snapshot {}", task.source_path.display()), e)
        })?;
        Ok(dest)
    }
}

impl Shared {
    fn work(&self) {
        while let Some(job) = self.next_job() {
            let name = job.task.logical_name.clone();
            let result = self.upload(&name, &job.upload_from);
            if job.snapshot {
                let _ = fs::remove_file(&job.upload_from);
            }
            self.complete(name, job.task.source_path, result);
        }
    }

    fn next_job(&self) -> Option<Job> {
        let mut state = self.state.lock();
        loop {
            let QueueState {
                order,
                pending,
                running,
                closed,
                ..
            } = &mut *state;
            if let Some(pos) = order.iter().position(|name| !running.contains(name))
                && let Some(name) = order.remove(pos)
                && let Some(job) = pending.remove(&name)
            {
                running.insert(name);
                return Some(job);
            }
            if *closed {
                return None;
            }
            self.changed.wait(&mut state);
        }
    }

    fn upload(&self, name: &str, path: &Path) -> Result<u64, SyncError> {
        let context = format!("upload {name}");
        let mut bytes = 0u64;
        self.backoff
            .retry(&context, || {
                self.store.push_file(
                    &self.target.project,
                    &self.target.run_name,
                    name,
                    path,
                    &mut |sent, total| {
                        bytes = total;
                        self.state
                            .lock()
                            .progress
                            .insert(name.to_string(), FileProgress { sent, total });
                    },
                )
            })
            .map_err(|e| SyncError::store(context.clone(), e))?;
        Ok(bytes)
    }

    fn complete(&self, name: String, source: PathBuf, result: Result<u64, SyncError>) {
        let mut state = self.state.lock();
        state.running.remove(&name);
        match result {
            Ok(bytes) => {
                debug!(name = %name, bytes, "uploaded");
                state.stats.uploaded_files += 1;
                state.stats.uploaded_bytes += bytes;
                state.uploaded.insert(name, source);
            }
            Err(err) => {
                error!(name = %name, err = %err, "upload failed");
                state.stats.failed += 1;
                if state.first_error.is_none() {
                    state.first_error = Some(err);
                }
            }
        }
        self.changed.notify_all();
    }
}

impl Drop for UploadQueue {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        if !state.closed {
            state.closed = true;
            state.order.clear();
            state.pending.clear();
            self.shared.changed.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::error::StoreError;
    use crate::test_support::{RecordingStore, wait_until};

    fn queue(store: &Arc<RecordingStore>, workers: usize) -> UploadQueue {
        UploadQueue::new(
            Arc::clone(store) as Arc<dyn RemoteStore>,
            UploadTarget {
                project: "proj".to_string(),
                run_name: "run1".to_string(),
            },
            workers,
            Backoff::new(Duration::from_millis(1), Duration::from_millis(2), 3),
        )
        .expect("queue")
    }

    #[test]
    fn pending_tasks_for_one_name_coalesce() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(RecordingStore::new());
        store.hold_uploads();
        let queue = queue(&store, 1);

        let a = temp.path().join("a.txt");
        let b1 = temp.path().join("b1.txt");
        let b2 = temp.path().join("b2.txt");
        fs::write(&a, "a").expect("write");
        fs::write(&b1, "first").expect("write");
        fs::write(&b2, "second").expect("write");

        queue.enqueue(UploadTask::new("a.txt", &a, false)).expect("a");
        assert!(wait_until(Duration::from_secs(5), || store.in_flight("a.txt") == 1));
        queue.enqueue(UploadTask::new("b.txt", &b1, false)).expect("b1");
        queue.enqueue(UploadTask::new("b.txt", &b2, false)).expect("b2");
        store.release_uploads();
        queue.finish().expect("finish");

        let b_uploads = store.uploads_of("b.txt");
        assert_eq!(b_uploads.len(), 1);
        assert_eq!(b_uploads[0], b"second".to_vec());
        assert_eq!(queue.stats().coalesced, 1);
        assert_eq!(queue.uploaded().get("b.txt"), Some(&b2));
    }

    #[test]
    fn same_name_is_never_uploaded_concurrently() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(RecordingStore::new());
        store.hold_uploads();
        let queue = queue(&store, 4);
        let path = temp.path().join("ckpt.bin");
        fs::write(&path, "v1").expect("write");

        queue.enqueue(UploadTask::new("ckpt.bin", &path, true)).expect("v1");
        assert!(wait_until(Duration::from_secs(5), || store.in_flight("ckpt.bin") == 1));
        fs::write(&path, "v2").expect("write");
        queue.enqueue(UploadTask::new("ckpt.bin", &path, true)).expect("v2");
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(store.in_flight("ckpt.bin"), 1);

        store.release_uploads();
        queue.finish().expect("finish");
        assert_eq!(store.max_in_flight("ckpt.bin"), 1);
        assert_eq!(
            store.uploads_of("ckpt.bin"),
            vec![b"v1".to_vec(), b"v2".to_vec()]
        );
    }

    #[test]
    fn snapshot_isolates_later_writes() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(RecordingStore::new());
        store.hold_uploads();
        let queue = queue(&store, 1);
        let path = temp.path().join("media.png");
        fs::write(&path, "frame-1").expect("write");

        queue.enqueue(UploadTask::new("media/img.png", &path, true)).expect("enqueue");
        fs::write(&path, "frame-2").expect("overwrite");
        store.release_uploads();
        queue.finish().expect("finish");
        assert_eq!(store.uploads_of("media/img.png"), vec![b"frame-1".to_vec()]);
    }

    #[test]
    fn failures_surface_without_stopping_other_uploads() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(RecordingStore::new());
        store.reject_uploads(
            "bad.bin",
            StoreError::Rejected {
                status: 403,
                message: "forbidden".to_string(),
            },
        );
        store.fail_uploads_transiently("flaky.bin", 2);
        let queue = queue(&store, 2);
        for name in ["bad.bin", "flaky.bin", "good.bin"] {
            let path = temp.path().join(name);
            fs::write(&path, name).expect("write");
            queue.enqueue(UploadTask::new(name, &path, false)).expect("enqueue");
        }

        let err = queue.finish().expect_err("bad upload fails");
        assert!(err.to_string().contains("bad.bin"));
        assert_eq!(store.uploads_of("good.bin").len(), 1);
        assert_eq!(store.uploads_of("flaky.bin").len(), 1);
        assert_eq!(queue.stats().failed, 1);
    }

    #[test]
    fn enqueue_racing_finish_never_strands_a_job() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(RecordingStore::new());
        let queue = Arc::new(queue(&store, 2));
        let path = temp.path().join("race.txt");
        fs::write(&path, "r").expect("write");

        let producers: Vec<_> = (0..4)
            .map(|i| {
                let queue = Arc::clone(&queue);
                let path = path.clone();
                thread::spawn(move || {
                    let mut accepted = 0;
                    for n in 0..200 {
                        let name = format!("f{i}-{n}.txt");
                        if queue.enqueue(UploadTask::new(name, &path, n % 2 == 0)).is_ok() {
                            accepted += 1;
                        }
                    }
                    accepted
                })
            })
            .collect();
        thread::sleep(Duration::from_millis(5));
        queue.finish().expect("finish");
        let accepted: usize = producers
            .into_iter()
            .map(|p| p.join().expect("producer"))
            .sum();

        assert_eq!(queue.pending(), 0);
        assert!(!queue.is_alive());
        assert_eq!(queue.stats().uploaded_files, accepted);
    }

    #[test]
    fn finish_stops_workers_and_closes_queue() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(RecordingStore::new());
        let queue = queue(&store, 2);
        assert!(!queue.is_alive());
        let path = temp.path().join("x.txt");
        fs::write(&path, "x").expect("write");
        store.hold_uploads();
        queue.enqueue(UploadTask::new("x.txt", &path, false)).expect("enqueue");
        assert!(wait_until(Duration::from_secs(5), || store.in_flight("x.txt") == 1));
        assert!(queue.is_alive());
        store.release_uploads();

        queue.finish().expect("finish");
        assert!(!queue.is_alive());
        assert_eq!(queue.pending(), 0);
        assert!(queue.enqueue(UploadTask::new("x.txt", &path, false)).is_err());
        assert_eq!(
            queue.progress().get("x.txt"),
            Some(&FileProgress { sent: 1, total: 1 })
        );
    }
}
