//! Recursive polling watcher over the run directory.
//!
//! Create and modify events are forwarded, one path at a time, to a callback running on a
//! dedicated dispatch thread. Polling is used instead of native notifications so behavior
//! is the same on every filesystem, network mounts included.

use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use notify::{Event, EventKind, PollWatcher, RecursiveMode, Watcher};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

pub struct DirWatcher {
    root: PathBuf,
    watcher: Option<PollWatcher>,
    dispatch: Option<JoinHandle<usize>>,
}

impl DirWatcher {
    pub fn start(
        root: &Path,
        poll_interval: Duration,
        compare_contents: bool,
        on_path: impl Fn(&Path) + Send + 'static,
    ) -> Result<Self> {
        let (tx, rx) = crossbeam_channel::unbounded::<PathBuf>();
        let mut watcher = PollWatcher::new(
            move |res: Result<Event, notify::Error>| match res {
                Ok(event) => {
                    if matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                        for path in event.paths {
                            let _ = tx.send(path);
                        }
                    }
                }
                Err(err) => warn!(err = %err, "watch error"),
            },
            notify::Config::default()
                .with_poll_interval(poll_interval)
                .with_compare_contents(compare_contents),
        )
        .context("create run directory watcher")?;
        watcher
            .watch(root, RecursiveMode::Recursive)
            .with_context(|| format!("watch {}", root.display()))?;

        let dispatch = thread::Builder::new()
            .name("watch-dispatch".to_string())
            .spawn(move || {
                let mut dispatched = 0;
                for path in &rx {
                    if path.is_dir() {
                        continue;
                    }
                    on_path(&path);
                    dispatched += 1;
                }
                dispatched
            })
            .context("spawn watch dispatcher")?;
        info!(root = %root.display(), poll_ms = poll_interval.as_millis() as u64, "watching run directory");
        Ok(Self {
            root: root.to_path_buf(),
            watcher: Some(watcher),
            dispatch: Some(dispatch),
        })
    }

    /// Stop polling and wait until every event already seen has been dispatched.
    pub fn stop(mut self) -> Result<usize> {
        drop(self.watcher.take());
        let Some(dispatch) = self.dispatch.take() else {
            return Ok(0);
        };
        let dispatched = dispatch
            .join()
            .map_err(|_| anyhow!("watch dispatcher for {} panicked", self.root.display()))?;
        debug!(dispatched, "watcher stopped");
        Ok(dispatched)
    }
}

/// Every regular file under `root`, in a stable order.
pub fn walk_files(root: &Path) -> Vec<PathBuf> {
    WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(err) => {
                warn!(err = %err, "skipping unreadable entry");
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .map(walkdir::DirEntry::into_path)
        .collect()
}
