//! Follows a growing file and hands newly appended bytes to a callback.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::debug;

/// Where reading starts when the tailer opens the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailStart {
    Beginning,
    /// Skip existing contents (they were synced by an earlier session).
    End,
}

pub struct FileTailer {
    path: PathBuf,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<Result<u64>>>,
}

impl FileTailer {
    pub fn start(
        path: &Path,
        start: TailStart,
        poll: Duration,
        mut on_read: impl FnMut(&[u8]) + Send + 'static,
    ) -> Result<Self> {
        let mut file = File::open(path).with_context(|| format!("open {}", path.display()))?;
        if start == TailStart::End {
            file.seek(SeekFrom::End(0))
                .with_context(|| format!("seek {}", path.display()))?;
        }
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let label = path.display().to_string();
        let worker = thread::Builder::new()
            .name("tail".to_string())
            .spawn(move || {
                let mut buf = vec![0u8; 64 * 1024];
                let mut total = 0u64;
                loop {
                    let stopping = !flag.load(Ordering::Acquire);
                    let n = file
                        .read(&mut buf)
                        .with_context(|| format!("read {label}"))?;
                    if n > 0 {
                        total += n as u64;
                        on_read(&buf[..n]);
                        continue;
                    }
                    if stopping {
                        return Ok(total);
                    }
                    thread::sleep(poll);
                }
            })
            .context("spawn tailer")?;
        debug!(path = %path.display(), ?start, "tailing");
        Ok(Self {
            path: path.to_path_buf(),
            running,
            worker: Some(worker),
        })
    }

    /// Read whatever is left up to end of file, then stop. Returns bytes read in total.
    pub fn stop(mut self) -> Result<u64> {
        self.running.store(false, Ordering::Release);
        let Some(worker) = self.worker.take() else {
            return Ok(0);
        };
        let total = worker
            .join()
            .map_err(|_| anyhow!("tailer for {} panicked", self.path.display()))??;
        debug!(path = %self.path.display(), total, "tailer stopped");
        Ok(total)
    }
}

impl Drop for FileTailer {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}
