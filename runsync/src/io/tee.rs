//! Fans a byte stream out to several sinks on a background thread.
//!
//! A sink that fails is dropped from the fan-out; the others keep receiving data.

use std::io::{ErrorKind, Read, Write};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, warn};

pub type Sink = Box<dyn Write + Send>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TeeStats {
    pub bytes: u64,
    pub failed_sinks: usize,
}

pub struct Tee {
    name: String,
    worker: JoinHandle<TeeStats>,
}

impl Tee {
    pub fn spawn<R>(name: &str, mut reader: R, sinks: Vec<Sink>) -> Result<Self>
    where
        R: Read + Send + 'static,
    {
        let label = name.to_string();
        let worker = thread::Builder::new()
            .name(format!("tee-{name}"))
            .spawn(move || {
                let mut sinks: Vec<Option<Sink>> = sinks.into_iter().map(Some).collect();
                let mut stats = TeeStats::default();
                let mut buf = [0u8; 8 * 1024];
                loop {
                    let n = match reader.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => n,
                        Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                        Err(err) => {
                            warn!(tee = %label, err = %err, "read failed; closing tee");
                            break;
                        }
                    };
                    stats.bytes += n as u64;
                    for (index, slot) in sinks.iter_mut().enumerate() {
                        let Some(sink) = slot else {
                            continue;
                        };
                        let written = sink.write_all(&buf[..n]).and_then(|()| sink.flush());
                        if let Err(err) = written {
                            warn!(tee = %label, sink = index, err = %err, "sink failed; dropping it");
                            *slot = None;
                            stats.failed_sinks += 1;
                        }
                    }
                }
                debug!(tee = %label, bytes = stats.bytes, "tee closed");
                stats
            })
            .with_context(|| format!("spawn tee {name}"))?;
        Ok(Self {
            name: name.to_string(),
            worker,
        })
    }

    /// Wait for the source to reach end of stream.
    pub fn join(self) -> Result<TeeStats> {
        self.worker
            .join()
            .map_err(|_| anyhow!("tee {} panicked", self.name))
    }
}
