//! Line assembly, progress-line deduplication, and flush decisions for streamed logs.
//!
//! Raw byte chunks arrive from a source (a tailed file, or a process's stdout/stderr) and
//! are split into lines. Every line gets a 1-based sequence number unique within its
//! stream. Lines terminated by a bare carriage return are progress lines: a progress line
//! replaces the immediately preceding progress line of the same source, so a progress bar
//! that redraws a thousand times costs one line.
//!
//! The buffer never touches the clock or the network; callers pass `now` and perform the post.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LineSource {
    Plain,
    Stdout,
    Stderr,
}

impl LineSource {
    fn slot(self) -> usize {
        match self {
            LineSource::Plain => 0,
            LineSource::Stdout => 1,
            LineSource::Stderr => 2,
        }
    }
}

/// One buffered line awaiting (or re-awaiting) a post.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub sequence_number: u64,
    pub text: String,
    pub is_progress_line: bool,
    pub source: LineSource,
    pub buffered_at: Instant,
}

/// When buffered lines become due for a post.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushPolicy {
    /// Number of unsent lines that triggers a post, subject to `min_post_interval`.
    pub line_threshold: usize,
    pub min_post_interval: Duration,
    /// Age of the oldest unsent line that forces a post regardless of the rate limit.
    pub staleness: Duration,
}

impl Default for FlushPolicy {
    fn default() -> Self {
        Self {
            line_threshold: 100,
            min_post_interval: Duration::from_secs(1),
            staleness: Duration::from_secs(5),
        }
    }
}

/// Builds the text placed in front of every completed line of a source.
pub type Prefixer = Box<dyn Fn(LineSource) -> String + Send>;

#[derive(Debug, Clone, Copy)]
struct Emitted {
    source: LineSource,
    sequence_number: u64,
    is_progress_line: bool,
}

#[derive(Debug, Default)]
struct Partial {
    bytes: Vec<u8>,
    /// The previous chunk ended in `\r`; `Some(true)` if that produced a progress line.
    pending_cr: Option<bool>,
}

pub struct LineBuffer {
    policy: FlushPolicy,
    next_sequence: u64,
    unsent: Vec<LogLine>,
    last_emitted: Option<Emitted>,
    last_post_at: Option<Instant>,
    partials: [Partial; 3],
    prefixer: Option<Prefixer>,
}

impl LineBuffer {
    /// `start_line` is the number of lines the remote already holds; the first new line gets
    /// `start_line + 1`.
    pub fn new(policy: FlushPolicy, start_line: u64) -> Self {
        Self {
            policy,
            next_sequence: start_line + 1,
            unsent: Vec::new(),
            last_emitted: None,
            last_post_at: None,
            partials: Default::default(),
            prefixer: None,
        }
    }

    pub fn with_prefixer(mut self, prefixer: Prefixer) -> Self {
        self.prefixer = Some(prefixer);
        self
    }

    pub fn policy(&self) -> FlushPolicy {
        self.policy
    }

    /// Sequence number the next new line will receive.
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    pub fn pending(&self) -> usize {
        self.unsent.len()
    }

    pub fn unsent(&self) -> &[LogLine] {
        &self.unsent
    }

    /// Feed a raw chunk. Returns the number of lines completed by it.
    pub fn push(&mut self, source: LineSource, data: &[u8], now: Instant) -> usize {
        let slot = source.slot();
        let mut data = data;
        let mut completed = 0;

        if let Some(emitted) = self.partials[slot].pending_cr.take()
            && let Some((b'\n', rest)) = data.split_first()
        {
            // `\r\n` split across chunks: the line already emitted as progress was a plain line.
            if emitted {
                self.demote_progress(source);
            } else {
                self.complete_line(source, false, now);
                completed += 1;
            }
            data = rest;
        }

        let mut start = 0;
        let mut i = 0;
        while i < data.len() {
            match data[i] {
                b'\n' => {
                    self.partials[slot].bytes.extend_from_slice(&data[start..i]);
                    self.complete_line(source, false, now);
                    completed += 1;
                    start = i + 1;
                }
                b'\r' => {
                    self.partials[slot].bytes.extend_from_slice(&data[start..i]);
                    if data.get(i + 1) == Some(&b'\n') {
                        self.complete_line(source, false, now);
                        completed += 1;
                        i += 1;
                    } else {
                        let emitted = self.complete_line(source, true, now);
                        if emitted {
                            completed += 1;
                        }
                        if i + 1 == data.len() {
                            self.partials[slot].pending_cr = Some(emitted);
                        }
                    }
                    start = i + 1;
                }
                _ => {}
            }
            i += 1;
        }
        if start < data.len() {
            self.partials[slot].bytes.extend_from_slice(&data[start..]);
        }
        completed
    }

    /// Turn any incomplete trailing text into regular lines.
    pub fn finish_partials(&mut self, now: Instant) {
        for source in [LineSource::Plain, LineSource::Stdout, LineSource::Stderr] {
            self.partials[source.slot()].pending_cr = None;
            if !self.partials[source.slot()].bytes.is_empty() {
                self.complete_line(source, false, now);
            }
        }
    }

    pub fn is_due(&self, now: Instant) -> bool {
        let Some(oldest) = self.unsent.first().map(|line| line.buffered_at) else {
            return false;
        };
        if now.saturating_duration_since(oldest) >= self.policy.staleness {
            return true;
        }
        self.unsent.len() >= self.policy.line_threshold && self.rate_allows(now)
    }

    /// Earliest instant at which [`is_due`](Self::is_due) turns true without new input.
    pub fn next_deadline(&self, now: Instant) -> Option<Instant> {
        let oldest = self.unsent.first()?.buffered_at;
        let mut deadline = oldest + self.policy.staleness;
        if self.unsent.len() >= self.policy.line_threshold {
            let rate_at = self
                .last_post_at
                .map_or(now, |at| at + self.policy.min_post_interval);
            deadline = deadline.min(rate_at);
        }
        Some(deadline)
    }

    /// Remove every unsent line for posting, oldest first.
    pub fn take_batch(&mut self) -> Vec<LogLine> {
        std::mem::take(&mut self.unsent)
    }

    /// Put a failed batch back in front of anything buffered since it was taken.
    pub fn requeue(&mut self, mut batch: Vec<LogLine>) {
        batch.append(&mut self.unsent);
        self.unsent = batch;
    }

    /// Record a post attempt; the rate limit counts attempts, successful or not.
    pub fn mark_posted(&mut self, now: Instant) {
        self.last_post_at = Some(now);
    }

    fn rate_allows(&self, now: Instant) -> bool {
        self.last_post_at
            .is_none_or(|at| now.saturating_duration_since(at) >= self.policy.min_post_interval)
    }

    fn complete_line(&mut self, source: LineSource, progress: bool, now: Instant) -> bool {
        let bytes = std::mem::take(&mut self.partials[source.slot()].bytes);
        if progress && bytes.is_empty() {
            return false;
        }
        let body = String::from_utf8_lossy(&bytes);
        let text = match &self.prefixer {
            Some(prefixer) => format!("{}{body}", prefixer(source)),
            None => body.into_owned(),
        };
        self.emit(source, text, progress, now);
        true
    }

    fn emit(&mut self, source: LineSource, text: String, progress: bool, now: Instant) {
        if progress
            && let Some(last) = self.last_emitted
            && last.is_progress_line
            && last.source == source
        {
            if let Some(line) = self.unsent.last_mut()
                && line.sequence_number == last.sequence_number
            {
                line.text = text;
                return;
            }
            // Already posted: reusing the number overwrites the remote copy.
            self.unsent.push(LogLine {
                sequence_number: last.sequence_number,
                text,
                is_progress_line: true,
                source,
                buffered_at: now,
            });
            return;
        }

        let sequence_number = self.next_sequence;
        self.next_sequence += 1;
        self.unsent.push(LogLine {
            sequence_number,
            text,
            is_progress_line: progress,
            source,
            buffered_at: now,
        });
        self.last_emitted = Some(Emitted {
            source,
            sequence_number,
            is_progress_line: progress,
        });
    }

    fn demote_progress(&mut self, source: LineSource) {
        let Some(last) = self.last_emitted.as_mut() else {
            return;
        };
        if last.source != source || !last.is_progress_line {
            return;
        }
        last.is_progress_line = false;
        let seq = last.sequence_number;
        if let Some(line) = self.unsent.last_mut()
            && line.sequence_number == seq
        {
            line.is_progress_line = false;
        }
    }
}
