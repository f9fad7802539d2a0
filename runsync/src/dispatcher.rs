//! Routes change events in the run directory to per-file handlers.
//!
//! The policy for a logical name is picked once, the first time the name is seen, and the
//! resulting handler receives every later event for it. The save-policy control file
//! (`.runsync/save_policy.jsonl`) is read incrementally on each change and registers user
//! overrides.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use crate::core::policy::{PolicyKind, PolicyRules, SavePolicy};
use crate::error::SyncError;
use crate::io::tailer::TailStart;
use crate::policies::{FileHandler, HandlerDeps, TextStreamHandler};

struct WatchedFile {
    path: PathBuf,
    file_id: Option<FileId>,
    handler: FileHandler,
    finish_calls: usize,
}

/// Device and inode, used to recognise a watched file that reappears under a new name.
type FileId = (u64, u64);

#[cfg(unix)]
fn file_id(path: &Path) -> Option<FileId> {
    use std::os::unix::fs::MetadataExt;
    let meta = std::fs::metadata(path).ok()?;
    Some((meta.dev(), meta.ino()))
}

#[cfg(not(unix))]
fn file_id(_path: &Path) -> Option<FileId> {
    None
}

/// Snapshot of one watched file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedFileInfo {
    pub logical_name: String,
    pub path: PathBuf,
    pub policy: PolicyKind,
    pub finish_calls: usize,
}

#[derive(Debug, Deserialize)]
struct SaveRequest {
    glob: String,
    policy: SavePolicy,
}

pub struct FileDispatcher {
    deps: HandlerDeps,
    rules: Mutex<PolicyRules>,
    files: Mutex<BTreeMap<String, WatchedFile>>,
    control_offset: Mutex<u64>,
    closed: AtomicBool,
}

impl FileDispatcher {
    pub fn new(deps: HandlerDeps) -> Result<Self> {
        let policy = &deps.config.policy;
        let rules = PolicyRules::new(
            policy.files.clone(),
            &policy.throttled_globs,
            &policy.ignore_globs,
        )?;
        Ok(Self {
            deps,
            rules: Mutex::new(rules),
            files: Mutex::new(BTreeMap::new()),
            control_offset: Mutex::new(0),
            closed: AtomicBool::new(false),
        })
    }

    /// Path of `path` relative to the run directory with `/` separators.
    pub fn logical_name(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(self.deps.ctx.run_dir()).ok()?;
        let parts: Vec<&str> = relative
            .components()
            .map(|part| match part {
                Component::Normal(part) => part.to_str(),
                _ => None,
            })
            .collect::<Option<_>>()?;
        if parts.is_empty() {
            return None;
        }
        Some(parts.join("/"))
    }

    /// Watcher callback: handle one event and log any failure.
    pub fn dispatch(&self, path: &Path) {
        if let Err(err) = self.file_changed(path) {
            warn!(path = %path.display(), err = %err, "change handling failed");
        }
    }

    /// Handle a create or modify event. Returns the policy of the file, or `None` when the
    /// path is not synced.
    pub fn file_changed(&self, path: &Path) -> Result<Option<PolicyKind>, SyncError> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(None);
        }
        if path == self.deps.ctx.paths.save_policy_path {
            self.read_control_file()?;
            return Ok(None);
        }
        let Some(name) = self.logical_name(path) else {
            return Ok(None);
        };
        if path.is_dir() {
            return Ok(None);
        }
        let kind = {
            let rules = self.rules.lock();
            if rules.is_ignored(&name) {
                return Ok(None);
            }
            rules.select(&name)
        };

        let id = file_id(path);
        let mut files = self.files.lock();
        if !files.contains_key(&name)
            && let Some(id) = id
            && let Some(old_name) = moved_from(&files, id, kind)
            && let Some(mut watched) = files.remove(&old_name)
        {
            if watched.handler.rename(&name, path) {
                info!(from = %old_name, to = %name, "following renamed file");
                watched.path = path.to_path_buf();
                files.insert(name.clone(), watched);
            } else {
                files.insert(old_name, watched);
            }
        }
        let watched = match files.entry(name) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let handler = FileHandler::build(kind, entry.key(), path, &self.deps)?;
                debug!(name = %entry.key(), policy = %kind, "watching new file");
                entry.insert(WatchedFile {
                    path: path.to_path_buf(),
                    file_id: None,
                    handler,
                    finish_calls: 0,
                })
            }
        };
        if id.is_some() {
            watched.file_id = id;
        }
        watched.handler.on_change()?;
        Ok(Some(watched.handler.kind()))
    }

    /// Handle a path found by a directory walk, unless it is already watched.
    pub fn notice(&self, path: &Path) -> Result<Option<PolicyKind>, SyncError> {
        if let Some(name) = self.logical_name(path)
            && let Some(watched) = self.files.lock().get(&name)
        {
            return Ok(Some(watched.handler.kind()));
        }
        self.file_changed(path)
    }

    /// Start streaming an append-only file from a known position, ahead of any change event.
    pub fn open_text_stream(
        &self,
        logical_name: &str,
        start: TailStart,
        start_line: u64,
    ) -> Result<(), SyncError> {
        let path = self.deps.ctx.path_of(logical_name);
        let mut files = self.files.lock();
        if files.contains_key(logical_name) {
            return Ok(());
        }
        let handler = TextStreamHandler::open(logical_name, &path, start, start_line, &self.deps)?;
        info!(name = logical_name, start_line, "continuing text stream");
        files.insert(
            logical_name.to_string(),
            WatchedFile {
                path,
                file_id: None,
                handler: FileHandler::TextStream(handler),
                finish_calls: 0,
            },
        );
        Ok(())
    }

    /// Register a user save override. Files still waiting for the end of the run move to the
    /// new policy; files already uploaded under another policy keep theirs.
    #[instrument(skip(self))]
    pub fn register_save_policy(&self, glob: &str, policy: SavePolicy) -> Result<(), SyncError> {
        let glob = match Path::new(glob).strip_prefix(self.deps.ctx.run_dir()) {
            Ok(relative) => relative.to_string_lossy().replace('\\', "/"),
            Err(_) => glob.to_string(),
        };
        let rules = {
            let mut rules = self.rules.lock();
            rules.add_override(&glob, policy)?;
            rules.clone()
        };

        let mut files = self.files.lock();
        for (name, watched) in &mut *files {
            if watched.handler.kind() != PolicyKind::Deferred {
                continue;
            }
            let kind = rules.select(name);
            if kind == PolicyKind::Deferred {
                continue;
            }
            let mut handler = FileHandler::build(kind, name, &watched.path, &self.deps)?;
            handler.on_change()?;
            info!(name = %name, policy = %kind, "re-targeted deferred file");
            watched.handler = handler;
        }
        Ok(())
    }

    fn read_control_file(&self) -> Result<(), SyncError> {
        let path = &self.deps.ctx.paths.save_policy_path;
        let mut offset = self.control_offset.lock();
        let mut file = File::open(path).with_context(|| format!("open {}", path.display()))?;
        file.seek(SeekFrom::Start(*offset))
            .with_context(|| format!("seek {}", path.display()))?;
        let mut fresh = String::new();
        file.read_to_string(&mut fresh)
            .with_context(|| format!("read {}", path.display()))?;
        let Some(end) = fresh.rfind('\n') else {
            return Ok(());
        };
        *offset += end as u64 + 1;
        drop(offset);

        for line in fresh[..end].lines().filter(|line| !line.trim().is_empty()) {
            match serde_json::from_str::<SaveRequest>(line) {
                Ok(request) => self.register_save_policy(&request.glob, request.policy)?,
                Err(err) => warn!(line, err = %err, "ignoring malformed save request"),
            }
        }
        Ok(())
    }

    pub fn policy_of(&self, logical_name: &str) -> Option<PolicyKind> {
        self.files
            .lock()
            .get(logical_name)
            .map(|watched| watched.handler.kind())
    }

    pub fn watched(&self) -> Vec<WatchedFileInfo> {
        self.files
            .lock()
            .iter()
            .map(|(name, watched)| WatchedFileInfo {
                logical_name: name.clone(),
                path: watched.path.clone(),
                policy: watched.handler.kind(),
                finish_calls: watched.finish_calls,
            })
            .collect()
    }

    /// Finish every handler that has not been finished yet and stop accepting events.
    /// One handler's failure does not stop the others.
    #[instrument(skip_all)]
    pub fn finish_all(&self) -> Vec<SyncError> {
        self.closed.store(true, Ordering::Release);
        let mut files = self.files.lock();
        let mut errors = Vec::new();
        for (name, watched) in &mut *files {
            if watched.finish_calls > 0 {
                continue;
            }
            watched.finish_calls += 1;
            if let Err(err) = watched.handler.finish() {
                warn!(name = %name, err = %err, "finishing file failed");
                errors.push(err);
            }
        }
        info!(files = files.len(), failed = errors.len(), "file handlers finished");
        errors
    }
}

/// Name of an unfinished whole-file entry whose file now lives under `id` instead of at its
/// recorded path.
fn moved_from(
    files: &BTreeMap<String, WatchedFile>,
    id: FileId,
    kind: PolicyKind,
) -> Option<String> {
    if !matches!(
        kind,
        PolicyKind::Immediate | PolicyKind::Deferred | PolicyKind::Throttled
    ) {
        return None;
    }
    files
        .iter()
        .find(|(_, watched)| {
            watched.file_id == Some(id)
                && watched.finish_calls == 0
                && watched.handler.kind() == kind
                && !watched.path.exists()
        })
        .map(|(name, _)| name.clone())
}
