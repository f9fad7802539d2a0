//! Upload policy selection for files that appear in the run directory.
//!
//! Selection is a pure function of the file's logical name (its path relative to the run
//! directory, `/`-separated) and the rules below, evaluated in order:
//!
//! 1. history or events file: [`PolicyKind::TextStream`]
//! 2. config file: [`PolicyKind::Config`]
//! 3. summary file: [`PolicyKind::Summary`]
//! 4. metadata file, or anything under the media directory: [`PolicyKind::Immediate`]
//! 5. the latest user save override whose glob matches
//! 6. a default throttled glob: [`PolicyKind::Throttled`]
//! 7. otherwise [`PolicyKind::Deferred`]

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use glob::Pattern;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    TextStream,
    Config,
    Summary,
    Immediate,
    Deferred,
    Throttled,
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PolicyKind::TextStream => "text_stream",
            PolicyKind::Config => "config",
            PolicyKind::Summary => "summary",
            PolicyKind::Immediate => "immediate",
            PolicyKind::Deferred => "deferred",
            PolicyKind::Throttled => "throttled",
        };
        f.write_str(name)
    }
}

/// Policy a user may request for files matching a glob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SavePolicy {
    /// Upload once, when the run ends.
    End,
    /// Upload on every change.
    Live,
    /// Upload on change, no more often than a size-dependent interval.
    Throttled,
}

impl SavePolicy {
    pub fn kind(self) -> PolicyKind {
        match self {
            SavePolicy::End => PolicyKind::Deferred,
            SavePolicy::Live => PolicyKind::Immediate,
            SavePolicy::Throttled => PolicyKind::Throttled,
        }
    }
}

impl FromStr for SavePolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "end" => Ok(SavePolicy::End),
            "live" => Ok(SavePolicy::Live),
            "throttled" => Ok(SavePolicy::Throttled),
            other => bail!("unknown save policy {other:?} (expected end, live, or throttled)"),
        }
    }
}

/// Logical names of the well-known run files.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RunFileNames {
    pub history: String,
    pub events: String,
    pub config: String,
    pub summary: String,
    pub metadata: String,
    /// Spill file for captured console output.
    pub output: String,
    pub media_dir: String,
}

impl Default for RunFileNames {
    fn default() -> Self {
        Self {
            history: "history.jsonl".to_string(),
            events: "events.jsonl".to_string(),
            config: "config.yaml".to_string(),
            summary: "summary.json".to_string(),
            metadata: "metadata.json".to_string(),
            output: "output.log".to_string(),
            media_dir: "media".to_string(),
        }
    }
}

impl RunFileNames {
    pub fn is_text_stream(&self, name: &str) -> bool {
        name == self.history || name == self.events
    }

    fn in_media_dir(&self, name: &str) -> bool {
        name.strip_prefix(self.media_dir.as_str())
            .is_some_and(|rest| rest.starts_with('/'))
    }
}

#[derive(Debug, Clone)]
struct SaveOverride {
    pattern: Pattern,
    policy: SavePolicy,
}

/// Ordered rule set used to pick a policy for a logical name.
#[derive(Debug, Clone)]
pub struct PolicyRules {
    names: RunFileNames,
    overrides: Vec<SaveOverride>,
    throttled: Vec<Pattern>,
    ignored: Vec<Pattern>,
}

impl PolicyRules {
    pub fn new(
        names: RunFileNames,
        throttled_globs: &[String],
        ignore_globs: &[String],
    ) -> Result<Self> {
        Ok(Self {
            names,
            overrides: Vec::new(),
            throttled: compile_all(throttled_globs)?,
            ignored: compile_all(ignore_globs)?,
        })
    }

    pub fn names(&self) -> &RunFileNames {
        &self.names
    }

    /// Register a user save policy. Later registrations win over earlier ones.
    pub fn add_override(&mut self, glob: &str, policy: SavePolicy) -> Result<()> {
        let pattern = Pattern::new(glob).with_context(|| format!("invalid save glob {glob:?}"))?;
        self.overrides.push(SaveOverride { pattern, policy });
        Ok(())
    }

    pub fn select(&self, name: &str) -> PolicyKind {
        let names = &self.names;
        if names.is_text_stream(name) {
            return PolicyKind::TextStream;
        }
        if name == names.config {
            return PolicyKind::Config;
        }
        if name == names.summary {
            return PolicyKind::Summary;
        }
        if name == names.metadata || names.in_media_dir(name) {
            return PolicyKind::Immediate;
        }
        if let Some(save) = self
            .overrides
            .iter()
            .rev()
            .find(|save| save.pattern.matches(name))
        {
            return save.policy.kind();
        }
        if self.throttled.iter().any(|pattern| pattern.matches(name)) {
            return PolicyKind::Throttled;
        }
        PolicyKind::Deferred
    }

    /// Hidden files (any path component starting with `.`), temp files, and ignore globs.
    pub fn is_ignored(&self, name: &str) -> bool {
        if name.split('/').any(|part| part.starts_with('.')) {
            return true;
        }
        if name.ends_with(".tmp") {
            return true;
        }
        self.ignored.iter().any(|pattern| pattern.matches(name))
    }
}

fn compile_all(globs: &[String]) -> Result<Vec<Pattern>> {
    globs
        .iter()
        .map(|glob| Pattern::new(glob).with_context(|| format!("invalid glob {glob:?}")))
        .collect()
}

/// Minimum spacing between throttled uploads of a file of `size` bytes.
pub fn min_wait_for_size(size: u64) -> Duration {
    const MB: u64 = 1024 * 1024;
    let secs = if size < 10 * MB {
        60
    } else if size < 100 * MB {
        5 * 60
    } else if size < 1024 * MB {
        10 * 60
    } else {
        20 * 60
    };
    Duration::from_secs(secs)
}
