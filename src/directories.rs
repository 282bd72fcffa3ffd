//! Named run directories derived from the policy
//!
//! Every run gets a run directory under a root, and five named directories
//! (`work`, `input`, `output`, `update`, `scratch`) inside or outside it.
//! Patterns may use `{runid}` and `{shortname}`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;
use std::path::{Component, Path, PathBuf};

/// Names of the directories every run has
pub const DIRECTORY_NAMES: [&str; 5] = ["work", "input", "output", "update", "scratch"];

/// Directory layout section of the pipeline policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DirPolicy {
    /// Root for run directories; relative roots are anchored at the working directory
    pub default_root: PathBuf,

    /// Run directory below the root
    pub run_dir_pattern: String,

    pub work: Option<String>,
    pub input: Option<String>,
    pub output: Option<String>,

    /// Used for every named directory the policy leaves unset
    pub update: String,

    pub scratch: Option<String>,
}

impl Default for DirPolicy {
    fn default() -> Self {
        Self {
            default_root: PathBuf::from("."),
            run_dir_pattern: "{runid}".to_string(),
            work: Some("work".to_string()),
            input: Some("input".to_string()),
            output: Some("output".to_string()),
            update: "update".to_string(),
            scratch: Some("scratch".to_string()),
        }
    }
}

impl DirPolicy {
    fn pattern(&self, name: &str) -> &str {
        let explicit = match name {
            "work" => self.work.as_deref(),
            "input" => self.input.as_deref(),
            "output" => self.output.as_deref(),
            "scratch" => self.scratch.as_deref(),
            _ => None,
        };
        explicit.unwrap_or(self.update.as_str())
    }
}

/// Resolved, absolute directories of one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunDirectories {
    run_dir: PathBuf,
    named: BTreeMap<&'static str, PathBuf>,
}

impl RunDirectories {
    /// Resolve against the current working directory
    pub fn resolve(policy: &DirPolicy, short_name: &str, run_id: &str) -> io::Result<Self> {
        let cwd = std::env::current_dir()?;
        Ok(Self::resolve_in(&cwd, policy, short_name, run_id))
    }

    /// Resolve against `base` instead of the working directory
    pub fn resolve_in(base: &Path, policy: &DirPolicy, short_name: &str, run_id: &str) -> Self {
        let expand = |pattern: &str| {
            pattern
                .replace("{runid}", run_id)
                .replace("{shortname}", short_name)
        };

        let root = base.join(&policy.default_root);

        // An absolute run directory pattern still lands under the root
        let run_dir_pattern = PathBuf::from(expand(&policy.run_dir_pattern));
        let relative: PathBuf = run_dir_pattern
            .components()
            .filter(|c| matches!(c, Component::Normal(_) | Component::ParentDir | Component::CurDir))
            .collect();
        let run_dir = root.join(relative);

        let named = DIRECTORY_NAMES
            .iter()
            .map(|&name| {
                let dir = PathBuf::from(expand(policy.pattern(name)));
                let dir = if dir.is_absolute() {
                    dir
                } else {
                    run_dir.join(dir)
                };
                (name, dir)
            })
            .collect();

        Self { run_dir, named }
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Path of a named directory; unknown names fall back to `update`
    pub fn get(&self, name: &str) -> &Path {
        self.named
            .get(name)
            .or_else(|| self.named.get("update"))
            .map(PathBuf::as_path)
            .unwrap_or(self.run_dir.as_path())
    }

    /// `(name, path)` for every named directory
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &Path)> {
        self.named.iter().map(|(name, path)| (*name, path.as_path()))
    }

    /// Create the run directory and every named directory
    pub fn create_all(&self) -> io::Result<()> {
        std::fs::create_dir_all(&self.run_dir)?;
        for (_, dir) in self.iter() {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}
