//! Trust store for local `.devsandbox.toml` files.
//!
//! A local config is applied only when the SHA-256 of its raw bytes matches
//! a stored entry for its project directory. Anything else goes back
//! through the prompt; a declined prompt skips the local layer for the run.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};

pub const TRUST_FILE_NAME: &str = "trusted-configs.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustEntry {
    pub project_dir: PathBuf,
    pub sha256: String,
    pub added_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TrustFile {
    #[serde(default)]
    trusted: Vec<TrustEntry>,
}

/// Persistent map of project directory → approved config hash.
#[derive(Debug)]
pub struct TrustStore {
    path: PathBuf,
    entries: Vec<TrustEntry>,
}

impl TrustStore {
    /// Load the store; a missing file is an empty store.
    pub fn load(path: &Path) -> Result<Self> {
        let entries = if path.exists() {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("read trust store {}", path.display()))?;
            let file: TrustFile = toml::from_str(&raw)
                .with_context(|| format!("parse trust store {}", path.display()))?;
            file.trusted
        } else {
            Vec::new()
        };
        Ok(Self {
            path: path.to_path_buf(),
            entries,
        })
    }

    /// Load from the default location under the config root.
    pub fn open_default() -> Result<Self> {
        Self::load(&crate::paths::config_root().join(TRUST_FILE_NAME))
    }

    pub fn get_trusted(&self, project_dir: &Path) -> Option<&TrustEntry> {
        self.entries.iter().find(|e| e.project_dir == project_dir)
    }

    pub fn add_trust(&mut self, project_dir: &Path, sha256: &str) {
        self.remove_trust(project_dir);
        self.entries.push(TrustEntry {
            project_dir: project_dir.to_path_buf(),
            sha256: sha256.to_string(),
            added_at: Utc::now(),
        });
    }

    pub fn remove_trust(&mut self, project_dir: &Path) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.project_dir != project_dir);
        before != self.entries.len()
    }

    pub fn entries(&self) -> &[TrustEntry] {
        &self.entries
    }

    /// Atomic file replace: serialize to a sibling temp file, then rename.
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        let file = TrustFile {
            trusted: self.entries.clone(),
        };
        let raw = toml::to_string_pretty(&file).context("serialize trust store")?;
        let tmp = self.path.with_extension("toml.tmp");
        fs::write(&tmp, raw).with_context(|| format!("write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("replace {}", self.path.display()))?;
        Ok(())
    }
}

/// Asks the user whether a local config may be applied.
pub trait TrustPrompt {
    /// `changed` is true when the directory was trusted before under a
    /// different hash. Implementations must return false when no human can
    /// answer (non-interactive terminals).
    fn confirm(&self, project_dir: &Path, raw: &str, changed: bool) -> bool;
}

/// Interactive y/N prompt on the controlling terminal.
pub struct TerminalPrompt;

impl TrustPrompt for TerminalPrompt {
    fn confirm(&self, project_dir: &Path, raw: &str, changed: bool) -> bool {
        if !std::io::stdin().is_terminal() {
            return false;
        }
        let verb = if changed { "changed since you last trusted it" } else { "not trusted yet" };
        eprintln!(
            "Local config in {} is {}:\n----\n{}----",
            project_dir.display(),
            verb,
            raw
        );
        eprint!("Apply and trust this file? [y/N] ");
        let mut answer = String::new();
        if std::io::stdin().read_line(&mut answer).is_err() {
            return false;
        }
        matches!(answer.trim(), "y" | "Y" | "yes")
    }
}

/// Never approves. Used by non-interactive callers and tests.
pub struct DenyAllPrompt;

impl TrustPrompt for DenyAllPrompt {
    fn confirm(&self, _project_dir: &Path, _raw: &str, _changed: bool) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_store_is_empty() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = TrustStore::load(&tmp.path().join("none.toml")).expect("load");
        assert!(store.entries().is_empty());
    }

    #[test]
    fn test_add_save_reload() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join(TRUST_FILE_NAME);
        let mut store = TrustStore::load(&path).expect("load");
        store.add_trust(Path::new("/tmp/p"), "abc123");
        store.save().expect("save");

        let reloaded = TrustStore::load(&path).expect("reload");
        let entry = reloaded.get_trusted(Path::new("/tmp/p")).expect("entry");
        assert_eq!(entry.sha256, "abc123");
    }

    #[test]
    fn test_add_replaces_existing_entry() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut store = TrustStore::load(&tmp.path().join("t.toml")).expect("load");
        store.add_trust(Path::new("/tmp/p"), "old");
        store.add_trust(Path::new("/tmp/p"), "new");
        assert_eq!(store.entries().len(), 1);
        assert_eq!(store.get_trusted(Path::new("/tmp/p")).map(|e| e.sha256.as_str()), Some("new"));
    }

    #[test]
    fn test_remove_trust() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut store = TrustStore::load(&tmp.path().join("t.toml")).expect("load");
        store.add_trust(Path::new("/tmp/p"), "h");
        assert!(store.remove_trust(Path::new("/tmp/p")));
        assert!(!store.remove_trust(Path::new("/tmp/p")));
    }
}
