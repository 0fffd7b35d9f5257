//! Sandbox identity and on-disk state layout.
//!
//! A sandbox is keyed by its project directory: the on-disk name is the
//! sanitized basename plus the first 8 hex chars of SHA-256 over the
//! absolute project path. The hash suffix guarantees uniqueness; the
//! basename part exists only so humans can tell sandboxes apart.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

/// Override for the state base directory (default: `~/.local/share/devsandbox`).
pub const STATE_DIR_ENV: &str = "DEVSANDBOX_STATE_DIR";

/// Override for the config directory (default: `~/.config/devsandbox`).
pub const CONFIG_DIR_ENV: &str = "DEVSANDBOX_CONFIG_DIR";

/// Compute the sandbox name for a project directory.
///
/// The input must already be absolute; relative paths would hash
/// differently depending on the caller's cwd.
pub fn sandbox_name(project_dir: &Path) -> String {
    let mut hasher = Sha256::new();
    hasher.update(project_dir.as_os_str().as_encoded_bytes());
    let digest = hex::encode(hasher.finalize());

    let base = project_dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    format!("{}-{}", sanitize_name(&base), &digest[..8])
}

/// Reduce a project basename to lowercase `[a-z0-9-]`, collapsing runs of
/// anything else into a single `-`. Empty results become `"project"`.
pub fn sanitize_name(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut last_dash = false;
    for c in raw.chars() {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_alphanumeric() {
            out.push(c);
            last_dash = false;
        } else if !last_dash && !out.is_empty() {
            out.push('-');
            last_dash = true;
        }
    }
    let trimmed = out.trim_end_matches('-');
    if trimmed.is_empty() {
        "project".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Base directory holding all sandbox state.
pub fn state_root() -> PathBuf {
    if let Ok(dir) = std::env::var(STATE_DIR_ENV) {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("devsandbox")
}

/// Directory holding the global config and the trust store.
pub fn config_root() -> PathBuf {
    if let Ok(dir) = std::env::var(CONFIG_DIR_ENV) {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("devsandbox")
}

/// Encode an overlay destination path into a single directory name.
///
/// Every `/` becomes `_`. Rejects any literal `..` component of the raw
/// input; this runs after lexical cleaning upstream, so the check here is
/// defense in depth against an encoded name escaping the overlay root.
pub fn encode_overlay_dest(dest: &Path) -> Result<String> {
    for comp in dest.components() {
        if comp.as_os_str() == ".." {
            anyhow::bail!(
                "overlay destination {} contains a '..' component",
                dest.display()
            );
        }
    }
    let s = dest.to_string_lossy();
    Ok(s.trim_start_matches('/').replace('/', "_"))
}

/// Resolved layout of one sandbox's state directory.
#[derive(Debug, Clone)]
pub struct SandboxPaths {
    name: String,
    project_dir: PathBuf,
    root: PathBuf,
}

impl SandboxPaths {
    /// Resolve paths for a project directory under the default state root.
    pub fn for_project(project_dir: &Path) -> Self {
        Self::for_project_in(project_dir, &state_root())
    }

    /// Resolve paths for a project directory under an explicit state root.
    pub fn for_project_in(project_dir: &Path, base: &Path) -> Self {
        let name = sandbox_name(project_dir);
        let root = base.join(&name);
        Self {
            name,
            project_dir: project_dir.to_path_buf(),
            root,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The scratch home bind-mounted at `$HOME` inside the sandbox.
    pub fn home(&self) -> PathBuf {
        self.root.join("home")
    }

    /// Backing directory for a persistent overlay destination.
    pub fn overlay_backing(&self, dest: &Path) -> Result<OverlayBacking> {
        let enc = encode_overlay_dest(dest)?;
        let base = self.root.join("overlay").join(enc);
        Ok(OverlayBacking {
            upper: base.join("upper"),
            work: base.join("work"),
        })
    }

    pub fn proxy_log_dir(&self) -> PathBuf {
        self.root.join("logs").join("proxy")
    }

    pub fn internal_log_dir(&self) -> PathBuf {
        self.root.join("logs").join("internal")
    }

    pub fn ask_socket(&self) -> PathBuf {
        self.root.join("proxy").join("ask.sock")
    }

    pub fn ask_lock(&self) -> PathBuf {
        self.root.join("proxy").join("ask.lock")
    }

    pub fn ca_cert(&self) -> PathBuf {
        self.root.join("ca").join("cert.pem")
    }

    pub fn ca_key(&self) -> PathBuf {
        self.root.join("ca").join("key.pem")
    }

    pub fn metadata_file(&self) -> PathBuf {
        self.root.join("metadata.json")
    }

    /// Create the directory skeleton for a fresh (or partially pruned) sandbox.
    pub fn ensure_layout(&self) -> Result<()> {
        for dir in [
            self.home(),
            self.root.join("overlay"),
            self.proxy_log_dir(),
            self.internal_log_dir(),
            self.root.join("proxy"),
            self.root.join("ca"),
        ] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("create sandbox dir {}", dir.display()))?;
        }
        Ok(())
    }
}

/// Upper/work pair backing one persistent overlay mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayBacking {
    pub upper: PathBuf,
    pub work: PathBuf,
}

/// Per-sandbox metadata persisted as `metadata.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxMetadata {
    pub name: String,
    pub project_dir: PathBuf,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    pub shell: String,
    pub isolation_backend: String,
}

impl SandboxMetadata {
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)
            .with_context(|| format!("read sandbox metadata {}", path.display()))?;
        serde_json::from_slice(&bytes)
            .with_context(|| format!("parse sandbox metadata {}", path.display()))
    }

    /// Atomic replace: write to a temp file in the same directory, then rename.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self).context("serialize sandbox metadata")?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, &json).with_context(|| format!("write {}", tmp.display()))?;
        fs::rename(&tmp, path)
            .with_context(|| format!("replace {}", path.display()))?;
        Ok(())
    }

    /// Load existing metadata (refreshing `last_used`) or create a new record.
    pub fn load_or_create(
        paths: &SandboxPaths,
        shell: &str,
        isolation_backend: &str,
    ) -> Result<Self> {
        let file = paths.metadata_file();
        let now = Utc::now();
        let meta = if file.exists() {
            let mut meta = Self::load(&file)?;
            meta.last_used = now;
            meta.shell = shell.to_string();
            meta.isolation_backend = isolation_backend.to_string();
            meta
        } else {
            Self {
                name: paths.name().to_string(),
                project_dir: paths.project_dir().to_path_buf(),
                created_at: now,
                last_used: now,
                shell: shell.to_string(),
                isolation_backend: isolation_backend.to_string(),
            }
        };
        meta.save(&file)?;
        Ok(meta)
    }
}
