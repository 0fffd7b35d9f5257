//! The mount plan: an ordered list of filesystem-visibility operations,
//! with conflict detection at insertion time.
//!
//! Order is significant for the launcher, so conflicts are rejected when an
//! op is pushed rather than patched up later: a repeated destination is
//! ambiguous, and a later op mounting an ancestor of an earlier destination
//! would silently mask that earlier mount ("shadow"). A later descendant is
//! fine; it refines a parent mount.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// How a destination becomes visible (or invisible) inside the sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountMode {
    /// Masked: `/dev/null` bound over files, empty tmpfs over directories.
    Hidden,
    RoBind,
    RwBind,
    /// Symlink creation inside the sandbox (`source` is the link target).
    Symlink,
    Tmpfs,
    /// Writable view whose upper/work dirs persist in the sandbox state.
    OverlayPersistent { upper: PathBuf, work: PathBuf },
    /// Writable view discarded on exit.
    OverlayTmp,
    Proc,
    Dev,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountOp {
    pub source: Option<PathBuf>,
    pub dest: PathBuf,
    pub mode: MountMode,
    /// A missing source skips the op instead of failing the launch.
    pub optional: bool,
}

impl MountOp {
    pub fn ro_bind(source: impl Into<PathBuf>, dest: impl Into<PathBuf>) -> Self {
        Self {
            source: Some(source.into()),
            dest: dest.into(),
            mode: MountMode::RoBind,
            optional: false,
        }
    }

    pub fn rw_bind(source: impl Into<PathBuf>, dest: impl Into<PathBuf>) -> Self {
        Self {
            source: Some(source.into()),
            dest: dest.into(),
            mode: MountMode::RwBind,
            optional: false,
        }
    }

    pub fn hidden(dest: impl Into<PathBuf>) -> Self {
        Self {
            source: None,
            dest: dest.into(),
            mode: MountMode::Hidden,
            optional: false,
        }
    }

    pub fn tmpfs(dest: impl Into<PathBuf>) -> Self {
        Self {
            source: None,
            dest: dest.into(),
            mode: MountMode::Tmpfs,
            optional: false,
        }
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }
}

/// Conflict raised by [`MountPlan::push`] or [`MountPlan::set_env`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PlanConflict {
    #[error("ambiguous: two mounts target {}", dest.display())]
    Ambiguous { dest: PathBuf },
    #[error("shadow: {} shadows {}", dest.display(), child.display())]
    Shadow { dest: PathBuf, child: PathBuf },
    #[error("environment variable {name} set by both {first} and {second}")]
    EnvShadow {
        name: String,
        first: String,
        second: String,
    },
}

/// One environment assignment, with the producer recorded for conflict
/// diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
    pub origin: String,
}

/// Ordered mount plan plus the environment the payload starts with.
#[derive(Debug, Default)]
pub struct MountPlan {
    ops: Vec<MountOp>,
    env: Vec<EnvVar>,
    env_origin: BTreeMap<String, String>,
    chdir: Option<PathBuf>,
}

impl MountPlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an op, rejecting ambiguous and shadowing destinations.
    pub fn push(&mut self, op: MountOp) -> Result<(), PlanConflict> {
        for existing in &self.ops {
            if existing.dest == op.dest {
                return Err(PlanConflict::Ambiguous {
                    dest: op.dest.clone(),
                });
            }
            if is_strict_ancestor(&op.dest, &existing.dest) {
                return Err(PlanConflict::Shadow {
                    dest: op.dest.clone(),
                    child: existing.dest.clone(),
                });
            }
        }
        self.ops.push(op);
        Ok(())
    }

    /// Set an environment variable; the same name from two different
    /// producers is a conflict, same-producer repeats overwrite.
    pub fn set_env(
        &mut self,
        name: &str,
        value: &str,
        origin: &str,
    ) -> Result<(), PlanConflict> {
        if let Some(first) = self.env_origin.get(name) {
            if first != origin {
                return Err(PlanConflict::EnvShadow {
                    name: name.to_string(),
                    first: first.clone(),
                    second: origin.to_string(),
                });
            }
            if let Some(var) = self.env.iter_mut().find(|v| v.name == name) {
                var.value = value.to_string();
            }
            return Ok(());
        }
        self.env_origin
            .insert(name.to_string(), origin.to_string());
        self.env.push(EnvVar {
            name: name.to_string(),
            value: value.to_string(),
            origin: origin.to_string(),
        });
        Ok(())
    }

    pub fn set_chdir(&mut self, dir: impl Into<PathBuf>) {
        self.chdir = Some(dir.into());
    }

    pub fn chdir(&self) -> Option<&Path> {
        self.chdir.as_deref()
    }

    pub fn ops(&self) -> &[MountOp] {
        &self.ops
    }

    pub fn env(&self) -> &[EnvVar] {
        &self.env
    }
}

/// Whether `a` is a strict ancestor of `b` (`/a` of `/a/b`, but not of
/// itself and not of `/ab`).
fn is_strict_ancestor(a: &Path, b: &Path) -> bool {
    a != b && b.starts_with(a)
}
