//! Declarative tool descriptors.
//!
//! A tool contributes mounts, environment, and shell init to the sandbox
//! when it is present on the host. Descriptors never fail the plan over a
//! missing optional source; whether a tool participates at all is decided
//! by `available()` plus the `[tools.<name>]` config table.

mod claude;
mod gh;
mod git;
mod mise;
mod node;
mod rust;
mod ssh;
mod uv;

use anyhow::Result;
use devsandbox_core::config::schema::{Config, ShellKind, ToolSection};
use std::path::{Path, PathBuf};

/// One host path made visible inside the sandbox on behalf of a tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub source: PathBuf,
    pub dest: PathBuf,
    pub read_only: bool,
    /// Missing sources are skipped unless this is false.
    pub optional: bool,
}

impl Binding {
    pub fn ro(source: impl Into<PathBuf>, dest: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            dest: dest.into(),
            read_only: true,
            optional: true,
        }
    }

    pub fn rw(source: impl Into<PathBuf>, dest: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            dest: dest.into(),
            read_only: false,
            optional: true,
        }
    }

    pub fn required(mut self) -> Self {
        self.optional = false;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvAssignment {
    pub name: String,
    pub value: String,
}

impl EnvAssignment {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Result of a health probe for `doctor`-style diagnostics.
#[derive(Debug, Clone)]
pub struct ToolCheck {
    pub available: bool,
    pub binary_path: Option<PathBuf>,
    pub issues: Vec<String>,
}

/// A named volume shared across runs of the same project (container
/// backend only).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheMount {
    pub volume: String,
    pub dest: PathBuf,
}

/// Context handed to active tools at session start.
pub struct ToolContext<'a> {
    pub home_dir: &'a Path,
    pub sandbox_root: &'a Path,
}

/// A side process running for the life of the sandbox session.
pub trait ActiveTool: Send {
    /// Start the process; returns env assignments the payload needs to
    /// reach it (e.g. an agent socket path).
    fn start(&mut self, ctx: &ToolContext<'_>) -> Result<Vec<EnvAssignment>>;
    /// Stop and reap. Must be idempotent.
    fn stop(&mut self);
}

pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    fn available(&self, home: &Path) -> bool;

    /// One-time host-side preparation before the plan is built (sanitized
    /// config copies, directory skeletons). Default: nothing.
    fn prepare(&self, _home: &Path, _sandbox_home: &Path) -> Result<()> {
        Ok(())
    }

    fn bindings(&self, _home: &Path, _sandbox_home: &Path) -> Vec<Binding> {
        Vec::new()
    }

    fn environment(&self, _home: &Path, _sandbox_home: &Path) -> Vec<EnvAssignment> {
        Vec::new()
    }

    fn shell_init(&self, _shell: ShellKind) -> Option<String> {
        None
    }

    fn check(&self, home: &Path) -> ToolCheck {
        let binary_path = which::which(self.name()).ok();
        ToolCheck {
            available: self.available(home),
            binary_path,
            issues: Vec::new(),
        }
    }

    /// Apply the `[tools.<name>]` table. Unknown options are ignored.
    fn configure(&mut self, _section: &ToolSection) {}

    fn cache_mounts(&self) -> Vec<CacheMount> {
        Vec::new()
    }

    /// A side process to run for the session, if this descriptor has one.
    fn active(&self) -> Option<Box<dyn ActiveTool>> {
        None
    }
}

/// Process-wide ordered registry, populated once at startup.
pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
}

impl ToolRegistry {
    /// All built-in descriptors, configured and filtered by `config`.
    pub fn builtin(config: &Config) -> Self {
        let mut tools: Vec<Box<dyn Tool>> = vec![
            Box::new(mise::Mise::default()),
            Box::new(rust::Cargo::default()),
            Box::new(node::Npm::default()),
            Box::new(uv::Uv),
            Box::new(git::Git::default()),
            Box::new(ssh::Ssh::default()),
            Box::new(gh::Gh::default()),
            Box::new(claude::Claude::default()),
        ];
        for tool in &mut tools {
            if let Some(section) = config.tools.get(tool.name()) {
                tool.configure(section);
            }
        }
        tools.retain(|t| config.tool_enabled(t.name()));
        Self { tools }
    }

    pub fn empty() -> Self {
        Self { tools: Vec::new() }
    }

    /// Tools present on this host, in registry order.
    pub fn available_tools(&self, home: &Path) -> Vec<&dyn Tool> {
        self.tools
            .iter()
            .filter(|t| t.available(home))
            .map(|t| t.as_ref())
            .collect()
    }

    pub fn all(&self) -> impl Iterator<Item = &dyn Tool> {
        self.tools.iter().map(|t| t.as_ref())
    }

    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools
            .iter()
            .find(|t| t.name() == name)
            .map(|t| t.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_registry_respects_enabled_flag() {
        let config: Config =
            toml::from_str("[tools.mise]\nenabled = false").expect("config");
        let registry = ToolRegistry::builtin(&config);
        assert!(registry.get("mise").is_none());
        assert!(registry.get("git").is_some());
    }

    #[test]
    fn test_binding_constructors() {
        let b = Binding::ro("/src", "/dst");
        assert!(b.read_only && b.optional);
        let b = Binding::rw("/src", "/dst").required();
        assert!(!b.read_only && !b.optional);
    }
}
