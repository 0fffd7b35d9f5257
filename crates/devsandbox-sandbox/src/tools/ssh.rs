//! ssh: host key knowledge carries over, private keys never do.
//!
//! With `[tools.ssh] agent = true` a dedicated empty ssh-agent runs for
//! the session so the sandbox gets a working agent socket without ever
//! seeing the user's real one.

use super::{ActiveTool, Binding, EnvAssignment, Tool, ToolContext};
use anyhow::{Context, Result};
use devsandbox_core::config::schema::ToolSection;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};

#[derive(Debug, Default)]
pub struct Ssh {
    agent: bool,
}

impl Tool for Ssh {
    fn name(&self) -> &'static str {
        "ssh"
    }

    fn description(&self) -> &'static str {
        "ssh: known_hosts only, optional per-session agent"
    }

    fn available(&self, _home: &Path) -> bool {
        which::which("ssh").is_ok()
    }

    fn configure(&mut self, section: &ToolSection) {
        if let Some(v) = section.options.get("agent").and_then(|v| v.as_bool()) {
            self.agent = v;
        }
    }

    fn bindings(&self, home: &Path, _sandbox_home: &Path) -> Vec<Binding> {
        vec![Binding::ro(
            home.join(".ssh/known_hosts"),
            home.join(".ssh/known_hosts"),
        )]
    }

    fn active(&self) -> Option<Box<dyn ActiveTool>> {
        if self.agent {
            Some(Box::new(SessionAgent::default()))
        } else {
            None
        }
    }
}

/// Per-session ssh-agent bound to a socket under the sandbox state dir.
#[derive(Debug, Default)]
struct SessionAgent {
    child: Option<Child>,
    socket: Option<PathBuf>,
}

impl ActiveTool for SessionAgent {
    fn start(&mut self, ctx: &ToolContext<'_>) -> Result<Vec<EnvAssignment>> {
        let socket = ctx.sandbox_root.join("proxy").join("ssh-agent.sock");
        // Stale socket from a crashed session blocks the bind.
        let _ = std::fs::remove_file(&socket);
        let child = Command::new("ssh-agent")
            .arg("-D")
            .arg("-a")
            .arg(&socket)
            .spawn()
            .context("spawn ssh-agent")?;
        tracing::debug!("session ssh-agent started (pid {})", child.id());
        self.child = Some(child);
        self.socket = Some(socket.clone());
        Ok(vec![EnvAssignment::new(
            "SSH_AUTH_SOCK",
            socket.to_string_lossy(),
        )])
    }

    fn stop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
        if let Some(socket) = self.socket.take() {
            let _ = std::fs::remove_file(socket);
        }
    }
}

impl Drop for SessionAgent {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_known_hosts_is_bound() {
        let ssh = Ssh::default();
        let bindings = ssh.bindings(Path::new("/home/u"), Path::new("/sb/home"));
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].dest, Path::new("/home/u/.ssh/known_hosts"));
        assert!(bindings[0].read_only);
    }

    #[test]
    fn test_agent_disabled_by_default() {
        assert!(Ssh::default().active().is_none());
    }
}
