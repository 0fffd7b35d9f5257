//! User-mode networking for the detached namespace.
//!
//! Both helpers hand the sandbox the same gateway address; when the helper
//! can map that address onto the host loopback, the in-process proxy bound
//! on the host is the only endpoint the payload can reach.

mod pasta;
mod slirp;

pub use pasta::Pasta;
pub use slirp::Slirp4netns;

use anyhow::Result;

/// The fixed gateway address inside the sandbox network namespace.
pub const GATEWAY_IP: &str = "10.0.2.2";

pub trait NetworkProvider: Send {
    fn name(&self) -> &'static str;
    fn available(&self) -> bool;
    fn gateway_ip(&self) -> &'static str {
        GATEWAY_IP
    }
    /// Whether the gateway address aliases the host loopback, making a
    /// host-bound proxy reachable from the sandbox.
    fn maps_host_loopback(&self) -> bool;
    /// Attach to the network namespace of `target_pid` and bring up the
    /// tap device. The helper runs in its own process group so teardown
    /// can kill the whole group.
    fn start(&mut self, target_pid: u32) -> Result<()>;
    /// Idempotent stop; also reaps the helper.
    fn stop(&mut self);
}

/// Pick the first available provider: pasta, then slirp4netns.
pub fn select_provider() -> Result<Box<dyn NetworkProvider>> {
    let pasta = Pasta::default();
    if pasta.available() {
        return Ok(Box::new(pasta));
    }
    let slirp = Slirp4netns::default();
    if slirp.available() {
        return Ok(Box::new(slirp));
    }
    anyhow::bail!(
        "no user-mode networking helper found; install passt (pasta) or slirp4netns \
         (apt install passt / dnf install passt)"
    )
}

/// Spawn `cmd` in its own process group and kill that group on stop.
#[cfg(target_os = "linux")]
pub(crate) mod group {
    use anyhow::{Context, Result};
    use std::os::unix::process::CommandExt;
    use std::process::{Child, Command};

    pub fn spawn(mut cmd: Command) -> Result<Child> {
        cmd.process_group(0);
        cmd.spawn().context("spawn networking helper")
    }

    pub fn kill(child: &mut Child) {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;
        let pid = Pid::from_raw(child.id() as i32);
        let _ = killpg(pid, Signal::SIGTERM);
        let _ = child.wait();
    }
}

#[cfg(not(target_os = "linux"))]
pub(crate) mod group {
    use anyhow::{Context, Result};
    use std::process::{Child, Command};

    pub fn spawn(mut cmd: Command) -> Result<Child> {
        cmd.spawn().context("spawn networking helper")
    }

    pub fn kill(child: &mut Child) {
        let _ = child.kill();
        let _ = child.wait();
    }
}
