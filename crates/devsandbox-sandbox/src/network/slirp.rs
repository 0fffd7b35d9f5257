//! slirp4netns provider: fallback; its 10.0.2.2 gateway reaches the host
//! loopback by default.

use super::{group, NetworkProvider};
use anyhow::Result;
use std::process::{Child, Command};

#[derive(Default)]
pub struct Slirp4netns {
    child: Option<Child>,
}

impl NetworkProvider for Slirp4netns {
    fn name(&self) -> &'static str {
        "slirp4netns"
    }

    fn available(&self) -> bool {
        which::which("slirp4netns").is_ok()
    }

    fn maps_host_loopback(&self) -> bool {
        true
    }

    fn start(&mut self, target_pid: u32) -> Result<()> {
        let mut cmd = Command::new("slirp4netns");
        cmd.args(["--configure", "--mtu=65520"]);
        cmd.arg(target_pid.to_string());
        cmd.arg("tap0");
        let child = group::spawn(cmd)?;
        tracing::debug!(
            "slirp4netns attached to pid {target_pid} (helper pid {})",
            child.id()
        );
        self.child = Some(child);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(mut child) = self.child.take() {
            group::kill(&mut child);
        }
    }
}

impl Drop for Slirp4netns {
    fn drop(&mut self) {
        self.stop();
    }
}
