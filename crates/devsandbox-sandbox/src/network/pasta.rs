//! pasta (passt) provider: preferred because it can alias the gateway to
//! the host loopback directly.

use super::{group, NetworkProvider, GATEWAY_IP};
use anyhow::Result;
use std::process::{Child, Command};

#[derive(Default)]
pub struct Pasta {
    child: Option<Child>,
}

impl NetworkProvider for Pasta {
    fn name(&self) -> &'static str {
        "pasta"
    }

    fn available(&self) -> bool {
        which::which("pasta").is_ok()
    }

    fn maps_host_loopback(&self) -> bool {
        true
    }

    fn start(&mut self, target_pid: u32) -> Result<()> {
        let mut cmd = Command::new("pasta");
        cmd.args([
            "--config-net",
            "--gateway",
            GATEWAY_IP,
            "--map-host-loopback",
            GATEWAY_IP,
            "--quiet",
            "--foreground",
        ]);
        cmd.arg(target_pid.to_string());
        let child = group::spawn(cmd)?;
        tracing::debug!("pasta attached to pid {target_pid} (helper pid {})", child.id());
        self.child = Some(child);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(mut child) = self.child.take() {
            group::kill(&mut child);
        }
    }
}

impl Drop for Pasta {
    fn drop(&mut self) {
        self.stop();
    }
}
