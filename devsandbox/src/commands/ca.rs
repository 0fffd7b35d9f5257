//! CA inspection: where the per-sandbox MITM root certificate lives, and
//! its PEM for manual trust-store installs.

use anyhow::{Context, Result};
use devsandbox_core::paths::SandboxPaths;
use std::path::Path;

pub fn path(project_dir: &Path) -> Result<()> {
    let paths = SandboxPaths::for_project(project_dir);
    println!("{}", paths.ca_cert().display());
    Ok(())
}

pub fn print(project_dir: &Path) -> Result<()> {
    let paths = SandboxPaths::for_project(project_dir);
    let cert = paths.ca_cert();
    let pem = std::fs::read_to_string(&cert).with_context(|| {
        format!(
            "no CA at {} (it is generated on the first proxied run)",
            cert.display()
        )
    })?;
    print!("{pem}");
    Ok(())
}
