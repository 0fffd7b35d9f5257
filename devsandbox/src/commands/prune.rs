//! Destroy a sandbox's state directory (scratch home, overlays, logs,
//! CA). The project directory itself is untouched.

use anyhow::{Context, Result};
use devsandbox_core::paths::SandboxPaths;
use std::io::Write;
use std::path::Path;

pub fn run(project_dir: &Path, force: bool) -> Result<()> {
    let paths = SandboxPaths::for_project(project_dir);
    let root = paths.root();
    if !root.exists() {
        println!("No sandbox state for {}", project_dir.display());
        return Ok(());
    }

    if !force {
        eprint!(
            "Delete sandbox {} at {}? [y/N] ",
            paths.name(),
            root.display()
        );
        std::io::stderr().flush().ok();
        let mut answer = String::new();
        std::io::stdin()
            .read_line(&mut answer)
            .context("read confirmation")?;
        if !matches!(answer.trim(), "y" | "Y" | "yes") {
            println!("Aborted.");
            return Ok(());
        }
    }

    std::fs::remove_dir_all(root)
        .with_context(|| format!("remove {}", root.display()))?;
    println!("Removed {}", root.display());
    Ok(())
}
