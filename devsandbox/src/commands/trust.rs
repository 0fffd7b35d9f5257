//! Trust-store management for local `.devsandbox.toml` files.

use anyhow::{Context, Result};
use devsandbox_core::config::trust::TrustStore;
use devsandbox_core::config::{sha256_hex, LOCAL_CONFIG_FILE};
use std::path::Path;

pub fn list() -> Result<()> {
    let store = TrustStore::open_default()?;
    if store.entries().is_empty() {
        println!("No trusted local configs.");
        return Ok(());
    }
    for entry in store.entries() {
        println!(
            "{}  {}  (added {})",
            &entry.sha256[..12.min(entry.sha256.len())],
            entry.project_dir.display(),
            entry.added_at.format("%Y-%m-%d %H:%M")
        );
    }
    Ok(())
}

pub fn add(project_dir: &Path) -> Result<()> {
    let local = project_dir.join(LOCAL_CONFIG_FILE);
    let bytes = std::fs::read(&local)
        .with_context(|| format!("no local config at {}", local.display()))?;
    let hash = sha256_hex(&bytes);
    let mut store = TrustStore::open_default()?;
    store.add_trust(project_dir, &hash);
    store.save()?;
    println!("Trusted {} ({})", local.display(), &hash[..12]);
    Ok(())
}

pub fn remove(project_dir: &Path) -> Result<()> {
    let mut store = TrustStore::open_default()?;
    if store.remove_trust(project_dir) {
        store.save()?;
        println!("Removed trust for {}", project_dir.display());
    } else {
        println!("{} was not trusted.", project_dir.display());
    }
    Ok(())
}
