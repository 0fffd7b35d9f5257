pub mod ca;
pub mod config;
pub mod logs;
pub mod monitor;
pub mod prune;
pub mod run;
pub mod trust;

use anyhow::Result;
use devsandbox_core::config::trust::{TerminalPrompt, TrustStore};
use devsandbox_core::config::{self as core_config, Config};
use std::path::Path;

/// Compose the effective config for a project with the standard trust
/// flow (interactive prompt, persistent store).
pub fn compose_config(project_dir: &Path) -> Result<(Config, TrustStore)> {
    let mut store = TrustStore::open_default()?;
    let config = core_config::compose(core_config::ComposeOptions {
        project_dir,
        global_path: &core_config::global_config_path(),
        trust: Some(&mut store),
        prompt: &TerminalPrompt,
    })?;
    Ok((config, store))
}
