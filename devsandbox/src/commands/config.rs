//! Print the merged effective configuration.

use anyhow::{Context, Result};
use std::path::Path;

pub fn show(project_dir: &Path) -> Result<()> {
    let (config, _store) = super::compose_config(project_dir)?;
    let toml = toml::to_string_pretty(&config).context("serialize effective config")?;
    print!("{toml}");
    Ok(())
}
