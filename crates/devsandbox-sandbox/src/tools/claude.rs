//! Claude Code CLI: per-sandbox agent state lives in the scratch home
//! (which already persists between runs), API keys stay on the host.

use super::{EnvAssignment, Tool};
use anyhow::Result;
use std::path::Path;

#[derive(Debug, Default)]
pub struct Claude;

impl Tool for Claude {
    fn name(&self) -> &'static str {
        "claude"
    }

    fn description(&self) -> &'static str {
        "Claude Code: scratch-home state, API keys withheld"
    }

    fn available(&self, _home: &Path) -> bool {
        which::which("claude").is_ok()
    }

    fn prepare(&self, _home: &Path, sandbox_home: &Path) -> Result<()> {
        std::fs::create_dir_all(sandbox_home.join(".claude"))?;
        Ok(())
    }

    fn environment(&self, _home: &Path, sandbox_home: &Path) -> Vec<EnvAssignment> {
        vec![EnvAssignment::new(
            "CLAUDE_CONFIG_DIR",
            sandbox_home.join(".claude").to_string_lossy(),
        )]
    }
}
