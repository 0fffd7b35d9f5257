//! GitHub CLI: nothing from `~/.config/gh` crosses the boundary; API auth
//! is the proxy's credential injector's job.

use super::{EnvAssignment, Tool};
use std::path::Path;

#[derive(Debug, Default)]
pub struct Gh;

impl Tool for Gh {
    fn name(&self) -> &'static str {
        "gh"
    }

    fn description(&self) -> &'static str {
        "GitHub CLI: host auth withheld, tokens injected at the proxy"
    }

    fn available(&self, _home: &Path) -> bool {
        which::which("gh").is_ok()
    }

    fn environment(&self, _home: &Path, _sandbox_home: &Path) -> Vec<EnvAssignment> {
        vec![EnvAssignment::new("GH_NO_UPDATE_NOTIFIER", "1")]
    }
}
