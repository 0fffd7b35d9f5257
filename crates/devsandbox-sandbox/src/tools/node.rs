//! Node/npm: package cache kept in the scratch home, `.npmrc` withheld
//! (auth tokens live there).

use super::{CacheMount, EnvAssignment, Tool};
use std::path::Path;

#[derive(Debug, Default)]
pub struct Npm;

impl Tool for Npm {
    fn name(&self) -> &'static str {
        "npm"
    }

    fn description(&self) -> &'static str {
        "npm: scratch-home cache, host .npmrc withheld"
    }

    fn available(&self, _home: &Path) -> bool {
        which::which("npm").is_ok() || which::which("node").is_ok()
    }

    fn environment(&self, _home: &Path, sandbox_home: &Path) -> Vec<EnvAssignment> {
        vec![
            EnvAssignment::new(
                "npm_config_cache",
                sandbox_home.join(".cache/npm").to_string_lossy(),
            ),
            // Registry auth goes through the proxy's credential injection,
            // never through a mounted .npmrc.
            EnvAssignment::new(
                "NPM_CONFIG_USERCONFIG",
                sandbox_home.join(".npmrc").to_string_lossy(),
            ),
        ]
    }

    fn cache_mounts(&self) -> Vec<CacheMount> {
        vec![CacheMount {
            volume: "npm-cache".to_string(),
            dest: Path::new("/cache/npm").to_path_buf(),
        }]
    }
}
