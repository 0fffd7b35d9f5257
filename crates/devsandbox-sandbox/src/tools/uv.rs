//! uv (Python package manager): host-managed interpreters read-only,
//! cache in the scratch home.

use super::{Binding, CacheMount, EnvAssignment, Tool};
use std::path::Path;

#[derive(Debug, Default)]
pub struct Uv;

impl Tool for Uv {
    fn name(&self) -> &'static str {
        "uv"
    }

    fn description(&self) -> &'static str {
        "uv: shared interpreter installs, scratch-home cache"
    }

    fn available(&self, home: &Path) -> bool {
        which::which("uv").is_ok() || home.join(".local/bin/uv").exists()
    }

    fn bindings(&self, home: &Path, _sandbox_home: &Path) -> Vec<Binding> {
        vec![Binding::ro(
            home.join(".local/share/uv/python"),
            home.join(".local/share/uv/python"),
        )]
    }

    fn environment(&self, home: &Path, sandbox_home: &Path) -> Vec<EnvAssignment> {
        vec![
            EnvAssignment::new(
                "UV_CACHE_DIR",
                sandbox_home.join(".cache/uv").to_string_lossy(),
            ),
            EnvAssignment::new(
                "UV_PYTHON_INSTALL_DIR",
                home.join(".local/share/uv/python").to_string_lossy(),
            ),
        ]
    }

    fn cache_mounts(&self) -> Vec<CacheMount> {
        vec![CacheMount {
            volume: "uv-cache".to_string(),
            dest: Path::new("/cache/uv").to_path_buf(),
        }]
    }
}
