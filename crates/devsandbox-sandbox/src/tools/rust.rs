//! Rust toolchain: rustup toolchains and the crates.io cache are shared
//! read-only; builds write into the scratch home.

use super::{Binding, CacheMount, EnvAssignment, Tool};
use std::path::Path;

#[derive(Debug, Default)]
pub struct Cargo;

impl Tool for Cargo {
    fn name(&self) -> &'static str {
        "cargo"
    }

    fn description(&self) -> &'static str {
        "Rust toolchain: shared toolchains and registry cache, read-only"
    }

    fn available(&self, home: &Path) -> bool {
        home.join(".cargo").exists() || which::which("cargo").is_ok()
    }

    fn bindings(&self, home: &Path, _sandbox_home: &Path) -> Vec<Binding> {
        vec![
            Binding::ro(home.join(".rustup"), home.join(".rustup")),
            Binding::ro(
                home.join(".cargo/registry"),
                home.join(".cargo/registry"),
            ),
            Binding::ro(home.join(".cargo/bin"), home.join(".cargo/bin")),
        ]
    }

    fn environment(&self, home: &Path, _sandbox_home: &Path) -> Vec<EnvAssignment> {
        vec![
            EnvAssignment::new("RUSTUP_HOME", home.join(".rustup").to_string_lossy()),
            EnvAssignment::new("CARGO_HOME", home.join(".cargo").to_string_lossy()),
        ]
    }

    fn cache_mounts(&self) -> Vec<CacheMount> {
        vec![CacheMount {
            volume: "cargo-registry".to_string(),
            dest: Path::new("/cache/cargo-registry").to_path_buf(),
        }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_bound_read_only() {
        let cargo = Cargo;
        let bindings = cargo.bindings(Path::new("/home/u"), Path::new("/sb/home"));
        assert!(bindings.iter().all(|b| b.read_only && b.optional));
        assert!(bindings
            .iter()
            .any(|b| b.dest == Path::new("/home/u/.cargo/registry")));
    }
}
