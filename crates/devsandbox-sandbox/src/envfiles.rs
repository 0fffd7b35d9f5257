//! Discovery of dotenv files the sandbox must never read.
//!
//! Secrets routinely live in `.env` / `.env.local` next to the code, and
//! the project directory is bind-mounted read-write. Each discovered file
//! gets `/dev/null` bound over it so tools inside see an empty file.

use std::path::{Path, PathBuf};

/// Directories never descended into during discovery.
const SKIP_DIRS: &[&str] = &["node_modules", ".git", "vendor", ".venv"];

/// Bounded search depth below the project root.
const MAX_DEPTH: usize = 6;

/// Whether a file name is a dotenv variant (`.env`, `.env.local`, ...).
pub fn is_env_file(name: &str) -> bool {
    name == ".env" || name.starts_with(".env.")
}

/// Find all dotenv files under `project_dir`, sorted for determinism.
pub fn discover(project_dir: &Path) -> Vec<PathBuf> {
    let mut found = Vec::new();
    walk(project_dir, 0, &mut found);
    found.sort();
    found
}

fn walk(dir: &Path, depth: usize, found: &mut Vec<PathBuf>) {
    if depth > MAX_DEPTH {
        return;
    }
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(_) => return,
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if path.is_dir() {
            if !SKIP_DIRS.contains(&name.as_ref()) && !path.is_symlink() {
                walk(&path, depth + 1, found);
            }
        } else if is_env_file(&name) {
            found.push(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_is_env_file() {
        assert!(is_env_file(".env"));
        assert!(is_env_file(".env.production"));
        assert!(!is_env_file(".envrc"));
        assert!(!is_env_file("env"));
        assert!(!is_env_file("my.env"));
    }

    #[test]
    fn test_discover_skips_dependency_dirs() {
        let tmp = tempfile::tempdir().expect("tempdir");
        fs::write(tmp.path().join(".env"), "A=1").expect("write");
        fs::create_dir_all(tmp.path().join("sub")).expect("mkdir");
        fs::write(tmp.path().join("sub/.env.local"), "B=2").expect("write");
        fs::create_dir_all(tmp.path().join("node_modules/pkg")).expect("mkdir");
        fs::write(tmp.path().join("node_modules/pkg/.env"), "C=3").expect("write");

        let found = discover(tmp.path());
        assert_eq!(
            found,
            vec![tmp.path().join(".env"), tmp.path().join("sub/.env.local")]
        );
    }

    #[test]
    fn test_discover_bounded_depth() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut deep = tmp.path().to_path_buf();
        for i in 0..(MAX_DEPTH + 3) {
            deep = deep.join(format!("d{i}"));
        }
        fs::create_dir_all(&deep).expect("mkdir");
        fs::write(deep.join(".env"), "X=1").expect("write");
        assert!(discover(tmp.path()).is_empty(), "too deep to be found");
    }
}
