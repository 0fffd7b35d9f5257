//! Path pattern expansion for mount rules and include conditions.
//!
//! Patterns support `~` home expansion and `**` recursive globs. A pattern
//! ending in `/**` whose prefix has no glob characters names the prefix
//! directory itself (a single directory mount), not every file below it.

use anyhow::{Context, Result};
use globset::{Glob, GlobMatcher};
use std::path::{Component, Path, PathBuf};

/// Recursion cap for `**` expansion walks. Deep trees past this are cut off
/// rather than scanned exhaustively.
const MAX_WALK_DEPTH: usize = 12;

/// Whether the raw string contains a literal `..` path segment.
///
/// Checked on raw input before any lexical cleaning: `a/../b` is rejected
/// even though cleaning would resolve it.
pub fn has_dotdot_segment(raw: &str) -> bool {
    Path::new(raw)
        .components()
        .any(|c| matches!(c, Component::ParentDir))
}

/// Expand a leading `~` or `~/` to the invoking user's home directory.
pub fn expand_tilde(pattern: &str) -> PathBuf {
    if pattern == "~" {
        return home_dir();
    }
    if let Some(rest) = pattern.strip_prefix("~/") {
        return home_dir().join(rest);
    }
    PathBuf::from(pattern)
}

fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("/"))
}

/// Whether the string contains glob metacharacters.
pub fn is_glob(pattern: &str) -> bool {
    pattern.contains(['*', '?', '[', '{'])
}

/// A pattern of the form `<literal-dir>/**`: the whole subtree is meant,
/// which mounts as the single directory `<literal-dir>`.
pub fn single_dir_prefix(pattern: &str) -> Option<PathBuf> {
    let prefix = pattern.strip_suffix("/**")?;
    if prefix.is_empty() || is_glob(prefix) {
        return None;
    }
    Some(expand_tilde(prefix))
}

/// Expand a mount-rule pattern into concrete paths.
///
/// Literal paths pass through untouched whether or not they exist (the
/// planner marks such mounts optional). Glob patterns walk the filesystem
/// from the longest literal prefix; matches come back sorted so plans are
/// deterministic.
pub fn expand_pattern(pattern: &str) -> Result<Vec<PathBuf>> {
    if let Some(dir) = single_dir_prefix(pattern) {
        return Ok(vec![dir]);
    }

    let expanded = expand_tilde(pattern);
    let expanded_str = expanded.to_string_lossy().to_string();
    if !is_glob(&expanded_str) {
        return Ok(vec![expanded]);
    }

    let matcher = compile(&expanded_str)?;
    let root = literal_prefix(&expanded);
    let mut out = Vec::new();
    walk(&root, 0, &mut |path| {
        if matcher.is_match(path) {
            out.push(path.to_path_buf());
        }
    });
    out.sort();
    Ok(out)
}

/// Compile a glob with `**` support for match-only use (include conditions,
/// filter rules).
pub fn compile(pattern: &str) -> Result<GlobMatcher> {
    Ok(Glob::new(pattern)
        .with_context(|| format!("invalid glob pattern {pattern:?}"))?
        .compile_matcher())
}

/// Whether `path` matches `pattern` after tilde expansion. Used for
/// `dir:<glob>` include conditions.
pub fn matches_dir_pattern(pattern: &str, path: &Path) -> Result<bool> {
    let expanded = expand_tilde(pattern);
    let matcher = compile(&expanded.to_string_lossy())?;
    Ok(matcher.is_match(path))
}

/// The longest pattern prefix with no glob characters, used as the walk root.
fn literal_prefix(pattern: &Path) -> PathBuf {
    let mut root = PathBuf::new();
    for comp in pattern.components() {
        let s = comp.as_os_str().to_string_lossy();
        if is_glob(&s) {
            break;
        }
        root.push(comp);
    }
    if root.as_os_str().is_empty() {
        PathBuf::from("/")
    } else {
        root
    }
}

fn walk(dir: &Path, depth: usize, visit: &mut dyn FnMut(&Path)) {
    if depth > MAX_WALK_DEPTH {
        return;
    }
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(_) => return, // unreadable directories are skipped, not fatal
    };
    for entry in entries.flatten() {
        let path = entry.path();
        visit(&path);
        if path.is_dir() && !path.is_symlink() {
            walk(&path, depth + 1, visit);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_has_dotdot_segment() {
        assert!(has_dotdot_segment("/a/../b"));
        assert!(has_dotdot_segment("../x"));
        assert!(!has_dotdot_segment("/a/b..c"));
        assert!(!has_dotdot_segment("/a/..b/c"));
    }

    #[test]
    fn test_single_dir_prefix() {
        assert_eq!(
            single_dir_prefix("/opt/data/**"),
            Some(PathBuf::from("/opt/data"))
        );
        // Glob in the prefix means per-file expansion, not a single mount
        assert_eq!(single_dir_prefix("/opt/*/data/**"), None);
        assert_eq!(single_dir_prefix("/opt/data"), None);
    }

    #[test]
    fn test_literal_passthrough_nonexistent() {
        let paths = expand_pattern("/definitely/not/here").expect("expand");
        assert_eq!(paths, vec![PathBuf::from("/definitely/not/here")]);
    }

    #[test]
    fn test_glob_expansion_sorted() {
        let tmp = tempfile::tempdir().expect("tempdir");
        for name in ["b.env", "a.env", "c.txt"] {
            fs::write(tmp.path().join(name), "").expect("write");
        }
        let pattern = format!("{}/*.env", tmp.path().display());
        let got = expand_pattern(&pattern).expect("expand");
        assert_eq!(
            got,
            vec![tmp.path().join("a.env"), tmp.path().join("b.env")]
        );
    }

    #[test]
    fn test_doublestar_recursion() {
        let tmp = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(tmp.path().join("x/y")).expect("mkdir");
        fs::write(tmp.path().join("x/y/secret.pem"), "").expect("write");
        let pattern = format!("{}/**/*.pem", tmp.path().display());
        let got = expand_pattern(&pattern).expect("expand");
        assert_eq!(got, vec![tmp.path().join("x/y/secret.pem")]);
    }

    #[test]
    fn test_matches_dir_pattern() {
        assert!(
            matches_dir_pattern("/home/**/work/*", Path::new("/home/u/work/app"))
                .expect("match")
        );
        assert!(
            !matches_dir_pattern("/srv/*", Path::new("/home/u/work/app")).expect("match")
        );
    }
}
