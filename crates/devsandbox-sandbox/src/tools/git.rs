//! git: identity and aliases carry over through a sanitized copy of the
//! host gitconfig; credential helpers and auth headers are stripped out.

use super::Tool;
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

#[derive(Debug, Default)]
pub struct Git;

impl Tool for Git {
    fn name(&self) -> &'static str {
        "git"
    }

    fn description(&self) -> &'static str {
        "git: sanitized gitconfig, credential helpers stripped"
    }

    fn available(&self, _home: &Path) -> bool {
        which::which("git").is_ok()
    }

    fn prepare(&self, home: &Path, sandbox_home: &Path) -> Result<()> {
        let src = home.join(".gitconfig");
        if !src.exists() {
            return Ok(());
        }
        let raw = fs::read_to_string(&src)
            .with_context(|| format!("read {}", src.display()))?;
        let sanitized = sanitize_gitconfig(&raw);
        let dst = sandbox_home.join(".gitconfig");
        fs::write(&dst, sanitized).with_context(|| format!("write {}", dst.display()))?;
        Ok(())
    }
}

/// Drop `[credential...]` sections and `http.*.extraheader` keys; keep
/// everything else verbatim.
fn sanitize_gitconfig(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut in_credential_section = false;
    for line in raw.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with('[') {
            in_credential_section = trimmed
                .trim_start_matches('[')
                .trim()
                .to_ascii_lowercase()
                .starts_with("credential");
            if in_credential_section {
                continue;
            }
        } else if in_credential_section {
            continue;
        }
        if trimmed.to_ascii_lowercase().starts_with("extraheader") {
            continue;
        }
        out.push_str(line);
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_strips_credential_sections() {
        let raw = "[user]\n\tname = Dev\n[credential]\n\thelper = store\n[credential \"https://example.com\"]\n\thelper = cache\n[alias]\n\tco = checkout\n";
        let clean = sanitize_gitconfig(raw);
        assert!(clean.contains("name = Dev"));
        assert!(clean.contains("co = checkout"));
        assert!(!clean.contains("helper"));
        assert!(!clean.to_lowercase().contains("credential"));
    }

    #[test]
    fn test_sanitize_strips_extraheader() {
        let raw = "[http \"https://example.com\"]\n\textraheader = AUTHORIZATION: basic xxx\n\tsslVerify = true\n";
        let clean = sanitize_gitconfig(raw);
        assert!(!clean.to_lowercase().contains("extraheader"));
        assert!(clean.contains("sslVerify"));
    }
}
