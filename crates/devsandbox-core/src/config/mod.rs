//! Configuration composition: global config, conditional includes, and the
//! hash-pinned local `.devsandbox.toml`, merged in that order.

pub mod merge;
pub mod schema;
pub mod trust;

pub use schema::Config;

use crate::pathglob;
use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use self::trust::{TrustPrompt, TrustStore};

/// File name of the per-project local config layer.
pub const LOCAL_CONFIG_FILE: &str = ".devsandbox.toml";

/// File name of the global config under the config root.
pub const GLOBAL_CONFIG_FILE: &str = "config.toml";

/// Inputs for a composition run.
pub struct ComposeOptions<'a> {
    /// Absolute project directory the sandbox is keyed by.
    pub project_dir: &'a Path,
    /// Path of the global config file (may not exist).
    pub global_path: &'a Path,
    /// Trust store consulted for the local layer; `None` skips local
    /// configs entirely.
    pub trust: Option<&'a mut TrustStore>,
    pub prompt: &'a dyn TrustPrompt,
}

/// Default global config path.
pub fn global_config_path() -> PathBuf {
    crate::paths::config_root().join(GLOBAL_CONFIG_FILE)
}

/// Load, validate, and merge all configuration layers for a project.
pub fn compose(opts: ComposeOptions<'_>) -> Result<Config> {
    let global = if opts.global_path.exists() {
        load_layer(opts.global_path)?
    } else {
        Config::default()
    };

    let include_base = opts
        .global_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    let mut merged = global.clone();
    for entry in &global.include {
        if let Some(cond) = &entry.condition {
            // Validated shape: dir:<glob>
            let pattern = cond.trim_start_matches("dir:");
            if !pathglob::matches_dir_pattern(pattern, opts.project_dir)? {
                continue;
            }
        }
        let path = resolve_include_path(&entry.path, &include_base);
        if !path.exists() {
            tracing::warn!("include file {} not found, skipping", path.display());
            continue;
        }
        let mut layer = load_layer(&path)?;
        if !layer.include.is_empty() {
            tracing::warn!(
                "nested include in {} is not supported and was ignored",
                path.display()
            );
            layer.include.clear();
        }
        merged = merge::merge(merged, layer);
    }

    if let Some(store) = opts.trust {
        if let Some(local) = load_local_layer(opts.project_dir, store, opts.prompt)? {
            merged = merge::merge(merged, local);
        }
    }

    Ok(merged)
}

/// Parse and validate a single layer file.
fn load_layer(path: &Path) -> Result<Config> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read config {}", path.display()))?;
    parse_layer(&raw).with_context(|| format!("in config {}", path.display()))
}

fn parse_layer(raw: &str) -> Result<Config> {
    let cfg: Config = toml::from_str(raw).context("parse TOML")?;
    cfg.validate()?;
    Ok(cfg)
}

fn resolve_include_path(raw: &str, base: &Path) -> PathBuf {
    let expanded = pathglob::expand_tilde(raw);
    if expanded.is_absolute() {
        expanded
    } else {
        base.join(expanded)
    }
}

/// The local `.devsandbox.toml`, applied only under a matching trust hash.
///
/// Untrusted or changed files go through the prompt; approval persists the
/// new hash (a save failure downgrades to session-only trust with a
/// warning). Declining skips the layer with a stderr notice.
fn load_local_layer(
    project_dir: &Path,
    store: &mut TrustStore,
    prompt: &dyn TrustPrompt,
) -> Result<Option<Config>> {
    let path = project_dir.join(LOCAL_CONFIG_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let bytes = fs::read(&path)
        .with_context(|| format!("read local config {}", path.display()))?;
    let hash = sha256_hex(&bytes);

    let (trusted, changed) = match store.get_trusted(project_dir) {
        Some(entry) if entry.sha256 == hash => (true, false),
        Some(_) => (false, true),
        None => (false, false),
    };

    if !trusted {
        let raw = String::from_utf8_lossy(&bytes);
        if !prompt.confirm(project_dir, &raw, changed) {
            eprintln!(
                "Skipping local config {} (not trusted)",
                path.display()
            );
            return Ok(None);
        }
        store.add_trust(project_dir, &hash);
        if let Err(err) = store.save() {
            tracing::warn!(
                "could not persist trust for {}: {err:#}; trusting for this session only",
                project_dir.display()
            );
        }
    }

    let raw = String::from_utf8_lossy(&bytes);
    let mut layer =
        parse_layer(&raw).with_context(|| format!("in local config {}", path.display()))?;
    if !layer.include.is_empty() {
        tracing::warn!(
            "include entries in {} are not supported and were ignored",
            path.display()
        );
        layer.include.clear();
    }
    Ok(Some(layer))
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::trust::DenyAllPrompt;

    struct ApproveAllPrompt;
    impl TrustPrompt for ApproveAllPrompt {
        fn confirm(&self, _dir: &Path, _raw: &str, _changed: bool) -> bool {
            true
        }
    }

    fn write(path: &Path, content: &str) {
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(path, content).expect("write");
    }

    #[test]
    fn test_untrusted_local_config_is_ignored() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let project = tmp.path().join("p");
        write(&project.join(LOCAL_CONFIG_FILE), "[proxy]\nenabled = true");
        let mut store =
            TrustStore::load(&tmp.path().join("trust.toml")).expect("trust store");

        let cfg = compose(ComposeOptions {
            project_dir: &project,
            global_path: &tmp.path().join("config.toml"),
            trust: Some(&mut store),
            prompt: &DenyAllPrompt,
        })
        .expect("compose");
        assert!(!cfg.proxy_enabled(), "denied local config must not apply");
    }

    #[test]
    fn test_trusted_local_overrides_global() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let project = tmp.path().join("p");
        let global = tmp.path().join("config.toml");
        write(&global, "[proxy]\nport = 8080");
        write(
            &project.join(LOCAL_CONFIG_FILE),
            r#"
            [proxy]
            port = 7070
            [[proxy.filter.rules]]
            pattern = "*.internal"
            action = "allow"
            "#,
        );
        let mut store =
            TrustStore::load(&tmp.path().join("trust.toml")).expect("trust store");

        let cfg = compose(ComposeOptions {
            project_dir: &project,
            global_path: &global,
            trust: Some(&mut store),
            prompt: &ApproveAllPrompt,
        })
        .expect("compose");
        assert_eq!(cfg.proxy_port(), 7070);
        assert_eq!(cfg.proxy.filter.rules.len(), 1);
        assert!(
            store.get_trusted(&project).is_some(),
            "approval persists the hash"
        );
    }

    #[test]
    fn test_local_applies_iff_hash_matches() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let project = tmp.path().join("p");
        let local = project.join(LOCAL_CONFIG_FILE);
        write(&local, "[proxy]\nenabled = true");

        let mut store =
            TrustStore::load(&tmp.path().join("trust.toml")).expect("trust store");
        let bytes = fs::read(&local).expect("read");
        store.add_trust(&project, &sha256_hex(&bytes));

        let cfg = compose(ComposeOptions {
            project_dir: &project,
            global_path: &tmp.path().join("config.toml"),
            trust: Some(&mut store),
            prompt: &DenyAllPrompt,
        })
        .expect("compose");
        assert!(cfg.proxy_enabled(), "matching hash applies without prompt");

        // Changed bytes under the same trust entry fall back to the prompt.
        write(&local, "[proxy]\nenabled = true\nport = 9999");
        let cfg = compose(ComposeOptions {
            project_dir: &project,
            global_path: &tmp.path().join("config.toml"),
            trust: Some(&mut store),
            prompt: &DenyAllPrompt,
        })
        .expect("compose");
        assert!(!cfg.proxy_enabled(), "changed file is not applied on deny");
    }

    #[test]
    fn test_explicit_false_in_local_defeats_global_true() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let project = tmp.path().join("p");
        let global = tmp.path().join("config.toml");
        write(&global, "[proxy]\nenabled = true\nport = 8080");
        write(&project.join(LOCAL_CONFIG_FILE), "[proxy]\nenabled = false");
        let mut store =
            TrustStore::load(&tmp.path().join("trust.toml")).expect("trust store");

        let cfg = compose(ComposeOptions {
            project_dir: &project,
            global_path: &global,
            trust: Some(&mut store),
            prompt: &ApproveAllPrompt,
        })
        .expect("compose");
        assert!(!cfg.proxy_enabled());
        assert_eq!(cfg.proxy_port(), 8080);
    }

    #[test]
    fn test_conditional_include() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let project = tmp.path().join("work").join("app");
        fs::create_dir_all(&project).expect("mkdir");
        let global = tmp.path().join("config.toml");
        let inc = tmp.path().join("work.toml");
        write(&inc, "[proxy]\nport = 9090");
        write(
            &global,
            &format!(
                "[[include]]\npath = {:?}\ncondition = \"dir:{}/work/**\"\n\n[[include]]\npath = \"missing.toml\"\n",
                inc, tmp.path().display()
            ),
        );

        let cfg = compose(ComposeOptions {
            project_dir: &project,
            global_path: &global,
            trust: None,
            prompt: &DenyAllPrompt,
        })
        .expect("compose");
        assert_eq!(cfg.proxy_port(), 9090, "matching include applies");

        let elsewhere = tmp.path().join("other").join("app");
        fs::create_dir_all(&elsewhere).expect("mkdir");
        let cfg = compose(ComposeOptions {
            project_dir: &elsewhere,
            global_path: &global,
            trust: None,
            prompt: &DenyAllPrompt,
        })
        .expect("compose");
        assert_eq!(
            cfg.proxy_port(),
            schema::DEFAULT_PROXY_PORT,
            "non-matching include does not apply"
        );
    }

    #[test]
    fn test_nested_include_dropped() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let global = tmp.path().join("config.toml");
        let inc = tmp.path().join("inc.toml");
        write(
            &inc,
            "[proxy]\nport = 9090\n[[include]]\npath = \"deeper.toml\"\n",
        );
        write(&global, &format!("[[include]]\npath = {inc:?}\n"));

        let cfg = compose(ComposeOptions {
            project_dir: tmp.path(),
            global_path: &global,
            trust: None,
            prompt: &DenyAllPrompt,
        })
        .expect("compose");
        assert_eq!(cfg.proxy_port(), 9090);
        assert!(cfg.include.iter().all(|i| !i.path.contains("deeper")));
    }

    #[test]
    fn test_invalid_layer_aborts_load() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let global = tmp.path().join("config.toml");
        write(&global, "[proxy]\nport = 0");
        let err = compose(ComposeOptions {
            project_dir: tmp.path(),
            global_path: &global,
            trust: None,
            prompt: &DenyAllPrompt,
        })
        .expect_err("invalid port");
        assert!(format!("{err:#}").contains("proxy.port"), "{err:#}");
    }
}
