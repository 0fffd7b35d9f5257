//! Merge algebra for layered configuration.
//!
//! Applied in order global ← includes ← local. Invariants:
//! - option scalars: overlay wins iff it is set (explicit `false` beats
//!   `true` in the base; absent leaves the base alone),
//! - maps: deep merge, overlay keys win, nested tables recurse,
//! - rule arrays: overlay-first concatenation (overlay evaluated first,
//!   base retained as fallback),
//! - logging receivers: append base-then-overlay,
//! - redaction: `enabled` is the OR of the layers and `default_action` is
//!   the most restrictive of the two (`log < redact < block`).

use super::schema::{
    Config, CredentialInjector, LoggingSection, ProxySection, RedactionSection,
    SandboxSection, ToolSection,
};
use std::collections::BTreeMap;

/// Merge `overlay` on top of `base`.
pub fn merge(base: Config, overlay: Config) -> Config {
    Config {
        proxy: merge_proxy(base.proxy, overlay.proxy),
        sandbox: merge_sandbox(base.sandbox, overlay.sandbox),
        overlay: super::schema::OverlaySection {
            enabled: over(base.overlay.enabled, overlay.overlay.enabled),
        },
        tools: merge_tools(base.tools, overlay.tools),
        logging: merge_logging(base.logging, overlay.logging),
        port_forwarding: super::schema::PortForwardingSection {
            enabled: over(
                base.port_forwarding.enabled,
                overlay.port_forwarding.enabled,
            ),
            rules: prepend(overlay.port_forwarding.rules, base.port_forwarding.rules),
        },
        // Includes are evaluated before merging; an overlay's include list
        // never takes effect here (compose warns about it).
        include: base.include,
    }
}

fn over<T>(base: Option<T>, overlay: Option<T>) -> Option<T> {
    overlay.or(base)
}

fn prepend<T>(mut first: Vec<T>, rest: Vec<T>) -> Vec<T> {
    first.extend(rest);
    first
}

fn merge_proxy(base: ProxySection, overlay: ProxySection) -> ProxySection {
    ProxySection {
        enabled: over(base.enabled, overlay.enabled),
        port: over(base.port, overlay.port),
        ask_timeout_secs: over(base.ask_timeout_secs, overlay.ask_timeout_secs),
        log_requests: over(base.log_requests, overlay.log_requests),
        log_bodies: over(base.log_bodies, overlay.log_bodies),
        filter: super::schema::FilterSection {
            default_action: over(
                base.filter.default_action,
                overlay.filter.default_action,
            ),
            rules: prepend(overlay.filter.rules, base.filter.rules),
        },
        redaction: merge_redaction(base.redaction, overlay.redaction),
        credentials: merge_credentials(base.credentials, overlay.credentials),
    }
}

fn merge_redaction(base: RedactionSection, overlay: RedactionSection) -> RedactionSection {
    // An overlay cannot disable redaction once the base enabled it.
    let enabled = match (base.enabled, overlay.enabled) {
        (None, None) => None,
        (b, o) => Some(b.unwrap_or(false) || o.unwrap_or(false)),
    };
    let default_action = match (base.default_action, overlay.default_action) {
        (Some(b), Some(o)) => Some(b.max(o)),
        (b, o) => o.or(b),
    };
    RedactionSection {
        enabled,
        default_action,
        rules: prepend(overlay.rules, base.rules),
    }
}

fn merge_credentials(
    base: BTreeMap<String, CredentialInjector>,
    overlay: BTreeMap<String, CredentialInjector>,
) -> BTreeMap<String, CredentialInjector> {
    let mut out = base;
    for (name, inj) in overlay {
        match out.remove(&name) {
            Some(existing) => {
                out.insert(name, merge_injector(existing, inj));
            }
            None => {
                out.insert(name, inj);
            }
        }
    }
    out
}

fn merge_injector(base: CredentialInjector, overlay: CredentialInjector) -> CredentialInjector {
    CredentialInjector {
        enabled: over(base.enabled, overlay.enabled),
        hosts: if overlay.hosts.is_empty() {
            base.hosts
        } else {
            overlay.hosts
        },
        header: if overlay.header.is_empty() {
            base.header
        } else {
            overlay.header
        },
        value_env: over(base.value_env, overlay.value_env),
        value_file: over(base.value_file, overlay.value_file),
        prefix: over(base.prefix, overlay.prefix),
    }
}

fn merge_sandbox(base: SandboxSection, overlay: SandboxSection) -> SandboxSection {
    SandboxSection {
        shell: over(base.shell, overlay.shell),
        isolation: over(base.isolation, overlay.isolation),
        env_file_suppression: over(base.env_file_suppression, overlay.env_file_suppression),
        extra_env: merge_string_map(base.extra_env, overlay.extra_env),
        mounts: super::schema::MountsSection {
            rules: prepend(overlay.mounts.rules, base.mounts.rules),
        },
        docker: super::schema::DockerSection {
            image: over(base.docker.image, overlay.docker.image),
            dockerfile: over(base.docker.dockerfile, overlay.docker.dockerfile),
            extra_args: if overlay.docker.extra_args.is_empty() {
                base.docker.extra_args
            } else {
                overlay.docker.extra_args
            },
        },
    }
}

fn merge_string_map(
    base: BTreeMap<String, String>,
    overlay: BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut out = base;
    out.extend(overlay);
    out
}

fn merge_tools(
    base: BTreeMap<String, ToolSection>,
    overlay: BTreeMap<String, ToolSection>,
) -> BTreeMap<String, ToolSection> {
    let mut out = base;
    for (name, section) in overlay {
        match out.remove(&name) {
            Some(existing) => {
                out.insert(
                    name,
                    ToolSection {
                        enabled: over(existing.enabled, section.enabled),
                        options: merge_toml_tables(existing.options, section.options),
                    },
                );
            }
            None => {
                out.insert(name, section);
            }
        }
    }
    out
}

/// Deep merge of open TOML tables: overlay keys win, nested tables recurse.
fn merge_toml_tables(
    base: BTreeMap<String, toml::Value>,
    overlay: BTreeMap<String, toml::Value>,
) -> BTreeMap<String, toml::Value> {
    let mut out = base;
    for (key, value) in overlay {
        match (out.remove(&key), value) {
            (Some(toml::Value::Table(b)), toml::Value::Table(o)) => {
                let merged = merge_toml_tables(
                    b.into_iter().collect(),
                    o.into_iter().collect(),
                );
                out.insert(key, toml::Value::Table(merged.into_iter().collect()));
            }
            (_, v) => {
                out.insert(key, v);
            }
        }
    }
    out
}

fn merge_logging(base: LoggingSection, overlay: LoggingSection) -> LoggingSection {
    LoggingSection {
        level: over(base.level, overlay.level),
        file_enabled: over(base.file_enabled, overlay.file_enabled),
        receivers: prepend(base.receivers, overlay.receivers),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{FilterAction, RedactAction};

    fn parse(s: &str) -> Config {
        toml::from_str(s).expect("parse config")
    }

    #[test]
    fn test_overlay_scalar_wins_only_when_set() {
        let base = parse("[proxy]\nenabled = true\nport = 8080");
        let overlay = parse("[proxy]\nport = 7070");
        let merged = merge(base, overlay);
        assert_eq!(merged.proxy.enabled, Some(true), "unset overlay keeps base");
        assert_eq!(merged.proxy.port, Some(7070));
    }

    #[test]
    fn test_explicit_false_defeats_base_true() {
        let base = parse("[proxy]\nenabled = true\nport = 8080");
        let overlay = parse("[proxy]\nenabled = false");
        let merged = merge(base, overlay);
        assert_eq!(merged.proxy.enabled, Some(false));
        assert_eq!(merged.proxy.port, Some(8080), "port remains from base");
    }

    #[test]
    fn test_filter_rules_overlay_first() {
        let base = parse(
            r#"
            [[proxy.filter.rules]]
            pattern = "base.example"
            action = "block"
            "#,
        );
        let overlay = parse(
            r#"
            [[proxy.filter.rules]]
            pattern = "*.internal"
            action = "allow"
            "#,
        );
        let merged = merge(base, overlay);
        assert_eq!(merged.proxy.filter.rules.len(), 2);
        assert_eq!(merged.proxy.filter.rules[0].pattern, "*.internal");
        assert_eq!(merged.proxy.filter.rules[0].action, FilterAction::Allow);
        assert_eq!(merged.proxy.filter.rules[1].pattern, "base.example");
    }

    #[test]
    fn test_redaction_enabled_is_or() {
        let base = parse("[proxy.redaction]\nenabled = true");
        let overlay = parse("[proxy.redaction]\nenabled = false");
        let merged = merge(base, overlay);
        assert_eq!(
            merged.proxy.redaction.enabled,
            Some(true),
            "overlay cannot disable redaction the base enabled"
        );
    }

    #[test]
    fn test_redaction_default_action_most_restrictive() {
        let base = parse("[proxy.redaction]\ndefault_action = \"log\"");
        let overlay = parse("[proxy.redaction]\ndefault_action = \"redact\"");
        let merged = merge(base, overlay);
        assert_eq!(
            merged.proxy.redaction.default_action,
            Some(RedactAction::Redact)
        );

        let base = parse("[proxy.redaction]\ndefault_action = \"block\"");
        let overlay = parse("[proxy.redaction]\ndefault_action = \"log\"");
        let merged = merge(base, overlay);
        assert_eq!(
            merged.proxy.redaction.default_action,
            Some(RedactAction::Block),
            "an overlay cannot relax the base action"
        );
    }

    #[test]
    fn test_logging_receivers_append_base_then_overlay() {
        let base = parse("[[logging.receivers]]\nkind = \"stderr\"");
        let overlay = parse("[[logging.receivers]]\nkind = \"file\"\npath = \"/tmp/l\"");
        let merged = merge(base, overlay);
        assert_eq!(merged.logging.receivers.len(), 2);
        assert_eq!(
            merged.logging.receivers[0].kind,
            crate::config::schema::ReceiverKind::Stderr
        );
    }

    #[test]
    fn test_tool_options_deep_merge() {
        let base = parse(
            r#"
            [tools.mise]
            enabled = true
            [tools.mise.settings]
            a = 1
            b = 1
            "#,
        );
        let overlay = parse(
            r#"
            [tools.mise.settings]
            b = 2
            "#,
        );
        let merged = merge(base, overlay);
        let mise = merged.tools.get("mise").expect("tool kept");
        assert_eq!(mise.enabled, Some(true));
        let settings = mise
            .options
            .get("settings")
            .and_then(|v| v.as_table())
            .expect("settings table");
        assert_eq!(settings.get("a").and_then(|v| v.as_integer()), Some(1));
        assert_eq!(settings.get("b").and_then(|v| v.as_integer()), Some(2));
    }

    #[test]
    fn test_extra_env_overlay_key_wins() {
        let base = parse("[sandbox.extra_env]\nA = \"1\"\nB = \"1\"");
        let overlay = parse("[sandbox.extra_env]\nB = \"2\"");
        let merged = merge(base, overlay);
        assert_eq!(merged.sandbox.extra_env.get("A").map(String::as_str), Some("1"));
        assert_eq!(merged.sandbox.extra_env.get("B").map(String::as_str), Some("2"));
    }
}
