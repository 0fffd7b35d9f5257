//! Configuration schema shared by every layer (global, includes, local).
//!
//! Scalars that take part in merging are `Option`-typed so "unset" and
//! "explicitly false/zero" stay distinguishable; resolved defaults live in
//! the accessor methods at the bottom.

use crate::pathglob;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const DEFAULT_PROXY_PORT: u16 = 18080;
pub const DEFAULT_ASK_TIMEOUT_SECS: u64 = 30;
pub const MAX_ASK_TIMEOUT_SECS: u64 = 600;

/// Validation failure, carrying the offending TOML field path.
#[derive(Debug, thiserror::Error)]
#[error("config field `{field}`: {reason}")]
pub struct InvalidField {
    pub field: String,
    pub reason: String,
}

fn invalid(field: impl Into<String>, reason: impl Into<String>) -> InvalidField {
    InvalidField {
        field: field.into(),
        reason: reason.into(),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub proxy: ProxySection,
    pub sandbox: SandboxSection,
    pub overlay: OverlaySection,
    pub tools: BTreeMap<String, ToolSection>,
    pub logging: LoggingSection,
    pub port_forwarding: PortForwardingSection,
    pub include: Vec<IncludeEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProxySection {
    pub enabled: Option<bool>,
    pub port: Option<u16>,
    pub ask_timeout_secs: Option<u64>,
    pub log_requests: Option<bool>,
    pub log_bodies: Option<bool>,
    pub filter: FilterSection,
    pub redaction: RedactionSection,
    pub credentials: BTreeMap<String, CredentialInjector>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FilterSection {
    /// Fallthrough action when no rule matches. Absent together with an
    /// empty rule list means filtering is disabled.
    pub default_action: Option<FilterAction>,
    pub rules: Vec<FilterRule>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterAction {
    Allow,
    Block,
    Ask,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleScope {
    #[default]
    Host,
    Path,
    Url,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    Exact,
    #[default]
    Glob,
    Regex,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FilterRule {
    pub pattern: String,
    pub action: FilterAction,
    pub scope: RuleScope,
    pub match_type: MatchType,
    pub reason: Option<String>,
}

impl Default for FilterRule {
    fn default() -> Self {
        Self {
            pattern: String::new(),
            action: FilterAction::Block,
            scope: RuleScope::default(),
            match_type: MatchType::default(),
            reason: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RedactionSection {
    pub enabled: Option<bool>,
    pub default_action: Option<RedactAction>,
    pub rules: Vec<RedactionRule>,
}

/// Ordered by restrictiveness: merging two layers keeps the maximum.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum RedactAction {
    Log,
    Redact,
    Block,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RedactionRule {
    pub name: String,
    /// Source variants: exactly one of these four may be set...
    pub value: Option<String>,
    pub env: Option<String>,
    pub file: Option<String>,
    pub env_file_key: Option<EnvFileKey>,
    /// ...or a regex pattern instead of any source.
    pub pattern: Option<String>,
    pub action: Option<RedactAction>,
}

/// A `KEY=value` lookup inside a dotenv-style file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnvFileKey {
    pub file: String,
    pub key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CredentialInjector {
    pub enabled: Option<bool>,
    /// Destination hosts this injector applies to (exact or `*.suffix`).
    pub hosts: Vec<String>,
    pub header: String,
    pub value_env: Option<String>,
    pub value_file: Option<String>,
    /// Prepended to the resolved secret, e.g. `"Bearer "`.
    pub prefix: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SandboxSection {
    pub shell: Option<ShellKind>,
    pub isolation: Option<IsolationKind>,
    pub env_file_suppression: Option<bool>,
    pub extra_env: BTreeMap<String, String>,
    pub mounts: MountsSection,
    pub docker: DockerSection,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShellKind {
    #[default]
    Bash,
    Zsh,
    Fish,
}

impl ShellKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShellKind::Bash => "bash",
            ShellKind::Zsh => "zsh",
            ShellKind::Fish => "fish",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IsolationKind {
    #[default]
    Namespace,
    Container,
}

impl IsolationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IsolationKind::Namespace => "namespace",
            IsolationKind::Container => "container",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MountsSection {
    pub rules: Vec<MountRule>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MountRule {
    pub pattern: String,
    pub mode: MountRuleMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MountRuleMode {
    Hidden,
    ReadOnly,
    ReadWrite,
    Overlay,
    TmpOverlay,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DockerSection {
    pub image: Option<String>,
    pub dockerfile: Option<String>,
    pub extra_args: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OverlaySection {
    /// When false, `overlay` mount rules degrade to tmp overlays (nothing
    /// persisted between runs).
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingSection {
    pub level: Option<String>,
    pub file_enabled: Option<bool>,
    pub receivers: Vec<LogReceiver>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogReceiver {
    pub kind: ReceiverKind,
    pub path: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReceiverKind {
    File,
    Stderr,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PortForwardingSection {
    pub enabled: Option<bool>,
    pub rules: Vec<PortForwardRule>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PortForwardRule {
    pub direction: ForwardDirection,
    #[serde(default)]
    pub protocol: ForwardProtocol,
    pub host_port: u16,
    pub sandbox_port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwardDirection {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwardProtocol {
    #[default]
    Tcp,
    Udp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IncludeEntry {
    pub path: String,
    /// `dir:<glob>`: the include applies when the project directory
    /// matches the glob. Absent means unconditional.
    pub condition: Option<String>,
}

/// Open-keyed per-tool table: `enabled` plus whatever the descriptor's
/// `configure` understands.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolSection {
    pub enabled: Option<bool>,
    #[serde(flatten)]
    pub options: BTreeMap<String, toml::Value>,
}

// ============================================================
// Validation
// ============================================================

impl Config {
    /// Validate one layer. The first violation aborts the load; the error
    /// names the field path.
    pub fn validate(&self) -> Result<(), InvalidField> {
        if let Some(port) = self.proxy.port {
            if port == 0 {
                return Err(invalid("proxy.port", "port must be in 1..=65535"));
            }
        }
        if let Some(t) = self.proxy.ask_timeout_secs {
            if t > MAX_ASK_TIMEOUT_SECS {
                return Err(invalid(
                    "proxy.ask_timeout_secs",
                    format!("must be in 0..={MAX_ASK_TIMEOUT_SECS}"),
                ));
            }
        }

        for (i, rule) in self.proxy.filter.rules.iter().enumerate() {
            let field = format!("proxy.filter.rules[{i}]");
            if rule.pattern.is_empty() {
                return Err(invalid(format!("{field}.pattern"), "pattern is empty"));
            }
            if rule.match_type == MatchType::Regex {
                regex::Regex::new(&rule.pattern).map_err(|e| {
                    invalid(format!("{field}.pattern"), format!("invalid regex: {e}"))
                })?;
            }
        }

        for (i, rule) in self.proxy.redaction.rules.iter().enumerate() {
            let field = format!("proxy.redaction.rules[{i}]");
            let sources = [
                rule.value.is_some(),
                rule.env.is_some(),
                rule.file.is_some(),
                rule.env_file_key.is_some(),
            ]
            .iter()
            .filter(|b| **b)
            .count();
            match (sources, rule.pattern.is_some()) {
                (0, false) => {
                    return Err(invalid(field, "rule needs a source or a pattern"))
                }
                (0, true) => {
                    let pattern = rule.pattern.as_deref().unwrap_or_default();
                    regex::Regex::new(pattern).map_err(|e| {
                        invalid(format!("{field}.pattern"), format!("invalid regex: {e}"))
                    })?;
                }
                (1, false) => {}
                _ => {
                    return Err(invalid(
                        field,
                        "source and pattern are mutually exclusive; set exactly one",
                    ))
                }
            }
            if let Some(ref file) = rule.file {
                validate_path_field(&format!("{field}.file"), file)?;
            }
            if let Some(ref efk) = rule.env_file_key {
                validate_path_field(&format!("{field}.env_file_key.file"), &efk.file)?;
            }
        }

        for (name, inj) in &self.proxy.credentials {
            let field = format!("proxy.credentials.{name}");
            if inj.header.is_empty() {
                return Err(invalid(format!("{field}.header"), "header is empty"));
            }
            if let Some(ref file) = inj.value_file {
                validate_path_field(&format!("{field}.value_file"), file)?;
            }
        }

        for (i, rule) in self.sandbox.mounts.rules.iter().enumerate() {
            let field = format!("sandbox.mounts.rules[{i}].pattern");
            if !(rule.pattern.starts_with('/') || rule.pattern.starts_with('~')) {
                return Err(invalid(field, "pattern must be absolute or start with ~"));
            }
            if pathglob::has_dotdot_segment(&rule.pattern) {
                return Err(invalid(field, "pattern contains a literal '..' segment"));
            }
        }

        let mut seen_inbound = std::collections::BTreeSet::new();
        let mut seen_outbound = std::collections::BTreeSet::new();
        for (i, rule) in self.port_forwarding.rules.iter().enumerate() {
            let field = format!("port_forwarding.rules[{i}]");
            if rule.host_port == 0 || rule.sandbox_port == 0 {
                return Err(invalid(field, "ports must be in 1..=65535"));
            }
            let dup = match rule.direction {
                ForwardDirection::Inbound => {
                    !seen_inbound.insert((rule.protocol, rule.host_port))
                }
                ForwardDirection::Outbound => {
                    !seen_outbound.insert((rule.protocol, rule.sandbox_port))
                }
            };
            if dup {
                return Err(invalid(field, "duplicate port-forward rule"));
            }
        }

        for (i, inc) in self.include.iter().enumerate() {
            let field = format!("include[{i}]");
            if inc.path.is_empty() {
                return Err(invalid(format!("{field}.path"), "path is empty"));
            }
            if pathglob::has_dotdot_segment(&inc.path) {
                return Err(invalid(
                    format!("{field}.path"),
                    "path contains a literal '..' segment",
                ));
            }
            if let Some(ref cond) = inc.condition {
                if !cond.starts_with("dir:") {
                    return Err(invalid(
                        format!("{field}.condition"),
                        "condition must be of the form dir:<glob>",
                    ));
                }
            }
        }

        Ok(())
    }
}

fn validate_path_field(field: &str, raw: &str) -> Result<(), InvalidField> {
    if !(raw.starts_with('/') || raw.starts_with('~')) {
        return Err(invalid(field, "path must be absolute or start with ~"));
    }
    if pathglob::has_dotdot_segment(raw) {
        return Err(invalid(field, "path contains a literal '..' segment"));
    }
    Ok(())
}

// ============================================================
// Resolved accessors
// ============================================================

impl Config {
    pub fn proxy_enabled(&self) -> bool {
        self.proxy.enabled.unwrap_or(false)
    }

    pub fn proxy_port(&self) -> u16 {
        self.proxy.port.unwrap_or(DEFAULT_PROXY_PORT)
    }

    pub fn ask_timeout_secs(&self) -> u64 {
        self.proxy
            .ask_timeout_secs
            .unwrap_or(DEFAULT_ASK_TIMEOUT_SECS)
    }

    pub fn log_requests(&self) -> bool {
        self.proxy.log_requests.unwrap_or(true)
    }

    pub fn log_bodies(&self) -> bool {
        self.proxy.log_bodies.unwrap_or(false)
    }

    pub fn shell(&self) -> ShellKind {
        self.sandbox.shell.unwrap_or_default()
    }

    pub fn isolation(&self) -> IsolationKind {
        self.sandbox.isolation.unwrap_or_default()
    }

    pub fn env_file_suppression(&self) -> bool {
        self.sandbox.env_file_suppression.unwrap_or(true)
    }

    pub fn overlay_enabled(&self) -> bool {
        self.overlay.enabled.unwrap_or(true)
    }

    pub fn redaction_enabled(&self) -> bool {
        self.proxy.redaction.enabled.unwrap_or(false)
    }

    pub fn redaction_default_action(&self) -> RedactAction {
        self.proxy
            .redaction
            .default_action
            .unwrap_or(RedactAction::Redact)
    }

    /// Whether a tool is enabled (tools default to enabled when available).
    pub fn tool_enabled(&self, name: &str) -> bool {
        self.tools
            .get(name)
            .and_then(|t| t.enabled)
            .unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> Config {
        toml::from_str(s).expect("parse config")
    }

    #[test]
    fn test_empty_config_is_valid() {
        let cfg = parse("");
        cfg.validate().expect("valid");
        assert!(!cfg.proxy_enabled());
        assert_eq!(cfg.proxy_port(), DEFAULT_PROXY_PORT);
        assert_eq!(cfg.ask_timeout_secs(), DEFAULT_ASK_TIMEOUT_SECS);
    }

    #[test]
    fn test_port_bounds() {
        let cfg = parse("[proxy]\nport = 1");
        cfg.validate().expect("port 1 is valid");
        let cfg = parse("[proxy]\nport = 65535");
        cfg.validate().expect("port 65535 is valid");
        let cfg = parse("[proxy]\nport = 0");
        assert!(cfg.validate().is_err(), "port 0 must fail");
        // 65536 does not fit u16 and dies in the parser already
        assert!(toml::from_str::<Config>("[proxy]\nport = 65536").is_err());
    }

    #[test]
    fn test_ask_timeout_bounds() {
        parse("[proxy]\nask_timeout_secs = 0").validate().expect("0 ok");
        parse("[proxy]\nask_timeout_secs = 600").validate().expect("600 ok");
        assert!(parse("[proxy]\nask_timeout_secs = 601").validate().is_err());
    }

    #[test]
    fn test_unknown_keys_rejected() {
        assert!(toml::from_str::<Config>("[proxy]\nbogus = 1").is_err());
    }

    #[test]
    fn test_filter_rule_regex_must_compile() {
        let cfg = parse(
            r#"
            [[proxy.filter.rules]]
            pattern = "("
            action = "block"
            match_type = "regex"
            "#,
        );
        let err = cfg.validate().expect_err("bad regex");
        assert!(err.field.contains("proxy.filter.rules[0]"), "{err}");
    }

    #[test]
    fn test_redaction_rule_exclusivity() {
        let both = parse(
            r#"
            [[proxy.redaction.rules]]
            name = "x"
            value = "secret"
            pattern = "sk-.*"
            "#,
        );
        assert!(both.validate().is_err());

        let neither = parse(
            r#"
            [[proxy.redaction.rules]]
            name = "x"
            "#,
        );
        assert!(neither.validate().is_err());

        let source = parse(
            r#"
            [[proxy.redaction.rules]]
            name = "x"
            env = "MY_TOKEN"
            "#,
        );
        source.validate().expect("single source is valid");
    }

    #[test]
    fn test_mount_rule_requires_absolute_without_dotdot() {
        let rel = parse(
            r#"
            [[sandbox.mounts.rules]]
            pattern = "relative/path"
            mode = "read_only"
            "#,
        );
        assert!(rel.validate().is_err());

        let dotdot = parse(
            r#"
            [[sandbox.mounts.rules]]
            pattern = "/a/../b"
            mode = "read_only"
            "#,
        );
        let err = dotdot.validate().expect_err("dotdot must fail");
        assert!(err.reason.contains("'..'"), "{err}");

        let tilde = parse(
            r#"
            [[sandbox.mounts.rules]]
            pattern = "~/.aws"
            mode = "hidden"
            "#,
        );
        tilde.validate().expect("tilde pattern is valid");
    }

    #[test]
    fn test_port_forward_duplicates() {
        let cfg = parse(
            r#"
            [[port_forwarding.rules]]
            direction = "inbound"
            host_port = 3000
            sandbox_port = 3000

            [[port_forwarding.rules]]
            direction = "inbound"
            host_port = 3000
            sandbox_port = 4000
            "#,
        );
        assert!(cfg.validate().is_err(), "same (inbound, tcp, host_port)");

        let ok = parse(
            r#"
            [[port_forwarding.rules]]
            direction = "inbound"
            host_port = 3000
            sandbox_port = 3000

            [[port_forwarding.rules]]
            direction = "outbound"
            host_port = 3000
            sandbox_port = 5432
            "#,
        );
        ok.validate().expect("different directions do not collide");
    }

    #[test]
    fn test_redact_action_lattice_order() {
        assert!(RedactAction::Log < RedactAction::Redact);
        assert!(RedactAction::Redact < RedactAction::Block);
    }

    #[test]
    fn test_tool_section_open_options() {
        let cfg = parse(
            r#"
            [tools.mise]
            enabled = false
            experimental = true
            "#,
        );
        let mise = cfg.tools.get("mise").expect("tool section");
        assert_eq!(mise.enabled, Some(false));
        assert!(mise.options.contains_key("experimental"));
        assert!(!cfg.tool_enabled("mise"));
        assert!(cfg.tool_enabled("cargo"), "unknown tools default enabled");
    }
}
