//! Ordered filter-rule evaluation with a per-session decision cache.
//!
//! Rules run top-down, first match wins. Without a `default_action` and
//! without rules, filtering is off entirely; with rules but no default,
//! the fallthrough is Block (fail safe).

use anyhow::{Context, Result};
use devsandbox_core::config::schema::{
    FilterAction, FilterSection, MatchType, RuleScope,
};
use globset::GlobMatcher;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Mutex;

/// Outcome of rule evaluation for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Block { reason: String },
    /// Referred to the monitor over the ask channel.
    Ask,
}

enum Matcher {
    Exact(String),
    Glob(GlobMatcher),
    Regex(Regex),
}

impl Matcher {
    fn matches(&self, value: &str) -> bool {
        match self {
            Matcher::Exact(expect) => value == expect,
            Matcher::Glob(glob) => glob.is_match(value),
            Matcher::Regex(regex) => regex.is_match(value),
        }
    }
}

struct CompiledRule {
    pattern: String,
    action: FilterAction,
    scope: RuleScope,
    matcher: Matcher,
    reason: Option<String>,
}

pub struct FilterEngine {
    rules: Vec<CompiledRule>,
    default_action: Option<FilterAction>,
}

impl FilterEngine {
    pub fn from_config(section: &FilterSection) -> Result<Self> {
        let mut rules = Vec::with_capacity(section.rules.len());
        for rule in &section.rules {
            let matcher = match rule.match_type {
                MatchType::Exact => Matcher::Exact(rule.pattern.clone()),
                MatchType::Glob => Matcher::Glob(
                    globset::Glob::new(&rule.pattern)
                        .with_context(|| format!("filter glob {:?}", rule.pattern))?
                        .compile_matcher(),
                ),
                MatchType::Regex => Matcher::Regex(
                    Regex::new(&rule.pattern)
                        .with_context(|| format!("filter regex {:?}", rule.pattern))?,
                ),
            };
            rules.push(CompiledRule {
                pattern: rule.pattern.clone(),
                action: rule.action,
                scope: rule.scope,
                matcher,
                reason: rule.reason.clone(),
            });
        }
        Ok(Self {
            rules,
            default_action: section.default_action,
        })
    }

    /// Whether any filtering is configured at all.
    pub fn is_enabled(&self) -> bool {
        self.default_action.is_some() || !self.rules.is_empty()
    }

    /// Evaluate a request. `url` is scheme://host/path.
    pub fn evaluate(&self, host: &str, path: &str, url: &str) -> Verdict {
        if !self.is_enabled() {
            return Verdict::Allow;
        }
        for rule in &self.rules {
            let value = match rule.scope {
                RuleScope::Host => host,
                RuleScope::Path => path,
                RuleScope::Url => url,
            };
            if rule.matcher.matches(value) {
                return verdict_for(rule.action, rule.reason.as_deref(), &rule.pattern);
            }
        }
        match self.default_action {
            Some(action) => verdict_for(action, None, "default_action"),
            // Rules exist but no fallthrough was configured: fail safe.
            None => Verdict::Block {
                reason: "no rule matched and no default_action is set".to_string(),
            },
        }
    }
}

fn verdict_for(action: FilterAction, reason: Option<&str>, pattern: &str) -> Verdict {
    match action {
        FilterAction::Allow => Verdict::Allow,
        FilterAction::Ask => Verdict::Ask,
        FilterAction::Block => Verdict::Block {
            reason: reason
                .map(str::to_string)
                .unwrap_or_else(|| format!("blocked by rule {pattern:?}")),
        },
    }
}

/// Remembered per-host decisions for one proxy session. Entries appear
/// only from `remember=true` answers or non-ask rule matches; the cache
/// dies with the proxy.
#[derive(Default)]
pub struct SessionCache {
    entries: Mutex<HashMap<String, FilterAction>>,
}

impl SessionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, host: &str) -> Option<FilterAction> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(host)
            .copied()
    }

    pub fn put(&self, host: &str, action: FilterAction) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(host.to_string(), action);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devsandbox_core::config::schema::FilterRule;

    fn section(default: Option<FilterAction>, rules: Vec<FilterRule>) -> FilterSection {
        FilterSection {
            default_action: default,
            rules,
        }
    }

    fn rule(pattern: &str, action: FilterAction) -> FilterRule {
        FilterRule {
            pattern: pattern.to_string(),
            action,
            ..FilterRule::default()
        }
    }

    #[test]
    fn test_disabled_without_default_and_rules() {
        let engine = FilterEngine::from_config(&section(None, vec![])).expect("engine");
        assert!(!engine.is_enabled());
        assert_eq!(
            engine.evaluate("evil.example", "/", "https://evil.example/"),
            Verdict::Allow
        );
    }

    #[test]
    fn test_first_match_wins() {
        let engine = FilterEngine::from_config(&section(
            Some(FilterAction::Block),
            vec![
                rule("*.github.com", FilterAction::Allow),
                rule("*", FilterAction::Ask),
            ],
        ))
        .expect("engine");
        assert_eq!(
            engine.evaluate("api.github.com", "/", "https://api.github.com/"),
            Verdict::Allow
        );
        assert_eq!(
            engine.evaluate("example.com", "/", "https://example.com/"),
            Verdict::Ask
        );
    }

    #[test]
    fn test_default_action_fallthrough() {
        let engine = FilterEngine::from_config(&section(
            Some(FilterAction::Allow),
            vec![rule("blocked.example", FilterAction::Block)],
        ))
        .expect("engine");
        assert_eq!(
            engine.evaluate("other.example", "/", "https://other.example/"),
            Verdict::Allow
        );
        assert!(matches!(
            engine.evaluate("blocked.example", "/", "https://blocked.example/"),
            Verdict::Block { .. }
        ));
    }

    #[test]
    fn test_rules_without_default_fall_through_to_block() {
        let engine = FilterEngine::from_config(&section(
            None,
            vec![rule("*.github.com", FilterAction::Allow)],
        ))
        .expect("engine");
        assert!(matches!(
            engine.evaluate("example.com", "/", "https://example.com/"),
            Verdict::Block { .. }
        ));
    }

    #[test]
    fn test_scopes() {
        let engine = FilterEngine::from_config(&section(
            Some(FilterAction::Block),
            vec![
                FilterRule {
                    pattern: "/v1/secrets*".to_string(),
                    action: FilterAction::Block,
                    scope: RuleScope::Path,
                    reason: Some("secrets API".to_string()),
                    ..FilterRule::default()
                },
                FilterRule {
                    pattern: "https://api.example.com/**".to_string(),
                    action: FilterAction::Allow,
                    scope: RuleScope::Url,
                    ..FilterRule::default()
                },
            ],
        ))
        .expect("engine");
        assert_eq!(
            engine.evaluate(
                "api.example.com",
                "/v1/secrets/list",
                "https://api.example.com/v1/secrets/list"
            ),
            Verdict::Block {
                reason: "secrets API".to_string()
            }
        );
        assert_eq!(
            engine.evaluate("api.example.com", "/v1/users", "https://api.example.com/v1/users"),
            Verdict::Allow
        );
    }

    #[test]
    fn test_exact_and_regex_match_types() {
        let engine = FilterEngine::from_config(&section(
            Some(FilterAction::Block),
            vec![
                FilterRule {
                    pattern: "registry.npmjs.org".to_string(),
                    action: FilterAction::Allow,
                    match_type: MatchType::Exact,
                    ..FilterRule::default()
                },
                FilterRule {
                    pattern: r"^.*\.internal$".to_string(),
                    action: FilterAction::Allow,
                    match_type: MatchType::Regex,
                    ..FilterRule::default()
                },
            ],
        ))
        .expect("engine");
        assert_eq!(
            engine.evaluate("registry.npmjs.org", "/", "https://registry.npmjs.org/"),
            Verdict::Allow
        );
        assert_eq!(
            engine.evaluate("build.internal", "/", "https://build.internal/"),
            Verdict::Allow
        );
        assert!(matches!(
            engine.evaluate("registry.npmjs.org.evil", "/", "https://x/"),
            Verdict::Block { .. }
        ));
    }

    #[test]
    fn test_session_cache() {
        let cache = SessionCache::new();
        assert!(cache.get("example.com").is_none());
        cache.put("example.com", FilterAction::Allow);
        assert_eq!(cache.get("example.com"), Some(FilterAction::Allow));
        assert_eq!(cache.len(), 1);
    }
}
