//! Credential injection: secrets are resolved on the host at proxy
//! startup and attached as headers for matching destination hosts. The
//! sandbox never sees the secret source.

use devsandbox_core::config::schema::CredentialInjector;
use devsandbox_core::pathglob;
use std::collections::BTreeMap;

/// One resolved injector.
struct Injector {
    name: String,
    hosts: Vec<String>,
    header: String,
    value: String,
}

/// Header to add to an outgoing request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectedHeader {
    pub injector: String,
    pub header: String,
    pub value: String,
}

#[derive(Default)]
pub struct InjectorSet {
    injectors: Vec<Injector>,
}

impl InjectorSet {
    /// Resolve configured injectors. An injector whose secret cannot be
    /// resolved is logged and disabled for the session; it never fails the
    /// proxy start.
    pub fn from_config(config: &BTreeMap<String, CredentialInjector>) -> Self {
        let mut injectors = Vec::new();
        for (name, inj) in config {
            if !inj.enabled.unwrap_or(true) {
                continue;
            }
            let secret = match resolve_secret(inj) {
                Some(s) if !s.is_empty() => s,
                _ => {
                    tracing::warn!(
                        "credential injector {name}: secret did not resolve, disabled for this session"
                    );
                    continue;
                }
            };
            let value = match &inj.prefix {
                Some(prefix) => format!("{prefix}{secret}"),
                None => secret,
            };
            injectors.push(Injector {
                name: name.clone(),
                hosts: inj.hosts.clone(),
                header: inj.header.clone(),
                value,
            });
        }
        Self { injectors }
    }

    pub fn is_empty(&self) -> bool {
        self.injectors.is_empty()
    }

    /// Headers to inject for a destination host.
    pub fn for_host(&self, host: &str) -> Vec<InjectedHeader> {
        self.injectors
            .iter()
            .filter(|inj| inj.hosts.iter().any(|p| host_matches(host, p)))
            .map(|inj| InjectedHeader {
                injector: inj.name.clone(),
                header: inj.header.clone(),
                value: inj.value.clone(),
            })
            .collect()
    }
}

fn resolve_secret(inj: &CredentialInjector) -> Option<String> {
    if let Some(env) = &inj.value_env {
        return std::env::var(env).ok();
    }
    if let Some(file) = &inj.value_file {
        let path = pathglob::expand_tilde(file);
        return std::fs::read_to_string(path)
            .ok()
            .map(|s| s.trim_end_matches(['\r', '\n']).to_string());
    }
    None
}

/// Exact match, or `*.suffix` matching both subdomains and the bare
/// suffix.
fn host_matches(host: &str, pattern: &str) -> bool {
    let host = host.to_ascii_lowercase();
    let pattern = pattern.to_ascii_lowercase();
    if let Some(base) = pattern.strip_prefix("*.") {
        return host == base || host.ends_with(&format!(".{base}"));
    }
    host == pattern
}

#[cfg(test)]
mod tests {
    use super::*;

    fn injector(hosts: &[&str], header: &str, value_env: &str) -> CredentialInjector {
        CredentialInjector {
            enabled: None,
            hosts: hosts.iter().map(|s| s.to_string()).collect(),
            header: header.to_string(),
            value_env: Some(value_env.to_string()),
            value_file: None,
            prefix: Some("Bearer ".to_string()),
        }
    }

    #[test]
    fn test_host_matches() {
        assert!(host_matches("api.github.com", "*.github.com"));
        assert!(host_matches("github.com", "*.github.com"));
        assert!(host_matches("GitHub.com", "github.com"));
        assert!(!host_matches("notgithub.com", "*.github.com"));
        assert!(!host_matches("github.com.evil", "*.github.com"));
    }

    #[test]
    fn test_resolution_and_prefix() {
        std::env::set_var("DEVSANDBOX_TEST_TOKEN_A", "tok-123");
        let mut config = BTreeMap::new();
        config.insert(
            "github".to_string(),
            injector(&["*.github.com"], "Authorization", "DEVSANDBOX_TEST_TOKEN_A"),
        );
        let set = InjectorSet::from_config(&config);
        let headers = set.for_host("api.github.com");
        assert_eq!(headers.len(), 1);
        assert_eq!(headers[0].header, "Authorization");
        assert_eq!(headers[0].value, "Bearer tok-123");
        assert!(set.for_host("example.com").is_empty());
    }

    #[test]
    fn test_unresolved_injector_is_disabled() {
        let mut config = BTreeMap::new();
        config.insert(
            "broken".to_string(),
            injector(&["example.com"], "X-Auth", "DEVSANDBOX_TEST_TOKEN_MISSING"),
        );
        let set = InjectorSet::from_config(&config);
        assert!(set.is_empty());
    }

    #[test]
    fn test_disabled_injector_skipped() {
        std::env::set_var("DEVSANDBOX_TEST_TOKEN_B", "tok");
        let mut config = BTreeMap::new();
        let mut inj = injector(&["example.com"], "X-Auth", "DEVSANDBOX_TEST_TOKEN_B");
        inj.enabled = Some(false);
        config.insert("off".to_string(), inj);
        let set = InjectorSet::from_config(&config);
        assert!(set.is_empty());
    }

    #[test]
    fn test_value_file_trims_trailing_newline() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let secret = tmp.path().join("token");
        std::fs::write(&secret, "tok-from-file\n").expect("write");
        let mut config = BTreeMap::new();
        config.insert(
            "file".to_string(),
            CredentialInjector {
                enabled: None,
                hosts: vec!["example.com".to_string()],
                header: "X-Auth".to_string(),
                value_env: None,
                value_file: Some(secret.to_string_lossy().into_owned()),
                prefix: None,
            },
        );
        let set = InjectorSet::from_config(&config);
        assert_eq!(set.for_host("example.com")[0].value, "tok-from-file");
    }
}
