//! The per-sandbox root CA and the in-memory leaf certificate cache.
//!
//! The CA keypair is generated once per sandbox and reused; per-host
//! leaves are minted on demand, signed by it, and cached behind one mutex
//! with LRU eviction. Leaf generation happens outside the lock.

use anyhow::{anyhow, Context, Result};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SanType,
    PKCS_ECDSA_P256_SHA256,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::net::IpAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Upper bound on cached leaves; oldest-used hosts are evicted first.
pub const LEAF_CACHE_CAP: usize = 256;

const CA_COMMON_NAME: &str = "devsandbox MITM CA";

/// Leaf validity: backdated an hour against clock skew, good for 90 days.
const LEAF_BACKDATE_HOURS: i64 = 1;
const LEAF_VALID_DAYS: i64 = 90;

pub struct CertAuthority {
    ca_cert: rcgen::Certificate,
    ca_key: KeyPair,
    ca_cert_pem: String,
    cache: Mutex<LeafCache>,
}

#[derive(Default)]
struct LeafCache {
    map: HashMap<String, Arc<ServerConfig>>,
    order: VecDeque<String>,
}

impl LeafCache {
    fn get(&mut self, host: &str) -> Option<Arc<ServerConfig>> {
        let config = self.map.get(host).cloned()?;
        self.order.retain(|h| h != host);
        self.order.push_back(host.to_string());
        Some(config)
    }

    fn insert(&mut self, host: String, config: Arc<ServerConfig>) {
        if self.map.insert(host.clone(), config).is_none() {
            self.order.push_back(host);
        }
        while self.map.len() > LEAF_CACHE_CAP {
            let Some(evicted) = self.order.pop_front() else {
                break;
            };
            self.map.remove(&evicted);
            tracing::debug!("leaf cache evicted {evicted} (cap {LEAF_CACHE_CAP})");
        }
    }
}

impl CertAuthority {
    /// Load the CA from `cert.pem`/`key.pem`, generating both on first
    /// use. An existing key is never overwritten; half a CA on disk is an
    /// error.
    pub fn load_or_create(cert_path: &Path, key_path: &Path) -> Result<Self> {
        let (cert_pem, key_pem) = if cert_path.exists() || key_path.exists() {
            if !cert_path.exists() || !key_path.exists() {
                return Err(anyhow!(
                    "incomplete CA: both {} and {} must exist",
                    cert_path.display(),
                    key_path.display()
                ));
            }
            let cert_pem = fs::read_to_string(cert_path)
                .with_context(|| format!("read CA cert {}", cert_path.display()))?;
            let key_pem = fs::read_to_string(key_path)
                .with_context(|| format!("read CA key {}", key_path.display()))?;
            (cert_pem, key_pem)
        } else {
            let (cert_pem, key_pem) = generate_ca_pem()?;
            persist_ca(cert_path, key_path, &cert_pem, &key_pem)?;
            tracing::info!("generated MITM CA at {}", cert_path.display());
            (cert_pem, key_pem)
        };

        let ca_key = KeyPair::from_pem(&key_pem).context("parse CA key")?;
        let params =
            CertificateParams::from_ca_cert_pem(&cert_pem).context("parse CA cert")?;
        let ca_cert = params
            .self_signed(&ca_key)
            .context("rebuild CA issuer certificate")?;

        Ok(Self {
            ca_cert,
            ca_key,
            ca_cert_pem: cert_pem,
            cache: Mutex::new(LeafCache::default()),
        })
    }

    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// TLS server config presenting a leaf for `host`, from cache or
    /// freshly minted.
    pub fn server_config_for(&self, host: &str) -> Result<Arc<ServerConfig>> {
        {
            let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(config) = cache.get(host) {
                return Ok(config);
            }
        }

        // Minting involves key generation and signing; keep it outside
        // the cache lock.
        let config = Arc::new(self.issue_leaf(host)?);

        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.insert(host.to_string(), Arc::clone(&config));
        Ok(config)
    }

    pub fn cache_len(&self) -> usize {
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .map
            .len()
    }

    fn issue_leaf(&self, host: &str) -> Result<ServerConfig> {
        let mut params = if let Ok(ip) = host.parse::<IpAddr>() {
            let mut params =
                CertificateParams::new(Vec::new()).context("leaf cert params")?;
            params.subject_alt_names.push(SanType::IpAddress(ip));
            params
        } else {
            CertificateParams::new(vec![host.to_string()]).context("leaf cert params")?
        };
        let now = time::OffsetDateTime::now_utc();
        params.not_before = now - time::Duration::hours(LEAF_BACKDATE_HOURS);
        params.not_after = now + time::Duration::days(LEAF_VALID_DAYS);
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];

        let leaf_key =
            KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).context("leaf key pair")?;
        let leaf = params
            .signed_by(&leaf_key, &self.ca_cert, &self.ca_key)
            .with_context(|| format!("sign leaf for {host}"))?;

        let cert_chain: Vec<CertificateDer<'static>> = vec![leaf.der().clone()];
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf_key.serialize_der()));
        ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(cert_chain, key)
            .context("build TLS server config")
    }
}

fn generate_ca_pem() -> Result<(String, String)> {
    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::CrlSign,
    ];
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, CA_COMMON_NAME);
    params.distinguished_name = dn;

    let key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).context("CA key pair")?;
    let cert = params.self_signed(&key).context("self-sign CA")?;
    Ok((cert.pem(), key.serialize_pem()))
}

fn persist_ca(
    cert_path: &Path,
    key_path: &Path,
    cert_pem: &str,
    key_pem: &str,
) -> Result<()> {
    if let Some(parent) = key_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create {}", parent.display()))?;
    }
    write_create_new(key_path, key_pem.as_bytes(), 0o600)
        .with_context(|| format!("persist CA key {}", key_path.display()))?;
    if let Err(err) = write_create_new(cert_path, cert_pem.as_bytes(), 0o644)
        .with_context(|| format!("persist CA cert {}", cert_path.display()))
    {
        // Do not leave a key without its cert behind.
        let _ = fs::remove_file(key_path);
        return Err(err);
    }
    Ok(())
}

/// Create-new semantics: an existing file is never overwritten (silently
/// replacing a CA key would orphan every previously trusted chain).
fn write_create_new(path: &Path, contents: &[u8], mode: u32) -> Result<()> {
    use std::io::Write;
    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;
    let mut file = options
        .open(path)
        .with_context(|| format!("create {}", path.display()))?;
    file.write_all(contents)
        .with_context(|| format!("write {}", path.display()))?;
    file.sync_all()
        .with_context(|| format!("fsync {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn authority(dir: &Path) -> CertAuthority {
        CertAuthority::load_or_create(&dir.join("cert.pem"), &dir.join("key.pem"))
            .expect("create CA")
    }

    #[test]
    fn test_ca_generated_and_reloaded() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let ca = authority(tmp.path());
        let pem_first = ca.ca_cert_pem().to_string();
        assert!(pem_first.contains("BEGIN CERTIFICATE"));

        let reloaded = authority(tmp.path());
        assert_eq!(
            reloaded.ca_cert_pem(),
            pem_first,
            "second start loads the same CA"
        );
    }

    #[test]
    fn test_key_file_mode_is_0600() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let _ca = authority(tmp.path());
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(tmp.path().join("key.pem"))
                .expect("key metadata")
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_half_a_ca_is_an_error() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let _ca = authority(tmp.path());
        fs::remove_file(tmp.path().join("cert.pem")).expect("remove cert");
        let result = CertAuthority::load_or_create(
            &tmp.path().join("cert.pem"),
            &tmp.path().join("key.pem"),
        );
        let err = match result {
            Err(err) => err,
            Ok(_) => panic!("half a CA"),
        };
        assert!(format!("{err:#}").contains("incomplete CA"));
    }

    #[test]
    fn test_leaf_cached_per_host() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let ca = authority(tmp.path());
        let first = ca.server_config_for("example.com").expect("leaf");
        let second = ca.server_config_for("example.com").expect("leaf again");
        assert!(Arc::ptr_eq(&first, &second), "second hit comes from cache");
        assert_eq!(ca.cache_len(), 1);

        let _other = ca.server_config_for("other.example").expect("other leaf");
        assert_eq!(ca.cache_len(), 2);
    }

    #[test]
    fn test_ip_host_leaf() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let ca = authority(tmp.path());
        ca.server_config_for("127.0.0.1").expect("IP SAN leaf");
    }

    #[test]
    fn test_lru_eviction_bound() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let ca = authority(tmp.path());
        for i in 0..(LEAF_CACHE_CAP + 5) {
            ca.server_config_for(&format!("host-{i}.example"))
                .expect("leaf");
        }
        assert_eq!(ca.cache_len(), LEAF_CACHE_CAP);
    }
}
