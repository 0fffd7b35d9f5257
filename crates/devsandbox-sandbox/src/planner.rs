//! Assembles the mount plan from config, tool descriptors, and the proxy
//! endpoint, in a fixed producer order.
//!
//! The order is part of the contract: the launcher applies ops in plan
//! order, so later ops stack over earlier ones. Conflict detection in the
//! plan itself keeps a later producer from silently masking an earlier one.

use crate::envfiles;
use crate::plan::{MountMode, MountOp, MountPlan};
use crate::tools::ToolRegistry;
use anyhow::{Context, Result};
use devsandbox_core::config::schema::{Config, MountRuleMode};
use devsandbox_core::pathglob;
use devsandbox_core::paths::SandboxPaths;
use std::path::{Path, PathBuf};

/// Name under which the MITM root CA appears inside the sandbox trust dir.
pub const MITM_CA_FILE: &str = "devsandbox-mitm-ca.pem";

/// Where the proxy is reachable from inside the sandbox.
#[derive(Debug, Clone)]
pub struct ProxyEndpoint {
    pub gateway_ip: String,
    pub port: u16,
    /// Host path of the CA certificate to project into the sandbox.
    pub ca_cert: PathBuf,
}

impl ProxyEndpoint {
    pub fn url(&self) -> String {
        format!("http://{}:{}", self.gateway_ip, self.port)
    }
}

pub struct PlannerInput<'a> {
    pub paths: &'a SandboxPaths,
    pub config: &'a Config,
    pub registry: &'a ToolRegistry,
    /// The invoking user's real home directory; the scratch home is bound
    /// over it so in-sandbox paths look ordinary.
    pub home_dir: PathBuf,
    pub proxy: Option<ProxyEndpoint>,
}

/// A built plan plus the shell-init fragments the composer needs.
pub struct Planned {
    pub plan: MountPlan,
    pub shell_inits: Vec<String>,
}

pub fn build_plan(input: &PlannerInput<'_>) -> Result<Planned> {
    let mut plan = MountPlan::new();
    let home = input.home_dir.as_path();
    let sandbox_home = input.paths.home();

    // 1. Base: fresh /proc, /dev, /tmp. Namespace flags live in the backend.
    plan.push(MountOp {
        source: None,
        dest: PathBuf::from("/proc"),
        mode: MountMode::Proc,
        optional: false,
    })?;
    plan.push(MountOp {
        source: None,
        dest: PathBuf::from("/dev"),
        mode: MountMode::Dev,
        optional: false,
    })?;
    plan.push(MountOp::tmpfs("/tmp"))?;

    // 2. System directories, matching the host's real layout: merged-usr
    //    distros symlink /bin -> usr/bin and bwrap must mirror that.
    plan.push(MountOp::ro_bind("/usr", "/usr"))?;
    for dir in ["/lib", "/lib64", "/bin", "/sbin"] {
        push_system_entry(&mut plan, Path::new(dir))?;
    }

    // 3. Name resolution and identity files.
    for file in [
        "/etc/resolv.conf",
        "/etc/hosts",
        "/etc/ssl",
        "/etc/passwd",
        "/etc/group",
        "/etc/nsswitch.conf",
    ] {
        if Path::new(file).exists() {
            plan.push(MountOp::ro_bind(file, file))?;
        }
    }

    // 4. Locale plus CA trust. /usr/share/ca-certificates already rides in
    //    with /usr; the other locations are refinements when present.
    for file in ["/etc/localtime", "/etc/locale.conf"] {
        if Path::new(file).exists() {
            plan.push(MountOp::ro_bind(file, file))?;
        }
    }
    for dir in ["/etc/ssl/certs", "/etc/pki/ca-trust", "/etc/ca-certificates"] {
        if Path::new(dir).exists() {
            plan.push(MountOp::ro_bind(dir, dir).optional())?;
        }
    }
    if let Some(proxy) = &input.proxy {
        let trust_dest = Path::new("/etc/ssl/certs").join(MITM_CA_FILE);
        plan.push(MountOp::ro_bind(&proxy.ca_cert, &trust_dest))?;
        let trust_dest = trust_dest.to_string_lossy().to_string();
        for var in [
            "SSL_CERT_FILE",
            "CURL_CA_BUNDLE",
            "REQUESTS_CA_BUNDLE",
            "NODE_EXTRA_CA_CERTS",
            "GIT_SSL_CAINFO",
            "CARGO_HTTP_CAINFO",
        ] {
            plan.set_env(var, &trust_dest, "proxy")?;
        }
        let url = proxy.url();
        for var in ["http_proxy", "https_proxy", "HTTP_PROXY", "HTTPS_PROXY"] {
            plan.set_env(var, &url, "proxy")?;
        }
        plan.set_env("NO_PROXY", "localhost,127.0.0.1", "proxy")?;
        plan.set_env("no_proxy", "localhost,127.0.0.1", "proxy")?;
    }

    // 5. Scratch home over the real one, with an XDG skeleton inside.
    create_home_skeleton(&sandbox_home)?;
    plan.push(MountOp::rw_bind(&sandbox_home, home))?;
    let home_str = home.to_string_lossy();
    plan.set_env("HOME", &home_str, "planner")?;
    plan.set_env("XDG_CONFIG_HOME", &format!("{home_str}/.config"), "planner")?;
    plan.set_env("XDG_CACHE_HOME", &format!("{home_str}/.cache"), "planner")?;
    plan.set_env("XDG_DATA_HOME", &format!("{home_str}/.local/share"), "planner")?;
    plan.set_env("XDG_STATE_HOME", &format!("{home_str}/.local/state"), "planner")?;
    for passthrough in ["TERM", "LANG", "COLORTERM"] {
        if let Ok(value) = std::env::var(passthrough) {
            plan.set_env(passthrough, &value, "planner")?;
        }
    }
    plan.set_env("SANDBOX", "1", "planner")?;
    plan.set_env("SANDBOX_PROJECT", input.paths.name(), "planner")?;

    // 6. Tool contributions.
    let mut shell_inits = Vec::new();
    let mut mise_present = false;
    for tool in input.registry.available_tools(home) {
        tool.prepare(home, &sandbox_home)
            .with_context(|| format!("prepare tool {}", tool.name()))?;
        for binding in tool.bindings(home, &sandbox_home) {
            if !binding.source.exists() {
                if binding.optional {
                    continue;
                }
                anyhow::bail!(
                    "tool {} requires missing path {}",
                    tool.name(),
                    binding.source.display()
                );
            }
            let op = if binding.read_only {
                MountOp::ro_bind(&binding.source, &binding.dest)
            } else {
                MountOp::rw_bind(&binding.source, &binding.dest)
            };
            plan.push(op)
                .with_context(|| format!("tool {} binding", tool.name()))?;
        }
        let origin = format!("tool:{}", tool.name());
        for env in tool.environment(home, &sandbox_home) {
            plan.set_env(&env.name, &env.value, &origin)?;
        }
        if let Some(init) = tool.shell_init(input.config.shell()) {
            shell_inits.push(init);
        }
        if tool.name() == "mise" {
            mise_present = true;
        }
    }

    // PATH is assembled last so tool shims land in front of the scratch
    // ~/.local/bin and the system dirs.
    let mut path_entries = Vec::new();
    if mise_present {
        path_entries.push(format!("{home_str}/.local/share/mise/shims"));
    }
    path_entries.push(format!("{home_str}/.local/bin"));
    for system in ["/usr/local/bin", "/usr/bin", "/bin", "/usr/sbin", "/sbin"] {
        path_entries.push(system.to_string());
    }
    plan.set_env("PATH", &path_entries.join(":"), "planner")?;

    // 7. The project itself, read-write at its original path.
    let project = input.paths.project_dir();
    plan.push(MountOp::rw_bind(project, project))?;
    plan.set_chdir(project);
    let runtime_dir = xdg_runtime_dir();
    plan.push(MountOp::tmpfs(&runtime_dir))?;
    plan.set_env("XDG_RUNTIME_DIR", &runtime_dir.to_string_lossy(), "planner")?;

    // 8. Dotenv suppression inside the project.
    if input.config.env_file_suppression() {
        for file in envfiles::discover(project) {
            plan.push(MountOp::hidden(&file).optional())
                .context("env-file suppression")?;
        }
    }

    // 9. User mount rules, in configured order.
    for rule in &input.config.sandbox.mounts.rules {
        for path in pathglob::expand_pattern(&rule.pattern)? {
            let op = user_rule_op(input, &rule.mode, &path)?;
            plan.push(op)
                .with_context(|| format!("mount rule {:?}", rule.pattern))?;
        }
    }

    Ok(Planned { plan, shell_inits })
}

/// `/lib` and friends are symlinks on merged-usr hosts, directories on
/// split-usr ones; reproduce whichever the host has.
fn push_system_entry(plan: &mut MountPlan, dir: &Path) -> Result<()> {
    let meta = match std::fs::symlink_metadata(dir) {
        Ok(m) => m,
        Err(_) => return Ok(()),
    };
    if meta.file_type().is_symlink() {
        let target = std::fs::read_link(dir)
            .with_context(|| format!("read symlink {}", dir.display()))?;
        plan.push(MountOp {
            source: Some(target),
            dest: dir.to_path_buf(),
            mode: MountMode::Symlink,
            optional: false,
        })?;
    } else if meta.is_dir() {
        plan.push(MountOp::ro_bind(dir, dir))?;
    }
    Ok(())
}

fn user_rule_op(
    input: &PlannerInput<'_>,
    mode: &MountRuleMode,
    path: &Path,
) -> Result<MountOp> {
    let op = match mode {
        MountRuleMode::Hidden => MountOp::hidden(path).optional(),
        MountRuleMode::ReadOnly => MountOp::ro_bind(path, path).optional(),
        MountRuleMode::ReadWrite => MountOp::rw_bind(path, path).optional(),
        MountRuleMode::Overlay => {
            if input.config.overlay_enabled() {
                let backing = input.paths.overlay_backing(path)?;
                provision_overlay(&backing.upper)?;
                provision_overlay(&backing.work)?;
                MountOp {
                    source: Some(path.to_path_buf()),
                    dest: path.to_path_buf(),
                    mode: MountMode::OverlayPersistent {
                        upper: backing.upper,
                        work: backing.work,
                    },
                    optional: true,
                }
            } else {
                tmp_overlay(path)
            }
        }
        MountRuleMode::TmpOverlay => tmp_overlay(path),
    };
    Ok(op)
}

fn tmp_overlay(path: &Path) -> MountOp {
    MountOp {
        source: Some(path.to_path_buf()),
        dest: path.to_path_buf(),
        mode: MountMode::OverlayTmp,
        optional: true,
    }
}

fn provision_overlay(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("create overlay dir {}", dir.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o755))
            .with_context(|| format!("chmod overlay dir {}", dir.display()))?;
    }
    Ok(())
}

fn create_home_skeleton(sandbox_home: &Path) -> Result<()> {
    for sub in [
        ".config",
        ".cache",
        ".local/share",
        ".local/state",
        ".local/bin",
    ] {
        let dir = sandbox_home.join(sub);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("create scratch home dir {}", dir.display()))?;
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn xdg_runtime_dir() -> PathBuf {
    let uid = nix::unistd::getuid().as_raw();
    PathBuf::from(format!("/run/user/{uid}"))
}

#[cfg(not(target_os = "linux"))]
fn xdg_runtime_dir() -> PathBuf {
    std::env::var("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp/devsandbox-runtime"))
}
