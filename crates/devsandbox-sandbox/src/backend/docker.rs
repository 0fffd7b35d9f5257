//! Container lowering: a persistent per-sandbox container named from the
//! sandbox identity; runs exec into it so caches and scratch state survive
//! between sessions.

use super::IsolationBackend;
use crate::plan::{MountMode, MountOp, MountPlan};
use crate::shell::ShellCommand;
use crate::tools::CacheMount;
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::process::Command;

pub const DEFAULT_IMAGE: &str = "debian:bookworm-slim";

pub struct DockerBackend {
    docker: PathBuf,
    pub container_name: String,
    pub image: String,
    /// When set, the image is built from this Dockerfile on first use
    /// instead of pulling `image`.
    pub dockerfile: Option<PathBuf>,
    pub extra_args: Vec<String>,
    pub cache_mounts: Vec<CacheMount>,
    /// Detached networking: proxy env is the only way out.
    pub no_network: bool,
}

impl DockerBackend {
    pub fn detect(sandbox_name: &str) -> Result<Self> {
        let docker = which::which("docker")
            .context("docker not found; install Docker or use the namespace backend")?;
        Ok(Self {
            docker,
            container_name: format!("devsandbox-{sandbox_name}"),
            image: DEFAULT_IMAGE.to_string(),
            dockerfile: None,
            extra_args: Vec::new(),
            cache_mounts: Vec::new(),
            no_network: false,
        })
    }

    #[cfg(test)]
    fn fake(sandbox_name: &str) -> Self {
        Self {
            docker: PathBuf::from("/usr/bin/docker"),
            container_name: format!("devsandbox-{sandbox_name}"),
            image: DEFAULT_IMAGE.to_string(),
            dockerfile: None,
            extra_args: Vec::new(),
            cache_mounts: Vec::new(),
            no_network: false,
        }
    }

    /// `docker create` argv for the persistent container.
    pub fn create_args(&self, plan: &MountPlan) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "create".into(),
            "--name".into(),
            self.container_name.clone(),
            "--init".into(),
        ];
        if self.no_network {
            args.push("--network".into());
            args.push("none".into());
        }
        for op in plan.ops() {
            lower_op(&mut args, op);
        }
        for cache in &self.cache_mounts {
            args.push("-v".into());
            args.push(format!(
                "{}:{}",
                cache.volume,
                cache.dest.to_string_lossy()
            ));
        }
        args.extend(self.extra_args.iter().cloned());
        args.push(self.image.clone());
        // Keep the container alive between execs.
        args.push("sleep".into());
        args.push("infinity".into());
        args
    }

    /// `docker exec` argv running the payload with the plan's environment.
    pub fn exec_args(&self, plan: &MountPlan, payload: &ShellCommand) -> Vec<String> {
        let mut args: Vec<String> = vec!["exec".into(), "-it".into()];
        for env in plan.env() {
            args.push("-e".into());
            args.push(format!("{}={}", env.name, env.value));
        }
        if let Some(dir) = plan.chdir() {
            args.push("-w".into());
            args.push(dir.to_string_lossy().into_owned());
        }
        args.push(self.container_name.clone());
        args.push(payload.program.clone());
        args.extend(payload.args.iter().cloned());
        args
    }

    fn container_exists(&self) -> bool {
        Command::new(&self.docker)
            .args(["container", "inspect", &self.container_name])
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    /// Build the configured Dockerfile into a per-sandbox image tag.
    fn build_image(&mut self, dockerfile: &PathBuf) -> Result<()> {
        let tag = format!("devsandbox-img-{}", self.container_name);
        let context = dockerfile
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));
        let out = Command::new(&self.docker)
            .arg("build")
            .arg("-f")
            .arg(dockerfile)
            .arg("-t")
            .arg(&tag)
            .arg(context)
            .output()
            .context("docker build")?;
        if !out.status.success() {
            anyhow::bail!(
                "docker build of {} failed: {}",
                dockerfile.display(),
                String::from_utf8_lossy(&out.stderr)
            );
        }
        self.image = tag;
        Ok(())
    }

    /// Create the container if this is the first run for the project.
    pub fn ensure_container(&mut self, plan: &MountPlan) -> Result<()> {
        if self.container_exists() {
            return Ok(());
        }
        if let Some(dockerfile) = self.dockerfile.clone() {
            self.build_image(&dockerfile)?;
        }
        let out = Command::new(&self.docker)
            .args(self.create_args(plan))
            .output()
            .context("docker create")?;
        if !out.status.success() {
            anyhow::bail!(
                "docker create failed: {}",
                String::from_utf8_lossy(&out.stderr)
            );
        }
        Ok(())
    }

    fn start_container(&self) -> Result<()> {
        let out = Command::new(&self.docker)
            .args(["start", &self.container_name])
            .output()
            .context("docker start")?;
        if !out.status.success() {
            anyhow::bail!(
                "docker start failed: {}",
                String::from_utf8_lossy(&out.stderr)
            );
        }
        Ok(())
    }
}

fn lower_op(args: &mut Vec<String>, op: &MountOp) {
    let dest = op.dest.to_string_lossy();
    let source = op
        .source
        .as_deref()
        .map(|p| p.to_string_lossy().into_owned());
    match &op.mode {
        // The container runtime owns /proc and /dev.
        MountMode::Proc | MountMode::Dev => {}
        MountMode::Tmpfs => {
            args.push("--tmpfs".into());
            args.push(dest.into_owned());
        }
        MountMode::RoBind | MountMode::Symlink => {
            if let Some(src) = source {
                args.push("-v".into());
                args.push(format!("{src}:{dest}:ro"));
            }
        }
        MountMode::RwBind => {
            if let Some(src) = source {
                args.push("-v".into());
                args.push(format!("{src}:{dest}"));
            }
        }
        MountMode::Hidden => {
            if op.dest.is_dir() {
                args.push("--tmpfs".into());
                args.push(dest.into_owned());
            } else {
                args.push("-v".into());
                args.push(format!("/dev/null:{dest}:ro"));
            }
        }
        // No overlayfs control through the docker CLI; a named volume
        // keyed by the encoded destination gives the same persistence.
        MountMode::OverlayPersistent { upper, .. } => {
            let volume = upper
                .parent()
                .and_then(|p| p.file_name())
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "overlay".to_string());
            args.push("-v".into());
            args.push(format!("devsandbox-overlay-{volume}:{dest}"));
        }
        MountMode::OverlayTmp => {
            args.push("--tmpfs".into());
            args.push(dest.into_owned());
        }
    }
}

impl IsolationBackend for DockerBackend {
    fn name(&self) -> &'static str {
        "container"
    }

    fn command(&mut self, plan: &MountPlan, payload: &ShellCommand) -> Result<Command> {
        self.ensure_container(plan)?;
        self.start_container()?;
        let mut cmd = Command::new(&self.docker);
        cmd.args(self.exec_args(plan, payload));
        Ok(cmd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan_fixture() -> MountPlan {
        let mut plan = MountPlan::new();
        plan.push(MountOp::ro_bind("/usr", "/usr")).expect("usr");
        plan.push(MountOp::rw_bind("/src/p", "/src/p")).expect("proj");
        plan.set_env("SANDBOX", "1", "planner").expect("env");
        plan.set_chdir("/src/p");
        plan
    }

    #[test]
    fn test_container_name_from_sandbox_identity() {
        let backend = DockerBackend::fake("my-app-12ab34cd");
        assert_eq!(backend.container_name, "devsandbox-my-app-12ab34cd");
    }

    #[test]
    fn test_create_args_include_binds_and_image() {
        let mut backend = DockerBackend::fake("p-1");
        backend.cache_mounts.push(CacheMount {
            volume: "cargo-registry".into(),
            dest: PathBuf::from("/cache/cargo-registry"),
        });
        let args = backend.create_args(&plan_fixture());
        let joined = args.join(" ");
        assert!(joined.contains("-v /usr:/usr:ro"));
        assert!(joined.contains("-v /src/p:/src/p"));
        assert!(joined.contains("-v cargo-registry:/cache/cargo-registry"));
        assert!(joined.ends_with(&format!("{DEFAULT_IMAGE} sleep infinity")));
    }

    #[test]
    fn test_exec_args_carry_env_and_workdir() {
        let backend = DockerBackend::fake("p-1");
        let payload = ShellCommand {
            program: "bash".into(),
            args: vec!["-c".into(), "true".into()],
        };
        let args = backend.exec_args(&plan_fixture(), &payload);
        let joined = args.join(" ");
        assert!(joined.contains("-e SANDBOX=1"));
        assert!(joined.contains("-w /src/p"));
        assert!(joined.ends_with("devsandbox-p-1 bash -c true"));
    }

    #[test]
    fn test_no_network_flag() {
        let mut backend = DockerBackend::fake("p-1");
        backend.no_network = true;
        let args = backend.create_args(&plan_fixture());
        let joined = args.join(" ");
        assert!(joined.contains("--network none"));
    }
}
