//! Bubblewrap lowering: one flag group per mount op, in plan order.

use super::IsolationBackend;
use crate::plan::{MountMode, MountOp, MountPlan};
use crate::shell::ShellCommand;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::process::Command;

pub struct BwrapBackend {
    bwrap: PathBuf,
    /// Detach the payload from the host network namespace. The supervisor
    /// then attaches a user-mode networking helper to the child.
    pub unshare_net: bool,
    /// In-namespace route setup run before the payload when proxy mode is
    /// on (gateway /32 route only, default route removed).
    pub network_prelude: Option<String>,
}

impl BwrapBackend {
    pub fn detect() -> Result<Self> {
        let bwrap = which::which("bwrap").context(
            "bubblewrap not found; install it (apt install bubblewrap / dnf install bubblewrap)",
        )?;
        Ok(Self {
            bwrap,
            unshare_net: false,
            network_prelude: None,
        })
    }

    #[cfg(test)]
    fn fake(path: &str) -> Self {
        Self {
            bwrap: PathBuf::from(path),
            unshare_net: false,
            network_prelude: None,
        }
    }

    /// Flag vector for the whole plan, without the payload.
    pub fn lower_args(&self, plan: &MountPlan) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "--clearenv".into(),
            "--unshare-user".into(),
            "--unshare-pid".into(),
            "--die-with-parent".into(),
        ];
        if self.unshare_net {
            args.push("--unshare-net".into());
        }
        for op in plan.ops() {
            lower_op(&mut args, op);
        }
        for env in plan.env() {
            args.push("--setenv".into());
            args.push(env.name.clone());
            args.push(env.value.clone());
        }
        if let Some(dir) = plan.chdir() {
            args.push("--chdir".into());
            args.push(dir.to_string_lossy().into_owned());
        }
        args
    }
}

fn lower_op(args: &mut Vec<String>, op: &MountOp) {
    let dest = op.dest.to_string_lossy().into_owned();
    match &op.mode {
        MountMode::Proc => {
            args.push("--proc".into());
            args.push(dest);
        }
        MountMode::Dev => {
            args.push("--dev".into());
            args.push(dest);
        }
        MountMode::Tmpfs => {
            args.push("--tmpfs".into());
            args.push(dest);
        }
        MountMode::RoBind => {
            args.push(if op.optional { "--ro-bind-try" } else { "--ro-bind" }.into());
            args.push(source_str(op));
            args.push(dest);
        }
        MountMode::RwBind => {
            args.push(if op.optional { "--bind-try" } else { "--bind" }.into());
            args.push(source_str(op));
            args.push(dest);
        }
        MountMode::Symlink => {
            args.push("--symlink".into());
            args.push(source_str(op));
            args.push(dest);
        }
        MountMode::Hidden => {
            // Directories disappear behind an empty tmpfs, files behind
            // /dev/null.
            if Path::new(&dest).is_dir() {
                args.push("--tmpfs".into());
                args.push(dest);
            } else {
                args.push("--ro-bind".into());
                args.push("/dev/null".into());
                args.push(dest);
            }
        }
        MountMode::OverlayPersistent { upper, work } => {
            args.push("--overlay-src".into());
            args.push(source_str(op));
            args.push("--overlay".into());
            args.push(upper.to_string_lossy().into_owned());
            args.push(work.to_string_lossy().into_owned());
            args.push(dest);
        }
        MountMode::OverlayTmp => {
            args.push("--overlay-src".into());
            args.push(source_str(op));
            args.push("--tmp-overlay".into());
            args.push(dest);
        }
    }
}

fn source_str(op: &MountOp) -> String {
    op.source
        .as_deref()
        .unwrap_or_else(|| Path::new(""))
        .to_string_lossy()
        .into_owned()
}

impl IsolationBackend for BwrapBackend {
    fn name(&self) -> &'static str {
        "namespace"
    }

    fn command(&mut self, plan: &MountPlan, payload: &ShellCommand) -> Result<Command> {
        let mut cmd = Command::new(&self.bwrap);
        cmd.args(self.lower_args(plan));
        cmd.arg("--");
        match &self.network_prelude {
            Some(prelude) => {
                // The prelude needs a shell of its own before the payload
                // takes over.
                let quoted = crate::shell::quote_command(
                    &std::iter::once(payload.program.clone())
                        .chain(payload.args.iter().cloned())
                        .collect::<Vec<_>>(),
                );
                cmd.arg("sh");
                cmd.arg("-c");
                cmd.arg(format!("{prelude}\nexec {quoted}"));
            }
            None => {
                cmd.arg(&payload.program);
                cmd.args(&payload.args);
            }
        }
        Ok(cmd)
    }
}

/// Route setup that leaves the gateway as the only reachable endpoint.
pub fn proxy_only_prelude(gateway_ip: &str) -> String {
    format!(
        "ip route add {gateway_ip}/32 dev eth0 2>/dev/null || true\n\
         ip route del default 2>/dev/null || true"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::MountOp;

    fn plan_fixture() -> MountPlan {
        let mut plan = MountPlan::new();
        plan.push(MountOp {
            source: None,
            dest: PathBuf::from("/proc"),
            mode: MountMode::Proc,
            optional: false,
        })
        .expect("proc");
        plan.push(MountOp::ro_bind("/usr", "/usr")).expect("usr");
        plan.push(MountOp::rw_bind("/src/p", "/src/p").optional())
            .expect("project");
        plan.set_env("SANDBOX", "1", "planner").expect("env");
        plan.set_chdir("/src/p");
        plan
    }

    #[test]
    fn test_lower_args_order_and_flags() {
        let backend = BwrapBackend::fake("/usr/bin/bwrap");
        let args = backend.lower_args(&plan_fixture());
        let joined = args.join(" ");
        assert!(joined.starts_with(
            "--clearenv --unshare-user --unshare-pid --die-with-parent --proc /proc"
        ));
        assert!(joined.contains("--ro-bind /usr /usr"));
        assert!(joined.contains("--bind-try /src/p /src/p"));
        assert!(joined.contains("--setenv SANDBOX 1"));
        assert!(joined.ends_with("--chdir /src/p"));
    }

    #[test]
    fn test_unshare_net_flag() {
        let mut backend = BwrapBackend::fake("/usr/bin/bwrap");
        backend.unshare_net = true;
        let args = backend.lower_args(&plan_fixture());
        assert!(args.contains(&"--unshare-net".to_string()));
    }

    #[test]
    fn test_overlay_lowering() {
        let backend = BwrapBackend::fake("/usr/bin/bwrap");
        let mut plan = MountPlan::new();
        plan.push(MountOp {
            source: Some(PathBuf::from("/opt/models")),
            dest: PathBuf::from("/opt/models"),
            mode: MountMode::OverlayPersistent {
                upper: PathBuf::from("/state/overlay/opt_models/upper"),
                work: PathBuf::from("/state/overlay/opt_models/work"),
            },
            optional: true,
        })
        .expect("overlay");
        let joined = backend.lower_args(&plan).join(" ");
        assert!(joined.contains(
            "--overlay-src /opt/models --overlay /state/overlay/opt_models/upper /state/overlay/opt_models/work /opt/models"
        ));
    }

    #[test]
    fn test_hidden_file_lowering() {
        let backend = BwrapBackend::fake("/usr/bin/bwrap");
        let mut plan = MountPlan::new();
        plan.push(MountOp::hidden("/definitely/not/a/dir.env"))
            .expect("hidden");
        let joined = backend.lower_args(&plan).join(" ");
        assert!(joined.contains("--ro-bind /dev/null /definitely/not/a/dir.env"));
    }

    #[test]
    fn test_proxy_prelude_routes() {
        let prelude = proxy_only_prelude("10.0.2.2");
        assert!(prelude.contains("ip route add 10.0.2.2/32"));
        assert!(prelude.contains("ip route del default"));
    }
}
