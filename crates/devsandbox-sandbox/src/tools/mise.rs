//! mise (version manager): tool versions come from the host install,
//! read-only; shims and activation run inside the sandbox.

use super::{Binding, EnvAssignment, Tool};
use devsandbox_core::config::schema::{ShellKind, ToolSection};
use std::path::Path;

#[derive(Debug, Default)]
pub struct Mise {
    /// Extra read-only tool dirs from `[tools.mise] extra_data_dirs`.
    extra_data_dirs: Vec<String>,
}

impl Tool for Mise {
    fn name(&self) -> &'static str {
        "mise"
    }

    fn description(&self) -> &'static str {
        "mise version manager: host-installed runtimes, read-only"
    }

    fn available(&self, home: &Path) -> bool {
        which::which("mise").is_ok() || home.join(".local/bin/mise").exists()
    }

    fn configure(&mut self, section: &ToolSection) {
        if let Some(dirs) = section.options.get("extra_data_dirs").and_then(|v| v.as_array()) {
            self.extra_data_dirs = dirs
                .iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect();
        }
    }

    fn bindings(&self, home: &Path, _sandbox_home: &Path) -> Vec<Binding> {
        let mut out = vec![
            Binding::ro(home.join(".local/bin/mise"), home.join(".local/bin/mise")),
            Binding::ro(
                home.join(".local/share/mise"),
                home.join(".local/share/mise"),
            ),
        ];
        for dir in &self.extra_data_dirs {
            out.push(Binding::ro(dir, dir));
        }
        out
    }

    fn environment(&self, home: &Path, sandbox_home: &Path) -> Vec<EnvAssignment> {
        vec![
            EnvAssignment::new(
                "MISE_DATA_DIR",
                home.join(".local/share/mise").to_string_lossy(),
            ),
            // State and cache go to the scratch home so runs cannot write
            // into the host install.
            EnvAssignment::new(
                "MISE_STATE_DIR",
                sandbox_home.join(".local/state/mise").to_string_lossy(),
            ),
            EnvAssignment::new(
                "MISE_CACHE_DIR",
                sandbox_home.join(".cache/mise").to_string_lossy(),
            ),
        ]
    }

    fn shell_init(&self, shell: ShellKind) -> Option<String> {
        let line = match shell {
            ShellKind::Bash => {
                "command -v mise >/dev/null 2>&1 && eval \"$(mise activate bash)\""
            }
            ShellKind::Zsh => {
                "command -v mise >/dev/null 2>&1 && eval \"$(mise activate zsh)\""
            }
            ShellKind::Fish => {
                "type -q mise; and mise activate fish | source"
            }
        };
        Some(line.to_string())
    }
}
