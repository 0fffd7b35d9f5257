use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// devsandbox - run untrusted developer tools in a per-project sandbox
#[derive(Parser, Debug)]
#[command(name = "devsandbox")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Project directory (default: current directory)
    #[arg(long, global = true, value_name = "DIR")]
    pub project: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Enter the sandbox shell, or run a command inside it
    Run {
        /// Disable the MITM proxy for this run even if configured on
        #[arg(long)]
        no_proxy: bool,

        /// Shell override: bash, zsh, or fish
        #[arg(long)]
        shell: Option<String>,

        /// Isolation backend override: namespace or container
        #[arg(long)]
        backend: Option<String>,

        /// Command to run instead of an interactive shell
        #[arg(trailing_var_arg = true)]
        command: Vec<String>,
    },

    /// Attach to a sandbox's ask channel and answer filter questions
    Monitor {
        /// Also tail the request log while attached
        #[arg(long)]
        tail: bool,
    },

    /// Manage trusted local config files
    Trust {
        #[command(subcommand)]
        command: TrustCommands,
    },

    /// Inspect the sandbox's MITM certificate authority
    Ca {
        #[command(subcommand)]
        command: CaCommands,
    },

    /// Show the effective (merged) configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },

    /// Print request-log records, oldest segment first
    Logs {
        /// Only records at or after this RFC3339 timestamp
        #[arg(long, value_name = "TIMESTAMP")]
        since: Option<String>,
    },

    /// Delete a sandbox's state directory
    Prune {
        /// Skip the confirmation prompt
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum TrustCommands {
    /// List trusted local configs
    List,
    /// Trust the project's current .devsandbox.toml
    Add,
    /// Remove trust for the project
    Remove,
}

#[derive(Subcommand, Debug)]
pub enum CaCommands {
    /// Print the path of the CA certificate
    Path,
    /// Print the CA certificate PEM
    Print,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Print the merged configuration as TOML
    Show,
}
