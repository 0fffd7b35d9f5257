mod cli;
mod commands;
mod observability;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{CaCommands, Cli, Commands, ConfigCommands, TrustCommands};
use std::path::PathBuf;

fn main() {
    observability::init_tracing();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("devsandbox: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let project_dir = resolve_project_dir(cli.project)?;

    match cli.command {
        None => commands::run::run(commands::run::RunArgs {
            project_dir,
            no_proxy: false,
            shell: None,
            backend: None,
            command: Vec::new(),
        }),
        Some(Commands::Run {
            no_proxy,
            shell,
            backend,
            command,
        }) => commands::run::run(commands::run::RunArgs {
            project_dir,
            no_proxy,
            shell,
            backend,
            command,
        }),
        Some(Commands::Monitor { tail }) => {
            commands::monitor::run(&project_dir, tail)?;
            Ok(0)
        }
        Some(Commands::Trust { command }) => {
            match command {
                TrustCommands::List => commands::trust::list()?,
                TrustCommands::Add => commands::trust::add(&project_dir)?,
                TrustCommands::Remove => commands::trust::remove(&project_dir)?,
            }
            Ok(0)
        }
        Some(Commands::Ca { command }) => {
            match command {
                CaCommands::Path => commands::ca::path(&project_dir)?,
                CaCommands::Print => commands::ca::print(&project_dir)?,
            }
            Ok(0)
        }
        Some(Commands::Config { command }) => {
            match command {
                ConfigCommands::Show => commands::config::show(&project_dir)?,
            }
            Ok(0)
        }
        Some(Commands::Logs { since }) => {
            commands::logs::run(&project_dir, since.as_deref())?;
            Ok(0)
        }
        Some(Commands::Prune { force }) => {
            commands::prune::run(&project_dir, force)?;
            Ok(0)
        }
    }
}

fn resolve_project_dir(arg: Option<PathBuf>) -> Result<PathBuf> {
    let dir = match arg {
        Some(dir) => dir,
        None => std::env::current_dir().context("determine current directory")?,
    };
    dir.canonicalize()
        .with_context(|| format!("project directory {} does not exist", dir.display()))
}
