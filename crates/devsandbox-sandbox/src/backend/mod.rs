//! Isolation backends: both lower the same mount plan into a launcher
//! invocation and exec the payload shell.

pub mod bwrap;
pub mod docker;

use crate::plan::MountPlan;
use crate::shell::ShellCommand;
use anyhow::Result;
use std::process::Command;

pub trait IsolationBackend {
    fn name(&self) -> &'static str;

    /// Lower the plan into a ready-to-spawn command running `payload`.
    /// May prepare backend state first (image builds, container create).
    fn command(&mut self, plan: &MountPlan, payload: &ShellCommand) -> Result<Command>;
}
