//! The interactive ask monitor: runs in a second terminal, answers the
//! proxy's filter questions, optionally tails the request log.

use anyhow::{Context, Result};
use devsandbox_core::paths::SandboxPaths;
use devsandbox_proxy::ask::{AskAction, AskResponse, MonitorLink};
use devsandbox_proxy::reqlog::{self, LogTailer};
use std::io::Write;
use std::path::Path;
use std::time::Duration;

pub fn run(project_dir: &Path, tail: bool) -> Result<()> {
    let paths = SandboxPaths::for_project(project_dir);
    if tail {
        spawn_tailer(&paths);
    }

    let mut link = MonitorLink::open(&paths.ask_socket(), &paths.ask_lock())?;
    eprintln!(
        "Monitoring sandbox {}: answer with y(es) / n(o), add ! to remember",
        paths.name()
    );

    while let Some(request) = link.recv()? {
        println!();
        println!("--- ask #{} ---", request.id);
        println!("{} {}{}", request.method, request.host, request.path);
        if !request.body.is_empty() {
            println!("body: {}", request.body);
        }
        let (action, remember) = prompt_decision()?;
        link.send(&AskResponse {
            id: request.id,
            action,
            remember,
        })?;
    }
    eprintln!("Sandbox went away, exiting monitor");
    Ok(())
}

fn prompt_decision() -> Result<(AskAction, bool)> {
    loop {
        print!("allow? [y/n/y!/n!] ");
        std::io::stdout().flush().context("flush prompt")?;
        let mut answer = String::new();
        std::io::stdin()
            .read_line(&mut answer)
            .context("read answer")?;
        match answer.trim() {
            "y" | "yes" => return Ok((AskAction::Allow, false)),
            "y!" | "yes!" => return Ok((AskAction::Allow, true)),
            "n" | "no" => return Ok((AskAction::Block, false)),
            "n!" | "no!" => return Ok((AskAction::Block, true)),
            "" => return Ok((AskAction::Block, false)),
            other => eprintln!("unrecognized answer {other:?}"),
        }
    }
}

/// Print request-log lines as they appear, without blocking the prompt.
fn spawn_tailer(paths: &SandboxPaths) {
    let dir = paths.proxy_log_dir();
    std::thread::spawn(move || {
        let mut current: Option<(std::path::PathBuf, LogTailer)> = None;
        loop {
            // Follow the newest plain (active) segment; rotation swaps it.
            let newest = reqlog::list_segments(&dir).ok().and_then(|segments| {
                segments
                    .into_iter()
                    .filter(|p| p.extension().is_some_and(|e| e == "jsonl"))
                    .next_back()
            });
            if let Some(path) = newest {
                let stale = current.as_ref().is_none_or(|(p, _)| *p != path);
                if stale {
                    current = Some((path.clone(), LogTailer::new(path)));
                }
            }
            if let Some((_, tailer)) = current.as_mut() {
                if let Ok(lines) = tailer.poll() {
                    for line in lines {
                        println!("{line}");
                    }
                }
            }
            std::thread::sleep(Duration::from_millis(500));
        }
    });
}
