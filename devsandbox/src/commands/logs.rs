//! Read back the proxy request log, across rotated gzip segments and the
//! active file.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use devsandbox_core::paths::SandboxPaths;
use devsandbox_proxy::reqlog::{self, ReaderStats};
use std::path::Path;

pub fn run(project_dir: &Path, since: Option<&str>) -> Result<()> {
    let since: Option<DateTime<Utc>> = since
        .map(|raw| {
            DateTime::parse_from_rfc3339(raw)
                .map(|dt| dt.with_timezone(&Utc))
                .with_context(|| format!("--since must be RFC3339, got {raw:?}"))
        })
        .transpose()?;

    let paths = SandboxPaths::for_project(project_dir);
    let dir = paths.proxy_log_dir();
    let segments = reqlog::list_segments(&dir)?;
    if segments.is_empty() {
        eprintln!("No request logs under {}", dir.display());
        return Ok(());
    }

    let mut stats = ReaderStats::default();
    for segment in segments {
        for line in reqlog::read_segment(&segment, &mut stats)? {
            if let Some(since) = since {
                // Cheap prefilter: the timestamp sits at the head of the
                // line, no need to decode the full record.
                match reqlog::timestamp_of_line(&line) {
                    Some(ts) if ts < since => continue,
                    None => continue,
                    _ => {}
                }
            }
            println!("{line}");
        }
    }
    if stats.truncated_segments > 0 {
        eprintln!(
            "note: {} segment(s) ended mid-gzip-member (partially flushed tail)",
            stats.truncated_segments
        );
    }
    Ok(())
}
