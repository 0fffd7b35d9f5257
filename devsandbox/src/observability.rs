//! Tracing init and the internal error log.
//!
//! DEVSANDBOX_LOG_LEVEL sets the filter, DEVSANDBOX_LOG_JSON switches to
//! JSON lines, DEVSANDBOX_QUIET=1 raises the floor to WARN.

use chrono::Utc;
use serde_json::json;
use std::env;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::{prelude::*, EnvFilter};

static INTERNAL_LOG_PATH: Mutex<Option<PathBuf>> = Mutex::new(None);

/// Initialize tracing. Call once at process startup.
pub fn init_tracing() {
    let level = if is_quiet() {
        "devsandbox=warn".to_string()
    } else {
        env::var("DEVSANDBOX_LOG_LEVEL").unwrap_or_else(|_| "devsandbox=info".to_string())
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let json = env::var("DEVSANDBOX_LOG_JSON")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    let _ = if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_writer(std::io::stderr),
            )
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_writer(std::io::stderr),
            )
            .try_init()
    };
}

fn is_quiet() -> bool {
    env::var("DEVSANDBOX_QUIET")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Point the internal error log at the sandbox's internal log dir.
pub fn set_internal_log_dir(dir: &Path) {
    let mut guard = INTERNAL_LOG_PATH.lock().unwrap_or_else(|e| e.into_inner());
    *guard = Some(dir.join("logging-errors.log"));
}

/// Append an internal error record (proxy-side failures that must not
/// interrupt request handling).
pub fn internal_error(component: &str, message: &str) {
    tracing::warn!(component = %component, "{message}");
    let path = {
        let guard = INTERNAL_LOG_PATH.lock().unwrap_or_else(|e| e.into_inner());
        guard.clone()
    };
    let Some(path) = path else { return };
    let record = json!({
        "ts": Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        "component": component,
        "message": message,
    });
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    if let Ok(mut f) = OpenOptions::new().create(true).append(true).open(&path) {
        if let Ok(line) = serde_json::to_string(&record) {
            let _ = writeln!(f, "{line}");
        }
    }
}
