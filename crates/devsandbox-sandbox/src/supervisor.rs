//! Session lifecycle: registered teardown hooks run exactly once, on every
//! exit path (normal return, error, signal, or panic via the guard).

use anyhow::{Context, Result};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

type Hook = Box<dyn FnOnce() + Send>;

/// Collects teardown work as the session brings pieces up, then runs it in
/// reverse order when the session ends for any reason.
pub struct Supervisor {
    hooks: Mutex<Vec<(String, Hook)>>,
    down: AtomicBool,
}

impl Supervisor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            hooks: Mutex::new(Vec::new()),
            down: AtomicBool::new(false),
        })
    }

    /// Register a hook; hooks run LIFO so dependents stop before their
    /// dependencies.
    pub fn on_teardown(&self, label: impl Into<String>, hook: impl FnOnce() + Send + 'static) {
        if self.down.load(Ordering::SeqCst) {
            // Too late to register: run immediately so nothing leaks.
            hook();
            return;
        }
        let mut hooks = self.hooks.lock().unwrap_or_else(|e| e.into_inner());
        hooks.push((label.into(), Box::new(hook)));
    }

    /// Run all hooks once. Subsequent calls are no-ops.
    pub fn teardown(&self) {
        if self.down.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut hooks = {
            let mut guard = self.hooks.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *guard)
        };
        while let Some((label, hook)) = hooks.pop() {
            tracing::debug!("teardown: {label}");
            hook();
        }
    }

    pub fn is_down(&self) -> bool {
        self.down.load(Ordering::SeqCst)
    }

    /// Funnel SIGINT/SIGTERM into teardown. The handler thread lives for
    /// the process; it exits with it.
    pub fn install_signal_handlers(self: &Arc<Self>) -> Result<()> {
        let mut signals =
            Signals::new([SIGINT, SIGTERM]).context("install signal handlers")?;
        let supervisor = Arc::clone(self);
        thread::Builder::new()
            .name("signal-handler".to_string())
            .spawn(move || {
                for signal in signals.forever() {
                    tracing::info!("received signal {signal}, tearing down");
                    supervisor.teardown();
                    break;
                }
            })
            .context("spawn signal handler thread")?;
        Ok(())
    }
}

/// Drop guard: ties teardown to scope exit, panics included.
pub struct TeardownGuard(Arc<Supervisor>);

impl TeardownGuard {
    pub fn new(supervisor: Arc<Supervisor>) -> Self {
        Self(supervisor)
    }
}

impl Drop for TeardownGuard {
    fn drop(&mut self) {
        self.0.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_teardown_runs_hooks_lifo_once() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let supervisor = Supervisor::new();
        for i in 0..3 {
            let order = Arc::clone(&order);
            supervisor.on_teardown(format!("hook-{i}"), move || {
                order.lock().expect("order lock").push(i);
            });
        }
        supervisor.teardown();
        supervisor.teardown();
        assert_eq!(*order.lock().expect("order lock"), vec![2, 1, 0]);
    }

    #[test]
    fn test_late_registration_runs_immediately() {
        let ran = Arc::new(AtomicUsize::new(0));
        let supervisor = Supervisor::new();
        supervisor.teardown();
        let ran2 = Arc::clone(&ran);
        supervisor.on_teardown("late", move || {
            ran2.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_guard_tears_down_on_drop() {
        let supervisor = Supervisor::new();
        {
            let _guard = TeardownGuard::new(Arc::clone(&supervisor));
        }
        assert!(supervisor.is_down());
    }
}
