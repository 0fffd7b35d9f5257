//! The ask channel: JSON-line request/decision protocol between the proxy
//! and an interactive monitor over a Unix socket.
//!
//! Either end may start first. Whoever finds no live socket binds it and
//! waits; the other side connects as a client. Message direction is fixed
//! regardless: the proxy sends [`AskRequest`]s, the monitor answers with
//! [`AskResponse`]s matched by id. A pending ask falls through to Block on
//! timeout or monitor disconnect, exactly once.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AskRequest {
    pub id: String,
    pub method: String,
    pub host: String,
    pub path: String,
    pub headers: BTreeMap<String, String>,
    /// Truncated preview of the request body.
    pub body: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AskAction {
    Allow,
    Block,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AskResponse {
    pub id: String,
    pub action: AskAction,
    pub remember: bool,
}

/// Resolution of one ask, as seen by the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AskOutcome {
    Decided { action: AskAction, remember: bool },
    /// No decision within the deadline (or no monitor ever answered).
    TimedOut,
    /// The monitor vanished mid-request.
    Disconnected,
}

struct PendingEntry {
    request: AskRequest,
    tx: SyncSender<AskResponse>,
}

/// Proxy-side endpoint.
pub struct AskChannel {
    pending: Arc<Mutex<HashMap<String, PendingEntry>>>,
    conn: Arc<Mutex<Option<UnixStream>>>,
    running: Arc<AtomicBool>,
    socket_path: PathBuf,
    owns_socket: bool,
}

impl AskChannel {
    /// Connect to a monitor-owned socket, or bind and serve one.
    pub fn open(socket_path: &Path) -> Result<Arc<Self>> {
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }

        let pending = Arc::new(Mutex::new(HashMap::new()));
        let conn = Arc::new(Mutex::new(None));
        let running = Arc::new(AtomicBool::new(true));

        let channel;
        match UnixStream::connect(socket_path) {
            Ok(stream) => {
                // A monitor got here first and owns the socket.
                channel = Arc::new(Self {
                    pending,
                    conn,
                    running,
                    socket_path: socket_path.to_path_buf(),
                    owns_socket: false,
                });
                channel.adopt_stream(stream)?;
            }
            Err(_) => {
                // Dead or absent socket: we serve.
                let _ = std::fs::remove_file(socket_path);
                let listener = UnixListener::bind(socket_path)
                    .with_context(|| format!("bind {}", socket_path.display()))?;
                listener
                    .set_nonblocking(true)
                    .context("ask listener nonblocking")?;
                channel = Arc::new(Self {
                    pending,
                    conn,
                    running,
                    socket_path: socket_path.to_path_buf(),
                    owns_socket: true,
                });
                channel.spawn_accept_loop(listener)?;
            }
        }
        Ok(channel)
    }

    /// Refer a request to the monitor and wait for a decision.
    ///
    /// `timeout` of zero resolves to [`AskOutcome::TimedOut`] immediately.
    pub fn ask(&self, request: AskRequest, timeout: Duration) -> AskOutcome {
        if timeout.is_zero() {
            return AskOutcome::TimedOut;
        }
        let id = request.id.clone();
        let (tx, rx) = sync_channel(1);
        {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending.insert(
                id.clone(),
                PendingEntry {
                    request: request.clone(),
                    tx,
                },
            );
        }
        self.send_request(&request);

        let outcome = match rx.recv_timeout(timeout) {
            Ok(response) => AskOutcome::Decided {
                action: response.action,
                remember: response.remember,
            },
            Err(RecvTimeoutError::Timeout) => AskOutcome::TimedOut,
            Err(RecvTimeoutError::Disconnected) => AskOutcome::Disconnected,
        };
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.remove(&id);
        outcome
    }

    pub fn has_monitor(&self) -> bool {
        self.conn
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Stop accepting monitors; pending asks resolve to Block.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.fail_pending();
        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(stream) = conn.take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        if self.owns_socket {
            let _ = std::fs::remove_file(&self.socket_path);
        }
    }

    fn send_request(&self, request: &AskRequest) {
        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(stream) = conn.as_mut() {
            if write_json_line(stream, request).is_err() {
                tracing::debug!("ask channel write failed, dropping monitor link");
                *conn = None;
            }
        }
        // No monitor yet: the request stays pending and is replayed when
        // one connects.
    }

    fn adopt_stream(self: &Arc<Self>, stream: UnixStream) -> Result<()> {
        let read_half = stream.try_clone().context("clone ask stream")?;
        {
            let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
            *conn = Some(stream);
        }
        self.replay_pending();
        let channel = Arc::clone(self);
        thread::Builder::new()
            .name("ask-reader".to_string())
            .spawn(move || channel.reader_loop(read_half))
            .context("spawn ask reader")?;
        Ok(())
    }

    fn spawn_accept_loop(self: &Arc<Self>, listener: UnixListener) -> Result<()> {
        let channel = Arc::clone(self);
        thread::Builder::new()
            .name("ask-accept".to_string())
            .spawn(move || {
                while channel.running.load(Ordering::SeqCst) {
                    match listener.accept() {
                        Ok((stream, _)) => {
                            if stream.set_nonblocking(false).is_err() {
                                continue;
                            }
                            let read_half = match stream.try_clone() {
                                Ok(s) => s,
                                Err(_) => continue,
                            };
                            {
                                let mut conn = channel
                                    .conn
                                    .lock()
                                    .unwrap_or_else(|e| e.into_inner());
                                *conn = Some(stream);
                            }
                            tracing::info!("ask monitor connected");
                            channel.replay_pending();
                            // One monitor at a time; serve it inline.
                            channel.reader_loop(read_half);
                        }
                        Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                            thread::sleep(Duration::from_millis(50));
                        }
                        Err(e) => {
                            tracing::warn!("ask channel accept error: {e}");
                            break;
                        }
                    }
                }
            })
            .context("spawn ask accept loop")?;
        Ok(())
    }

    fn reader_loop(&self, stream: UnixStream) {
        let reader = BufReader::new(stream);
        for line in reader.lines() {
            let line = match line {
                Ok(line) => line,
                Err(_) => break,
            };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<AskResponse>(&line) {
                Ok(response) => self.dispatch(response),
                Err(err) => {
                    tracing::warn!("ask channel: undecodable response line: {err}");
                }
            }
        }
        tracing::info!("ask monitor disconnected");
        {
            let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
            *conn = None;
        }
        // Whatever was pending falls through to Block; the proxy keeps
        // accepting new monitors.
        self.fail_pending();
    }

    fn dispatch(&self, response: AskResponse) {
        let entry = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending.remove(&response.id)
        };
        match entry {
            Some(entry) => {
                let _ = entry.tx.send(response);
            }
            None => {
                tracing::debug!(
                    "ask response for unknown id {} (timed out already?)",
                    response.id
                );
            }
        }
    }

    fn replay_pending(&self) {
        let requests: Vec<AskRequest> = {
            let pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending.values().map(|e| e.request.clone()).collect()
        };
        for request in requests {
            self.send_request(&request);
        }
    }

    fn fail_pending(&self) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        // Dropping the senders resolves every waiting ask to Disconnected.
        pending.clear();
    }
}

fn write_json_line<T: Serialize>(stream: &mut UnixStream, value: &T) -> Result<()> {
    let mut line = serde_json::to_string(value).context("serialize ask message")?;
    line.push('\n');
    stream
        .write_all(line.as_bytes())
        .context("write ask message")?;
    stream.flush().context("flush ask message")
}

// ============================================================
// Monitor side
// ============================================================

/// Lock file guaranteeing a single monitor binds the socket.
pub struct AskLock {
    path: PathBuf,
}

impl AskLock {
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        loop {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(path)
            {
                Ok(mut file) => {
                    let _ = write!(file, "{}", std::process::id());
                    return Ok(Self {
                        path: path.to_path_buf(),
                    });
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    let holder = std::fs::read_to_string(path)
                        .ok()
                        .and_then(|s| s.trim().parse::<u32>().ok());
                    if let Some(pid) = holder {
                        if process_alive(pid) {
                            anyhow::bail!(
                                "another monitor (pid {pid}) holds {}",
                                path.display()
                            );
                        }
                    }
                    // Stale lock from a dead process: reclaim.
                    let _ = std::fs::remove_file(path);
                }
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("create lock {}", path.display()))
                }
            }
        }
    }
}

impl Drop for AskLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

#[cfg(not(target_os = "linux"))]
fn process_alive(_pid: u32) -> bool {
    true
}

/// Monitor-side link: connect to a proxy-owned socket, or (under the
/// lock) bind and wait for the proxy.
pub struct MonitorLink {
    reader: BufReader<UnixStream>,
    writer: UnixStream,
    _lock: Option<AskLock>,
}

impl MonitorLink {
    pub fn open(socket_path: &Path, lock_path: &Path) -> Result<Self> {
        match UnixStream::connect(socket_path) {
            Ok(stream) => Self::from_stream(stream, None),
            Err(_) => {
                let lock = AskLock::acquire(lock_path)?;
                let _ = std::fs::remove_file(socket_path);
                let listener = UnixListener::bind(socket_path)
                    .with_context(|| format!("bind {}", socket_path.display()))?;
                eprintln!("Waiting for a sandbox to start asking...");
                let (stream, _) = listener.accept().context("accept proxy link")?;
                Self::from_stream(stream, Some(lock))
            }
        }
    }

    fn from_stream(stream: UnixStream, lock: Option<AskLock>) -> Result<Self> {
        let writer = stream.try_clone().context("clone monitor stream")?;
        Ok(Self {
            reader: BufReader::new(stream),
            writer,
            _lock: lock,
        })
    }

    /// Next request from the proxy; `None` on clean disconnect.
    pub fn recv(&mut self) -> Result<Option<AskRequest>> {
        loop {
            let mut line = String::new();
            let n = self
                .reader
                .read_line(&mut line)
                .context("read ask request")?;
            if n == 0 {
                return Ok(None);
            }
            if line.trim().is_empty() {
                continue;
            }
            let request: AskRequest =
                serde_json::from_str(line.trim()).context("decode ask request")?;
            return Ok(Some(request));
        }
    }

    pub fn send(&mut self, response: &AskResponse) -> Result<()> {
        write_json_line(&mut self.writer, response)
    }
}
