//! The request log: JSON lines, size- and date-triggered rotation, gzip of
//! rotated segments, and a reader that tolerates in-progress writes.
//!
//! A single writer thread drains a bounded queue so request forwarding
//! never waits on disk; when the queue is full the oldest record is
//! dropped, never the request.

use crate::record::RequestRecord;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

/// Active file size that triggers rotation.
pub const ROTATE_SIZE_BYTES: u64 = 8 * 1024 * 1024;

/// Queue bound between the pipeline and the writer thread.
const QUEUE_CAP: usize = 1024;

/// Lines kept for retry after a write failure.
const RETRY_RING_CAP: usize = 256;

#[derive(Debug, Default, Clone, Copy)]
pub struct WriterStats {
    pub written: u64,
    pub dropped: u64,
    pub write_failures: u64,
}

struct QueueInner {
    lines: VecDeque<String>,
    closed: bool,
    dropped: u64,
}

struct Queue {
    inner: Mutex<QueueInner>,
    cond: Condvar,
}

impl Queue {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(QueueInner {
                lines: VecDeque::new(),
                closed: false,
                dropped: 0,
            }),
            cond: Condvar::new(),
        })
    }

    /// Enqueue, dropping the oldest pending record when full.
    fn push(&self, line: String) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.closed {
            return;
        }
        if inner.lines.len() >= QUEUE_CAP {
            inner.lines.pop_front();
            inner.dropped += 1;
        }
        inner.lines.push_back(line);
        drop(inner);
        self.cond.notify_one();
    }

    fn pop(&self) -> Option<String> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if let Some(line) = inner.lines.pop_front() {
                return Some(line);
            }
            if inner.closed {
                return None;
            }
            inner = self
                .cond
                .wait(inner)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    fn close(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.closed = true;
        drop(inner);
        self.cond.notify_all();
    }

    fn dropped(&self) -> u64 {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).dropped
    }
}

/// Cloneable submission handle for the pipeline.
#[derive(Clone)]
pub struct LogSink {
    queue: Arc<Queue>,
}

impl LogSink {
    pub fn submit(&self, record: &RequestRecord) {
        match record.to_json_line() {
            Ok(line) => self.queue.push(line),
            Err(err) => tracing::warn!("request record did not serialize: {err}"),
        }
    }

    /// A sink connected to nothing, for `log_requests = false`.
    pub fn disabled() -> Self {
        let queue = Queue::new();
        queue.close();
        Self { queue }
    }
}

pub struct RequestLogWriter {
    queue: Arc<Queue>,
    handle: Option<JoinHandle<WriterStats>>,
}

impl RequestLogWriter {
    /// Start the writer thread appending under `dir`.
    pub fn start(dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&dir)
            .with_context(|| format!("create log dir {}", dir.display()))?;
        let queue = Queue::new();
        let thread_queue = Arc::clone(&queue);
        let handle = std::thread::Builder::new()
            .name("request-log".to_string())
            .spawn(move || writer_loop(&dir, &thread_queue))
            .context("spawn request log writer")?;
        Ok(Self {
            queue,
            handle: Some(handle),
        })
    }

    pub fn sink(&self) -> LogSink {
        LogSink {
            queue: Arc::clone(&self.queue),
        }
    }

    /// Flush pending lines and stop the writer.
    pub fn shutdown(mut self) -> WriterStats {
        self.queue.close();
        match self.handle.take() {
            Some(handle) => handle.join().unwrap_or_default(),
            None => WriterStats::default(),
        }
    }
}

impl Drop for RequestLogWriter {
    fn drop(&mut self) {
        self.queue.close();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

struct ActiveFile {
    file: File,
    path: PathBuf,
    size: u64,
    date: String,
}

fn writer_loop(dir: &Path, queue: &Queue) -> WriterStats {
    let mut stats = WriterStats::default();
    let mut active: Option<ActiveFile> = None;
    let mut retry: VecDeque<String> = VecDeque::new();

    while let Some(line) = queue.pop() {
        retry.push_back(line);
        while retry.len() > RETRY_RING_CAP {
            retry.pop_front();
            stats.dropped += 1;
        }
        while let Some(line) = retry.front() {
            match write_line(dir, &mut active, line) {
                Ok(()) => {
                    retry.pop_front();
                    stats.written += 1;
                }
                Err(err) => {
                    stats.write_failures += 1;
                    tracing::warn!("request log write failed, will retry: {err:#}");
                    // The line stays in the ring for the next record.
                    active = None;
                    break;
                }
            }
        }
    }
    if let Some(active) = active {
        let _ = active.file.sync_all();
    }
    stats.dropped += queue.dropped();
    stats
}

fn write_line(dir: &Path, active: &mut Option<ActiveFile>, line: &str) -> Result<()> {
    let today = Utc::now().format("%Y-%m-%d").to_string();

    if let Some(current) = active.take() {
        if current.date != today || current.size >= ROTATE_SIZE_BYTES {
            rotate(dir, current)?;
        } else {
            *active = Some(current);
        }
    }

    if active.is_none() {
        let path = dir.join(format!("requests-{today}.jsonl"));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open {}", path.display()))?;
        let size = file.metadata().map(|m| m.len()).unwrap_or(0);
        // The file may predate this process and already be past the
        // rotation bound.
        if size >= ROTATE_SIZE_BYTES {
            rotate(
                dir,
                ActiveFile {
                    file,
                    path,
                    size,
                    date: today.clone(),
                },
            )?;
            let path = dir.join(format!("requests-{today}.jsonl"));
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("open {}", path.display()))?;
            *active = Some(ActiveFile {
                file,
                path,
                size: 0,
                date: today.clone(),
            });
        } else {
            *active = Some(ActiveFile {
                file,
                path,
                size,
                date: today.clone(),
            });
        }
    }

    let current = active.as_mut().expect("active file just ensured");
    writeln!(current.file, "{line}")
        .with_context(|| format!("append {}", current.path.display()))?;
    current.size += line.len() as u64 + 1;
    Ok(())
}

/// Rename the active file with a time suffix, gzip it, drop the plain
/// copy. Rotated segments are immutable from then on.
fn rotate(dir: &Path, active: ActiveFile) -> Result<()> {
    drop(active.file);
    let suffix = Utc::now().format("%H%M%S");
    let rotated = dir.join(format!("requests-{}-{suffix}.jsonl", active.date));
    fs::rename(&active.path, &rotated)
        .with_context(|| format!("rotate {}", active.path.display()))?;

    let gz_path = rotated.with_extension("jsonl.gz");
    let mut input = File::open(&rotated)
        .with_context(|| format!("open rotated {}", rotated.display()))?;
    let out = File::create(&gz_path)
        .with_context(|| format!("create {}", gz_path.display()))?;
    let mut encoder = GzEncoder::new(out, flate2::Compression::default());
    std::io::copy(&mut input, &mut encoder)
        .with_context(|| format!("gzip {}", rotated.display()))?;
    encoder
        .finish()
        .with_context(|| format!("finish {}", gz_path.display()))?;
    fs::remove_file(&rotated)
        .with_context(|| format!("remove {}", rotated.display()))?;
    tracing::debug!("rotated request log to {}", gz_path.display());
    Ok(())
}

// ============================================================
// Reading
// ============================================================

#[derive(Debug, Default, Clone, Copy)]
pub struct ReaderStats {
    /// Gzip members that ended mid-stream (partially flushed tail); data
    /// up to the break is still returned.
    pub truncated_segments: u64,
}

/// All log segments in a directory, oldest first (rotated `.gz` segments
/// sort before the active file of the same date because their names carry
/// a time suffix; ordering across days follows the date).
pub fn list_segments(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut segments = Vec::new();
    let entries = match fs::read_dir(dir) {
        Ok(e) => e,
        Err(_) => return Ok(segments),
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with("requests-")
            && (name.ends_with(".jsonl") || name.ends_with(".jsonl.gz"))
        {
            segments.push(entry.path());
        }
    }
    segments.sort();
    Ok(segments)
}

/// Complete lines of one segment, transparently gunzipping rotated files.
pub fn read_segment(path: &Path, stats: &mut ReaderStats) -> Result<Vec<String>> {
    let bytes = if path.extension().is_some_and(|e| e == "gz") {
        read_gzip_tolerant(path, stats)?
    } else {
        fs::read(path).with_context(|| format!("read {}", path.display()))?
    };
    Ok(complete_lines(&bytes).0)
}

/// Decode possibly concatenated gzip members; a truncated tail yields the
/// bytes decoded so far plus a counter bump, not an error.
fn read_gzip_tolerant(path: &Path, stats: &mut ReaderStats) -> Result<Vec<u8>> {
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut decoder = MultiGzDecoder::new(file);
    let mut out = Vec::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        match decoder.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => out.extend_from_slice(&buf[..n]),
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                stats.truncated_segments += 1;
                tracing::debug!(
                    "gzip segment {} ends mid-member, keeping {} decoded bytes",
                    path.display(),
                    out.len()
                );
                break;
            }
            Err(err) => {
                return Err(err).with_context(|| format!("gunzip {}", path.display()))
            }
        }
    }
    Ok(out)
}

/// Split into complete lines; a trailing partial line (in-progress write)
/// is excluded. Returns the lines and the byte offset consumed.
fn complete_lines(bytes: &[u8]) -> (Vec<String>, u64) {
    let mut lines = Vec::new();
    let mut consumed = 0usize;
    let mut start = 0usize;
    for (i, b) in bytes.iter().enumerate() {
        if *b == b'\n' {
            let line = String::from_utf8_lossy(&bytes[start..i]).into_owned();
            if !line.is_empty() {
                lines.push(line);
            }
            start = i + 1;
            consumed = start;
        }
    }
    (lines, consumed as u64)
}

/// Incremental tail over the active file: each poll returns the complete
/// lines appended since the last one and remembers the offset.
pub struct LogTailer {
    path: PathBuf,
    offset: u64,
}

impl LogTailer {
    pub fn new(path: PathBuf) -> Self {
        Self { path, offset: 0 }
    }

    pub fn from_offset(path: PathBuf, offset: u64) -> Self {
        Self { path, offset }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn poll(&mut self) -> Result<Vec<String>> {
        let mut file = match File::open(&self.path) {
            Ok(f) => f,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Vec::new())
            }
            Err(err) => {
                return Err(err).with_context(|| format!("open {}", self.path.display()))
            }
        };
        let len = file.metadata().map(|m| m.len()).unwrap_or(0);
        if len < self.offset {
            // The file was rotated out from under us; start over.
            self.offset = 0;
        }
        file.seek(SeekFrom::Start(self.offset))
            .with_context(|| format!("seek {}", self.path.display()))?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)
            .with_context(|| format!("read {}", self.path.display()))?;
        let (lines, consumed) = complete_lines(&bytes);
        self.offset += consumed;
        Ok(lines)
    }
}

/// Parse the RFC3339 timestamp from the head of a record line without
/// decoding the whole record.
pub fn timestamp_of_line(line: &str) -> Option<DateTime<Utc>> {
    let head = &line[..line.len().min(128)];
    let idx = head.find("\"timestamp\":\"")?;
    let rest = &line[idx + "\"timestamp\":\"".len()..];
    let end = rest.find('"')?;
    DateTime::parse_from_rfc3339(&rest[..end])
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
