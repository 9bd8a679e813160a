/*!
 * Per-job progress buffer
 *
 * One buffer per running copier. The async stdout reader is the only
 * writer; the orchestrator's progress path and the final log parse read
 * concurrently. Counters are atomics so readers never block the reader
 * thread; only the current-file name sits under a small mutex.
 */

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::LazyLock;

use parking_lot::Mutex;
use regex::Regex;

/// `New File   123456   path\to\file` style file headers
static FILE_HEADER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(New File|Newer|Older|Changed)\s+(\d+)\s+(.+)$").unwrap());

/// `  42.7%` style progress lines
static PERCENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(\d+(?:\.\d+)?)\s*%").unwrap());

#[derive(Debug, Default)]
pub struct ProgressBuffer {
    lines: Mutex<Vec<String>>,
    completed_files_bytes: AtomicU64,
    current_file_size: AtomicU64,
    current_file_bytes: AtomicU64,
    files_copied: AtomicU64,
    current_file: Mutex<Option<String>>,
}

impl ProgressBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ingest one stdout line: update counters, then retain the raw line.
    pub fn ingest_line(&self, line: &str) {
        if let Some(caps) = FILE_HEADER.captures(line) {
            self.finalize_current_file();
            let size = caps[2].parse::<u64>().unwrap_or(0);
            self.current_file_size.store(size, Ordering::Release);
            self.current_file_bytes.store(0, Ordering::Release);
            *self.current_file.lock() = Some(caps[3].trim().to_string());
        } else if let Some(caps) = PERCENT.captures(line) {
            let pct = caps[1].parse::<f64>().unwrap_or(0.0).clamp(0.0, 100.0);
            let size = self.current_file_size.load(Ordering::Acquire);
            let bytes = (size as f64 * pct / 100.0) as u64;
            self.current_file_bytes.store(bytes, Ordering::Release);
        }

        self.lines.lock().push(line.to_string());
    }

    /// A new file header means the previous file finished.
    fn finalize_current_file(&self) {
        let mut current = self.current_file.lock();
        if current.take().is_some() {
            let size = self.current_file_size.swap(0, Ordering::AcqRel);
            self.current_file_bytes.store(0, Ordering::Release);
            self.completed_files_bytes.fetch_add(size, Ordering::AcqRel);
            self.files_copied.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Bytes transferred so far: whole completed files plus the tracked
    /// portion of the in-flight file.
    pub fn bytes_copied(&self) -> u64 {
        self.completed_files_bytes.load(Ordering::Acquire)
            + self.current_file_bytes.load(Ordering::Acquire)
    }

    pub fn files_copied(&self) -> u64 {
        self.files_copied.load(Ordering::Acquire)
    }

    pub fn current_file(&self) -> Option<String> {
        self.current_file.lock().clone()
    }

    pub fn line_count(&self) -> usize {
        self.lines.lock().len()
    }

    /// Snapshot of every line seen so far.
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }
}
