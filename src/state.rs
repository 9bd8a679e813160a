/*!
 * Shared run state
 *
 * The single object mutated by the tick loop and read by callbacks and
 * progress consumers. Counters are atomics, the chunk queue is an MPMC
 * channel, and the active-job map supports atomic remove-and-return so a
 * reaped job is processed exactly once.
 */

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use crossbeam_channel::{unbounded, Receiver, Sender};
use dashmap::DashMap;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::copier::launcher::RunningCopier;
use crate::planner::Chunk;

/// Run phase; transitions are forward-only
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Phase {
    Idle = 0,
    Scanning = 1,
    Replicating = 2,
    Complete = 3,
    Stopped = 4,
}

impl Phase {
    fn from_u8(value: u8) -> Phase {
        match value {
            0 => Phase::Idle,
            1 => Phase::Scanning,
            2 => Phase::Replicating,
            3 => Phase::Complete,
            _ => Phase::Stopped,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Idle => "Idle",
            Phase::Scanning => "Scanning",
            Phase::Replicating => "Replicating",
            Phase::Complete => "Complete",
            Phase::Stopped => "Stopped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Complete | Phase::Stopped)
    }
}

/// An active copier bound to its chunk, owned by the active-job map
pub struct Job {
    pub chunk: Chunk,
    pub handle: Box<dyn RunningCopier>,
    pub started_at: DateTime<Utc>,
    pub dry_run: bool,
}

/// Summary of one finished profile
#[derive(Debug, Clone)]
pub struct ProfileResult {
    pub profile_name: String,
    pub completed_chunks: usize,
    pub failed_chunks: usize,
    pub skipped_chunks: u64,
    pub bytes_copied: u64,
    pub files_copied: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ProfileResult {
    pub fn success(&self) -> bool {
        self.failed_chunks == 0
    }
}

pub struct SharedState {
    pub session_id: Uuid,
    phase: AtomicU8,

    chunk_tx: Sender<Chunk>,
    chunk_rx: Receiver<Chunk>,

    /// Keyed by child pid; `remove` is the atomic ownership transfer.
    pub active_jobs: DashMap<u32, Job>,

    completed: Mutex<Vec<Chunk>>,
    failed: Mutex<Vec<Chunk>>,
    profile_results: Mutex<Vec<ProfileResult>>,
    errors: Mutex<Vec<String>>,

    completed_count: AtomicU64,
    skipped_count: AtomicU64,
    skipped_bytes: AtomicU64,
    completed_chunk_bytes: AtomicU64,
    completed_chunk_files: AtomicU64,
    profile_start_files: AtomicU64,
    profile_skipped_count: AtomicU64,
    profile_skipped_bytes: AtomicU64,
    profile_total_chunks: AtomicU64,

    stop_requested: AtomicBool,
    pause_requested: AtomicBool,
    any_failures: AtomicBool,

    profile_index: AtomicUsize,
    pub started_at: DateTime<Utc>,
}

impl SharedState {
    pub fn new() -> Arc<Self> {
        let (chunk_tx, chunk_rx) = unbounded();
        Arc::new(Self {
            session_id: Uuid::new_v4(),
            phase: AtomicU8::new(Phase::Idle as u8),
            chunk_tx,
            chunk_rx,
            active_jobs: DashMap::new(),
            completed: Mutex::new(Vec::new()),
            failed: Mutex::new(Vec::new()),
            profile_results: Mutex::new(Vec::new()),
            errors: Mutex::new(Vec::new()),
            completed_count: AtomicU64::new(0),
            skipped_count: AtomicU64::new(0),
            skipped_bytes: AtomicU64::new(0),
            completed_chunk_bytes: AtomicU64::new(0),
            completed_chunk_files: AtomicU64::new(0),
            profile_start_files: AtomicU64::new(0),
            profile_skipped_count: AtomicU64::new(0),
            profile_skipped_bytes: AtomicU64::new(0),
            profile_total_chunks: AtomicU64::new(0),
            stop_requested: AtomicBool::new(false),
            pause_requested: AtomicBool::new(false),
            any_failures: AtomicBool::new(false),
            profile_index: AtomicUsize::new(0),
            started_at: Utc::now(),
        })
    }

    // Phase ------------------------------------------------------------

    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    /// Advance the phase. Backward transitions are ignored, so a late
    /// writer can never resurrect a stopped run.
    pub fn advance_phase(&self, next: Phase) -> bool {
        let mut current = self.phase.load(Ordering::Acquire);
        loop {
            if next as u8 <= current {
                return false;
            }
            match self.phase.compare_exchange_weak(
                current,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    // Chunk queue ------------------------------------------------------

    pub fn enqueue_chunk(&self, chunk: Chunk) {
        // The receiver half lives as long as self; send cannot fail.
        let _ = self.chunk_tx.send(chunk);
    }

    pub fn dequeue_chunk(&self) -> Option<Chunk> {
        self.chunk_rx.try_recv().ok()
    }

    pub fn queued_chunks(&self) -> usize {
        self.chunk_rx.len()
    }

    /// Drain the chunk queue in place (profile teardown).
    pub fn drain_chunk_queue(&self) {
        while self.chunk_rx.try_recv().is_ok() {}
    }

    // Result queues ----------------------------------------------------

    pub fn push_completed(&self, chunk: Chunk) {
        self.completed.lock().push(chunk);
    }

    pub fn completed_snapshot(&self) -> Vec<Chunk> {
        self.completed.lock().clone()
    }

    pub fn completed_len(&self) -> usize {
        self.completed.lock().len()
    }

    /// Empty the completed queue in place (profile teardown).
    pub fn drain_completed(&self) -> Vec<Chunk> {
        std::mem::take(&mut *self.completed.lock())
    }

    pub fn push_failed(&self, chunk: Chunk) {
        self.any_failures.store(true, Ordering::Release);
        self.failed.lock().push(chunk);
    }

    pub fn failed_snapshot(&self) -> Vec<Chunk> {
        self.failed.lock().clone()
    }

    pub fn failed_len(&self) -> usize {
        self.failed.lock().len()
    }

    pub fn drain_failed(&self) -> Vec<Chunk> {
        std::mem::take(&mut *self.failed.lock())
    }

    pub fn push_profile_result(&self, result: ProfileResult) {
        self.profile_results.lock().push(result);
    }

    pub fn profile_results(&self) -> Vec<ProfileResult> {
        self.profile_results.lock().clone()
    }

    pub fn push_error(&self, message: String) {
        self.errors.lock().push(message);
    }

    /// Hand pending error messages to a UI consumer.
    pub fn drain_errors(&self) -> Vec<String> {
        std::mem::take(&mut *self.errors.lock())
    }

    // Counters ---------------------------------------------------------

    pub fn record_completed_chunk(&self, estimated_bytes: u64, files_copied: u64) {
        self.completed_chunk_bytes
            .fetch_add(estimated_bytes, Ordering::AcqRel);
        self.completed_chunk_files
            .fetch_add(files_copied, Ordering::AcqRel);
        self.completed_count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn record_failed_chunk(&self) {
        self.completed_count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn record_skipped_chunk(&self, estimated_bytes: u64) {
        self.completed_count.fetch_add(1, Ordering::AcqRel);
        self.skipped_count.fetch_add(1, Ordering::AcqRel);
        self.skipped_bytes.fetch_add(estimated_bytes, Ordering::AcqRel);
        self.completed_chunk_bytes
            .fetch_add(estimated_bytes, Ordering::AcqRel);
        self.profile_skipped_count.fetch_add(1, Ordering::AcqRel);
        self.profile_skipped_bytes
            .fetch_add(estimated_bytes, Ordering::AcqRel);
    }

    pub fn completed_count(&self) -> u64 {
        self.completed_count.load(Ordering::Acquire)
    }

    pub fn skipped_count(&self) -> u64 {
        self.skipped_count.load(Ordering::Acquire)
    }

    pub fn skipped_bytes(&self) -> u64 {
        self.skipped_bytes.load(Ordering::Acquire)
    }

    pub fn completed_chunk_bytes(&self) -> u64 {
        self.completed_chunk_bytes.load(Ordering::Acquire)
    }

    pub fn completed_chunk_files(&self) -> u64 {
        self.completed_chunk_files.load(Ordering::Acquire)
    }

    pub fn any_failures(&self) -> bool {
        self.any_failures.load(Ordering::Acquire)
    }

    // Per-profile bookkeeping ------------------------------------------

    /// Reset per-profile accumulators as a profile begins.
    pub fn begin_profile(&self, total_chunks: u64) {
        self.profile_start_files
            .store(self.completed_chunk_files(), Ordering::Release);
        self.profile_skipped_count.store(0, Ordering::Release);
        self.profile_skipped_bytes.store(0, Ordering::Release);
        self.profile_total_chunks.store(total_chunks, Ordering::Release);
    }

    pub fn profile_start_files(&self) -> u64 {
        self.profile_start_files.load(Ordering::Acquire)
    }

    pub fn profile_skipped_count(&self) -> u64 {
        self.profile_skipped_count.load(Ordering::Acquire)
    }

    pub fn profile_skipped_bytes(&self) -> u64 {
        self.profile_skipped_bytes.load(Ordering::Acquire)
    }

    pub fn profile_total_chunks(&self) -> u64 {
        self.profile_total_chunks.load(Ordering::Acquire)
    }

    pub fn profile_index(&self) -> usize {
        self.profile_index.load(Ordering::Acquire)
    }

    pub fn set_profile_index(&self, index: usize) {
        self.profile_index.store(index, Ordering::Release);
    }

    // Flags ------------------------------------------------------------

    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::Release);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    pub fn request_pause(&self) {
        self.pause_requested.store(true, Ordering::Release);
    }

    pub fn request_resume(&self) {
        self.pause_requested.store(false, Ordering::Release);
    }

    pub fn pause_requested(&self) -> bool {
        self.pause_requested.load(Ordering::Acquire)
    }

    /// True when the chunk is nowhere: not queued, not active. Combined
    /// with an empty reap this is the profile-complete condition.
    pub fn profile_drained(&self) -> bool {
        self.queued_chunks() == 0 && self.active_jobs.is_empty()
    }
}

/// Read-only progress snapshot handed to the `on_progress` callback
#[derive(Debug, Clone)]
pub struct ProgressSnapshot {
    pub session_id: Uuid,
    pub phase: Phase,
    pub profile_name: Option<String>,
    pub profile_index: usize,
    pub chunks_completed: u64,
    pub chunks_total: u64,
    pub chunks_pending: u64,
    pub chunks_failed: u64,
    pub active_jobs: usize,
    pub bytes_completed: u64,
    /// Live bytes from in-flight jobs' progress buffers
    pub bytes_in_flight: u64,
    pub eta_seconds: Option<u64>,
}
