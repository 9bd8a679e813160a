/*!
 * Replication orchestrator
 *
 * Owns the tick loop that drives a whole run: reap exited copiers, decide
 * retry versus terminal failure, dispatch new jobs up to the concurrency
 * limit with the current bandwidth share, checkpoint progress, and advance
 * from profile to profile. The tick mutates shared state and must not be
 * re-entered; the host serializes calls (one timer thread, 500 ms cadence).
 */

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::config::{is_unc_path, Config, CopyOptions, MismatchSeverity, Profile};
use crate::copier::args::compute_ipg;
use crate::copier::exit_code::{interpret_exit_code, ExitAnalysis, Severity};
use crate::copier::launcher::{JobLauncher, LaunchRequest};
use crate::copier::log_stats::{read_log_lenient, LogStats};
use crate::error::{RobocurseError, Result};
use crate::health::{HealthStatus, HealthWriter};
use crate::mount::{MountCoordinator, MountRecord};
use crate::planner::{Chunk, ChunkIdGen, ChunkPlanner, ChunkStatus};
use crate::report::FailedFilesReport;
use crate::scanner::DirectoryProfiler;
use crate::state::{Job, Phase, ProfileResult, ProgressSnapshot, SharedState};
use crate::vss::{ActiveSnapshot, VssCoordinator};

/// Default host tick cadence.
pub const TICK_INTERVAL: Duration = Duration::from_millis(500);

/// How long stop-all waits for each killed copier to exit.
const STOP_WAIT: Duration = Duration::from_secs(5);

/// Per-run behavior switches from the CLI
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub ignore_checkpoint: bool,
    pub dry_run: bool,
    /// Skip startup orphan recovery (used by tooling that owns cleanup)
    pub skip_init: bool,
    /// Non-interactive session: UNC paths demand explicit credentials
    pub headless: bool,
}

/// Typed events for external sinks (SIEM forwarding lives outside)
#[derive(Debug, Clone)]
pub enum RunEvent {
    SessionStart { session_id: String },
    ProfileStart { profile: String },
    ChunkFailed { chunk_id: u64, message: String },
    ProfileComplete { profile: String, success: bool },
    SessionEnd { success: bool },
}

type ChunkCallback = Box<dyn Fn(&Chunk, &ExitAnalysis) + Send + Sync>;
type ProfileCallback = Box<dyn Fn(&ProfileResult) + Send + Sync>;
type ProgressCallback = Box<dyn Fn(&ProgressSnapshot) + Send + Sync>;
type EventCallback = Box<dyn Fn(&RunEvent) + Send + Sync>;

#[derive(Default)]
pub struct Callbacks {
    pub on_chunk_complete: Option<ChunkCallback>,
    pub on_profile_complete: Option<ProfileCallback>,
    pub on_progress: Option<ProgressCallback>,
    pub on_event: Option<EventCallback>,
}

pub struct Orchestrator {
    state: Arc<SharedState>,
    launcher: Box<dyn JobLauncher>,
    config: Config,
    opts: RunOptions,
    callbacks: Callbacks,

    vss: Option<VssCoordinator>,
    mounts: Option<MountCoordinator>,

    profiler: DirectoryProfiler,
    ids: ChunkIdGen,
    checkpoint_store: CheckpointStore,
    resume: Option<Checkpoint>,
    /// Cumulative sources for checkpoint saves, seeded from the resume file
    completed_sources: Vec<String>,
    health: HealthWriter,
    report: FailedFilesReport,
    jobs_dir: PathBuf,

    current_profile_name: Option<String>,
    current_options: CopyOptions,
    current_mismatch: MismatchSeverity,
    current_snapshot: Option<ActiveSnapshot>,
    current_mounts: Vec<MountRecord>,
    profile_started_at: DateTime<Utc>,
    profile_total_bytes: u64,

    finished: bool,
}

impl Orchestrator {
    pub fn new(config: Config, launcher: Box<dyn JobLauncher>, opts: RunOptions) -> Result<Self> {
        config.validate()?;
        let state = SharedState::new();
        let state_dir = config.state_dir();
        let session = state.session_id.to_string();
        let health_interval = Duration::from_secs(config.settings.health_interval_secs);

        Ok(Self {
            checkpoint_store: CheckpointStore::new(&state_dir),
            health: HealthWriter::new(&state_dir, health_interval),
            report: FailedFilesReport::new(&state_dir, &session),
            jobs_dir: state_dir.join("Jobs"),
            state,
            launcher,
            config,
            opts,
            callbacks: Callbacks::default(),
            vss: None,
            mounts: None,
            profiler: DirectoryProfiler::new(),
            ids: ChunkIdGen::new(),
            resume: None,
            completed_sources: Vec::new(),
            current_profile_name: None,
            current_options: CopyOptions::default(),
            current_mismatch: MismatchSeverity::Warning,
            current_snapshot: None,
            current_mounts: Vec::new(),
            profile_started_at: Utc::now(),
            profile_total_bytes: 0,
            finished: false,
        })
    }

    pub fn with_callbacks(mut self, callbacks: Callbacks) -> Self {
        self.callbacks = callbacks;
        self
    }

    pub fn with_vss(mut self, vss: VssCoordinator) -> Self {
        self.vss = Some(vss);
        self
    }

    pub fn with_mounts(mut self, mounts: MountCoordinator) -> Self {
        self.mounts = Some(mounts);
        self
    }

    pub fn state(&self) -> Arc<SharedState> {
        self.state.clone()
    }

    pub fn request_stop(&self) {
        self.state.request_stop();
    }

    pub fn request_pause(&self) {
        self.state.request_pause();
    }

    pub fn request_resume(&self) {
        self.state.request_resume();
    }

    /// Prepare the run and start the first profile.
    pub fn start(&mut self) -> Result<()> {
        self.emit(RunEvent::SessionStart {
            session_id: self.state.session_id.to_string(),
        });

        if !self.opts.skip_init {
            if let Some(vss) = &self.vss {
                let recovered = vss.recover_orphans();
                if recovered > 0 {
                    info!(recovered, "cleaned up orphaned snapshots from a prior run");
                }
            }
            if let Some(mounts) = &self.mounts {
                let recovered = mounts.recover_orphans();
                if recovered > 0 {
                    info!(recovered, "cleaned up orphaned mounts from a prior run");
                }
            }
        }

        if !self.opts.ignore_checkpoint {
            self.resume = self.checkpoint_store.load();
            if let Some(checkpoint) = &self.resume {
                info!(
                    profile = %checkpoint.profile_name,
                    completed = checkpoint.completed_sources.len(),
                    "resuming from checkpoint"
                );
                self.completed_sources = checkpoint.completed_sources.clone();
            }
        }

        self.state.advance_phase(Phase::Scanning);

        let first_index = self
            .resume
            .as_ref()
            .map(|checkpoint| checkpoint.profile_index.min(self.config.profiles.len() - 1))
            .unwrap_or(0);
        self.state.set_profile_index(first_index);
        self.start_profile_or_skip(first_index)?;

        self.state.advance_phase(Phase::Replicating);
        self.write_health(true);
        Ok(())
    }

    /// One pass of the reap-then-dispatch loop.
    pub fn tick(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }

        if self.state.stop_requested() {
            self.stop_all();
            return Ok(());
        }

        self.reap()?;

        if self.state.pause_requested() {
            self.update_progress();
            return Ok(());
        }

        self.dispatch()?;

        // Checked only after reaping in the same tick, so a chunk that
        // exited moments ago cannot make the profile look unfinished.
        if self.current_profile_name.is_some() && self.state.profile_drained() {
            self.complete_profile()?;
        }

        self.update_progress();
        Ok(())
    }

    /// Drive ticks until the run reaches a terminal phase.
    pub fn run_to_completion(&mut self, interval: Duration) -> Result<()> {
        while !self.finished {
            self.tick()?;
            if !self.finished {
                std::thread::sleep(interval);
            }
        }
        Ok(())
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    // Reaping ----------------------------------------------------------

    fn reap(&mut self) -> Result<()> {
        let pids: Vec<u32> = self.state.active_jobs.iter().map(|entry| *entry.key()).collect();

        for pid in pids {
            let exit = match self.state.active_jobs.get_mut(&pid) {
                Some(mut entry) => entry.handle.try_wait(),
                None => continue,
            };

            let code = match exit {
                Ok(Some(code)) => code,
                Ok(None) => continue,
                Err(e) => {
                    warn!(pid, error = %e, "job wait failed; treating as fatal exit");
                    16
                }
            };

            // Atomic remove-and-return: whoever gets the job processes it
            // exactly once.
            if let Some((_, job)) = self.state.active_jobs.remove(&pid) {
                self.handle_exit(job, code)?;
            }
        }
        Ok(())
    }

    fn handle_exit(&mut self, mut job: Job, code: u32) -> Result<()> {
        // Let the reader settle and release the process handle.
        let _ = job.handle.wait(Some(Duration::from_secs(2)));

        let stats = read_log_lenient(job.handle.log_path()).unwrap_or_else(|e| {
            debug!(chunk = job.chunk.id, error = %e, "chunk log not readable");
            LogStats::default()
        });

        if !stats.errors.is_empty() {
            let log_name = job
                .handle
                .log_path()
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            if let Err(e) = self.report.append_chunk_errors(&log_name, &stats.errors) {
                warn!(error = %e, "failed-files summary write failed");
            }
        }

        let analysis = interpret_exit_code(code, self.current_mismatch);
        debug!(
            chunk = job.chunk.id,
            code,
            severity = ?analysis.severity,
            "job exited"
        );

        if analysis.is_failure() {
            self.handle_failure(job.chunk, &analysis);
            self.save_checkpoint();
            return Ok(());
        }

        let mut chunk = job.chunk;
        chunk.status = if analysis.severity == Severity::Warning {
            ChunkStatus::CompleteWithWarnings
        } else {
            ChunkStatus::Complete
        };

        self.state
            .record_completed_chunk(chunk.estimated_bytes, stats.files_copied);
        self.completed_sources
            .push(chunk.source.to_string_lossy().into_owned());

        if let Some(callback) = &self.callbacks.on_chunk_complete {
            callback(&chunk, &analysis);
        }
        self.state.push_completed(chunk);

        let every = self.config.settings.checkpoint_every_chunks;
        if self.state.completed_count() % every == 0 {
            self.save_checkpoint();
        }
        Ok(())
    }

    fn handle_failure(&mut self, mut chunk: Chunk, analysis: &ExitAnalysis) {
        chunk.retry_count += 1;

        let cap = self.config.settings.max_chunk_retries;
        if analysis.should_retry && chunk.retry_count <= cap {
            let delay = self.backoff(chunk.retry_count);
            chunk.retry_after = Some(Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default());
            info!(
                chunk = chunk.id,
                retry = chunk.retry_count,
                delay_secs = delay.as_secs(),
                "chunk will be retried"
            );
            chunk.status = ChunkStatus::Pending;
            self.state.enqueue_chunk(chunk);
            return;
        }

        let message = format!(
            "chunk {} ({} -> {}) failed: {}",
            chunk.id,
            chunk.source.display(),
            chunk.destination.display(),
            analysis.message
        );
        error!(chunk = chunk.id, exit_code = analysis.exit_code, "{}", message);

        chunk.status = ChunkStatus::Failed;
        let chunk_id = chunk.id;
        self.state.record_failed_chunk();
        self.state.push_failed(chunk);
        self.state.push_error(message.clone());
        self.emit(RunEvent::ChunkFailed { chunk_id, message });
    }

    /// Exponential backoff: base * multiplier^(n-1), capped.
    fn backoff(&self, retry_count: u32) -> Duration {
        let settings = &self.config.settings;
        let exponent = retry_count.saturating_sub(1).min(16);
        let raw = settings
            .retry_backoff_base_secs
            .saturating_mul(settings.retry_backoff_multiplier.saturating_pow(exponent));
        Duration::from_secs(raw.min(settings.retry_backoff_max_secs))
    }

    // Dispatch ---------------------------------------------------------

    fn dispatch(&mut self) -> Result<()> {
        let max_concurrent = self.config.settings.max_concurrent_jobs as usize;
        // Bound dequeues by the queue length at entry so backoff-deferred
        // chunks round-trip once per tick instead of spinning.
        let mut budget = self.state.queued_chunks();
        let now = Utc::now();

        while self.state.active_jobs.len() < max_concurrent && budget > 0 {
            budget -= 1;
            let Some(mut chunk) = self.state.dequeue_chunk() else {
                break;
            };

            if let Some(checkpoint) = &self.resume {
                if checkpoint.is_completed(&chunk) {
                    debug!(chunk = chunk.id, "skipping chunk completed in a prior session");
                    chunk.status = ChunkStatus::Skipped;
                    self.state.record_skipped_chunk(chunk.estimated_bytes);
                    continue;
                }
            }

            if !chunk.ready_at(now) {
                self.state.enqueue_chunk(chunk);
                continue;
            }

            let ipg = if self.current_options.inter_packet_gap_ms > 0 {
                self.current_options.inter_packet_gap_ms
            } else {
                compute_ipg(
                    self.config.settings.bandwidth_limit_mbps,
                    self.state.active_jobs.len(),
                    true,
                )
            };

            let request = LaunchRequest {
                options: self.current_options.clone(),
                threads_per_job: self.config.settings.threads_per_job,
                ipg_ms: ipg,
                dry_run: self.opts.dry_run,
                log_path: self.chunk_log_path(chunk.id),
            };

            match self.launcher.launch(&chunk, &request) {
                Ok(handle) => {
                    chunk.status = ChunkStatus::Running;
                    let pid = handle.pid();
                    debug!(chunk = chunk.id, pid, ipg, "job dispatched");
                    self.state.active_jobs.insert(
                        pid,
                        Job {
                            chunk,
                            handle,
                            started_at: Utc::now(),
                            dry_run: self.opts.dry_run,
                        },
                    );
                }
                Err(e) => {
                    warn!(chunk = chunk.id, error = %e, "launch failed");
                    let analysis = ExitAnalysis {
                        exit_code: 0,
                        severity: Severity::Error,
                        should_retry: true,
                        message: format!("launch failed: {}", e),
                    };
                    self.handle_failure(chunk, &analysis);
                }
            }
        }
        Ok(())
    }

    fn chunk_log_path(&self, chunk_id: u64) -> PathBuf {
        self.jobs_dir
            .join(format!("{}_Chunk_{}.log", self.state.session_id, chunk_id))
    }

    // Profile lifecycle ------------------------------------------------

    /// Start the profile at `index`, skipping ahead over profiles whose
    /// setup fails (those failures are recorded, not fatal — unless they
    /// are the run-aborting kinds).
    fn start_profile_or_skip(&mut self, index: usize) -> Result<()> {
        let mut index = index;
        while index < self.config.profiles.len() {
            match self.start_profile(index) {
                Ok(()) => {
                    self.state.set_profile_index(index);
                    return Ok(());
                }
                Err(e) if e.aborts_run() || matches!(e, RobocurseError::UncRequiresCredential(_)) => {
                    return Err(e);
                }
                Err(e) => {
                    let name = self.config.profiles[index].name.clone();
                    error!(profile = %name, error = %e, "profile skipped");
                    self.state.push_error(format!("profile {} skipped: {}", name, e));
                    index += 1;
                }
            }
        }

        // Nothing left to run.
        self.finalize_run(true)?;
        Ok(())
    }

    fn start_profile(&mut self, index: usize) -> Result<()> {
        let profile = self.config.profiles[index].clone();
        info!(profile = %profile.name, source = %profile.source.display(), "starting profile");
        self.emit(RunEvent::ProfileStart {
            profile: profile.name.clone(),
        });

        let mut effective = profile.clone();

        // Network paths first: in a non-interactive session they demand an
        // explicit credential before anything is attempted.
        if profile.touches_network() {
            if self.opts.headless && profile.credential.is_none() {
                let unc = if is_unc_path(&profile.source) {
                    profile.source.clone()
                } else {
                    profile.destination.clone()
                };
                return Err(RobocurseError::UncRequiresCredential(unc));
            }
            if let Some(mounts) = &self.mounts {
                let set = mounts.mount_profile_paths(
                    &profile.source,
                    &profile.destination,
                    profile.credential.as_ref(),
                )?;
                if let Some(source) = &set.effective_source {
                    effective.source = source.clone();
                }
                if let Some(destination) = &set.effective_destination {
                    effective.destination = destination.clone();
                }
                self.current_mounts = set.records;
            }
        }

        // Snapshot the source when asked; degraded (live) copying on
        // privilege or permanent snapshot failures, with a warning.
        if profile.use_vss {
            match self.create_snapshot(&profile) {
                Ok(Some(snapshot)) => {
                    effective.source = snapshot.read_path.clone();
                    self.current_snapshot = Some(snapshot);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(profile = %profile.name, error = %e, "snapshot unavailable; copying live source");
                }
            }
        }

        let planner = ChunkPlanner::new(&self.profiler, &self.ids);
        let chunks = planner.plan(&effective)?;
        let total = chunks.len() as u64;
        self.profile_total_bytes = chunks.iter().map(|chunk| chunk.estimated_bytes).sum();

        self.state.begin_profile(total);
        for chunk in chunks {
            self.state.enqueue_chunk(chunk);
        }

        self.current_profile_name = Some(profile.name.clone());
        self.current_mismatch = profile
            .effective_mismatch_severity(self.config.settings.default_mismatch_severity);
        self.current_options = profile.options.clone();
        self.profile_started_at = Utc::now();

        info!(profile = %profile.name, chunks = total, bytes = self.profile_total_bytes, "profile planned");
        Ok(())
    }

    fn create_snapshot(&self, profile: &Profile) -> Result<Option<ActiveSnapshot>> {
        let Some(vss) = &self.vss else {
            warn!(profile = %profile.name, "snapshots requested but no shadow-copy facility is available");
            return Ok(None);
        };
        let snapshot = if is_unc_path(&profile.source) {
            vss.create_remote(&profile.source, profile.credential.as_ref())?
        } else {
            vss.create_local(&profile.source)?
        };
        Ok(Some(snapshot))
    }

    fn complete_profile(&mut self) -> Result<()> {
        let completed = self.state.drain_completed();
        let failed = self.state.drain_failed();
        self.state.drain_chunk_queue();

        let bytes_copied: u64 = completed
            .iter()
            .map(|chunk| chunk.estimated_bytes)
            .sum::<u64>()
            + self.state.profile_skipped_bytes();
        let files_copied = self
            .state
            .completed_chunk_files()
            .saturating_sub(self.state.profile_start_files());

        let result = ProfileResult {
            profile_name: self.current_profile_name.clone().unwrap_or_default(),
            completed_chunks: completed.len(),
            failed_chunks: failed.len(),
            skipped_chunks: self.state.profile_skipped_count(),
            bytes_copied,
            files_copied,
            started_at: self.profile_started_at,
            finished_at: Utc::now(),
        };

        info!(
            profile = %result.profile_name,
            completed = result.completed_chunks,
            failed = result.failed_chunks,
            skipped = result.skipped_chunks,
            bytes = result.bytes_copied,
            files = result.files_copied,
            duration_secs = (result.finished_at - result.started_at).num_seconds(),
            "profile finished"
        );

        self.teardown_profile_resources();

        self.emit(RunEvent::ProfileComplete {
            profile: result.profile_name.clone(),
            success: result.success(),
        });
        if let Some(callback) = &self.callbacks.on_profile_complete {
            callback(&result);
        }
        self.state.push_profile_result(result);

        let next = self.state.profile_index() + 1;
        if next < self.config.profiles.len() {
            self.state.set_profile_index(next);
            self.start_profile_or_skip(next)?;
        } else {
            self.finalize_run(true)?;
        }
        Ok(())
    }

    fn finalize_run(&mut self, clean: bool) -> Result<()> {
        if clean {
            self.state.advance_phase(Phase::Complete);
            if let Err(e) = self.checkpoint_store.remove() {
                warn!(error = %e, "failed to remove checkpoint after clean completion");
            }
        }
        self.write_health(true);
        let success = clean && !self.state.any_failures();
        self.emit(RunEvent::SessionEnd { success });
        info!(
            session = %self.state.session_id,
            success,
            completed = self.state.completed_count(),
            bytes = self.state.completed_chunk_bytes(),
            "session finished"
        );
        self.finished = true;
        Ok(())
    }

    /// Kill everything, tear down profile resources, and stop.
    fn stop_all(&mut self) {
        info!("stop requested; terminating active jobs");

        let pids: Vec<u32> = self.state.active_jobs.iter().map(|entry| *entry.key()).collect();
        for pid in pids {
            if let Some((_, mut job)) = self.state.active_jobs.remove(&pid) {
                if let Err(e) = job.handle.terminate() {
                    warn!(pid, error = %e, "terminate failed");
                }
                match job.handle.wait(Some(STOP_WAIT)) {
                    Ok(code) => debug!(pid, code, "job stopped"),
                    Err(e) => warn!(pid, error = %e, "job did not stop in time"),
                }
            }
        }
        self.state.active_jobs.clear();

        self.teardown_profile_resources();

        self.state.advance_phase(Phase::Stopped);
        let _ = self.finalize_run(false);
    }

    /// Tear down the current profile's snapshot and mounts. Failures are
    /// logged; one failed teardown never blocks the others.
    fn teardown_profile_resources(&mut self) {
        if let Some(snapshot) = self.current_snapshot.take() {
            if let Some(vss) = &self.vss {
                if let Err(e) = vss.teardown(snapshot) {
                    warn!(error = %e, "snapshot teardown failed; kept for orphan recovery");
                }
            }
        }

        if !self.current_mounts.is_empty() {
            let records = std::mem::take(&mut self.current_mounts);
            if let Some(mounts) = &self.mounts {
                mounts.dismount(&records);
            }
        }
    }

    // Progress / persistence -------------------------------------------

    fn save_checkpoint(&mut self) {
        let checkpoint = Checkpoint {
            version: 1,
            session_id: self.state.session_id.to_string(),
            saved_at: Utc::now(),
            profile_index: self.state.profile_index(),
            profile_name: self.current_profile_name.clone().unwrap_or_default(),
            completed_sources: self.completed_sources.clone(),
            completed_count: self.state.completed_count(),
            bytes_complete: self.state.completed_chunk_bytes(),
            started_at: self.state.started_at,
        };
        if let Err(e) = self.checkpoint_store.save(&checkpoint) {
            // Advisory: the run keeps going without resume coverage.
            warn!(error = %e, "checkpoint save failed");
        }
    }

    fn progress_snapshot(&self) -> ProgressSnapshot {
        let bytes_in_flight: u64 = self
            .state
            .active_jobs
            .iter()
            .map(|entry| entry.handle.progress().bytes_copied())
            .sum();

        let completed_bytes = self.state.completed_chunk_bytes();
        let eta_seconds = self.estimate_eta(completed_bytes + bytes_in_flight);

        ProgressSnapshot {
            session_id: self.state.session_id,
            phase: self.state.phase(),
            profile_name: self.current_profile_name.clone(),
            profile_index: self.state.profile_index(),
            chunks_completed: self.state.completed_count(),
            chunks_total: self.state.profile_total_chunks(),
            chunks_pending: self.state.queued_chunks() as u64,
            chunks_failed: self.state.failed_len() as u64,
            active_jobs: self.state.active_jobs.len(),
            bytes_completed: completed_bytes,
            bytes_in_flight,
            eta_seconds,
        }
    }

    fn estimate_eta(&self, bytes_done: u64) -> Option<u64> {
        let elapsed = (Utc::now() - self.profile_started_at).num_seconds();
        if elapsed < 5 || bytes_done == 0 || self.profile_total_bytes == 0 {
            return None;
        }
        let remaining = self.profile_total_bytes.saturating_sub(bytes_done);
        let rate = bytes_done / elapsed as u64;
        if rate == 0 {
            return None;
        }
        Some(remaining / rate)
    }

    fn update_progress(&mut self) {
        let snapshot = self.progress_snapshot();
        self.write_health(false);
        if let Some(callback) = &self.callbacks.on_progress {
            callback(&snapshot);
        }
    }

    fn write_health(&mut self, force: bool) {
        let snapshot = self.progress_snapshot();
        let phase = self.state.phase();
        let healthy = phase != Phase::Stopped && !self.state.any_failures();

        let status = HealthStatus {
            timestamp: Utc::now(),
            phase: phase.as_str().to_string(),
            profile_name: snapshot.profile_name.clone(),
            profile_index: snapshot.profile_index,
            chunks_completed: snapshot.chunks_completed,
            chunks_total: snapshot.chunks_total,
            chunks_pending: snapshot.chunks_pending,
            chunks_failed: snapshot.chunks_failed,
            active_jobs: snapshot.active_jobs,
            bytes_completed: snapshot.bytes_completed,
            session_id: self.state.session_id.to_string(),
            eta_seconds: snapshot.eta_seconds,
            healthy,
            message: match phase {
                Phase::Stopped => "stopped by request".to_string(),
                Phase::Complete => "complete".to_string(),
                _ => format!(
                    "{} of {} chunks done",
                    snapshot.chunks_completed, snapshot.chunks_total
                ),
            },
        };

        let result = if force {
            self.health.flush(&status).map(|_| true)
        } else {
            self.health.maybe_write(&status)
        };
        if let Err(e) = result {
            warn!(error = %e, "health write failed");
        }
    }

    fn emit(&self, event: RunEvent) {
        if let Some(callback) = &self.callbacks.on_event {
            callback(&event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GlobalSettings;

    fn orchestrator_with(settings: GlobalSettings) -> Orchestrator {
        let config = Config {
            profiles: vec![serde_json::from_str(
                r#"{ "name": "p", "source": "/tmp", "destination": "/tmp2" }"#,
            )
            .unwrap()],
            settings,
        };
        struct NeverLauncher;
        impl JobLauncher for NeverLauncher {
            fn launch(
                &self,
                _chunk: &Chunk,
                _request: &LaunchRequest,
            ) -> Result<Box<dyn crate::copier::launcher::RunningCopier>> {
                Err(RobocurseError::Launch("not in this test".to_string()))
            }
        }
        Orchestrator::new(config, Box::new(NeverLauncher), RunOptions::default()).unwrap()
    }

    #[test]
    fn test_backoff_monotonic_and_capped() {
        let orchestrator = orchestrator_with(GlobalSettings::default());

        let mut last = Duration::ZERO;
        for retry in 1..=10 {
            let delay = orchestrator.backoff(retry);
            assert!(delay >= last, "backoff({}) regressed", retry);
            assert!(delay <= Duration::from_secs(120));
            last = delay;
        }

        assert_eq!(orchestrator.backoff(1), Duration::from_secs(5));
        assert_eq!(orchestrator.backoff(2), Duration::from_secs(10));
        assert_eq!(orchestrator.backoff(3), Duration::from_secs(20));
        assert_eq!(orchestrator.backoff(6), Duration::from_secs(120));
    }

    #[test]
    fn test_backoff_overflow_safe() {
        let settings = GlobalSettings {
            retry_backoff_base_secs: u64::MAX / 2,
            retry_backoff_multiplier: u64::MAX / 2,
            retry_backoff_max_secs: 60,
            ..Default::default()
        };
        let orchestrator = orchestrator_with(settings);
        assert_eq!(orchestrator.backoff(40), Duration::from_secs(60));
    }

    #[test]
    fn test_chunk_log_path_shape() {
        let orchestrator = orchestrator_with(GlobalSettings::default());
        let path = orchestrator.chunk_log_path(7);
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.ends_with("_Chunk_7.log"));
        assert!(name.starts_with(&orchestrator.state.session_id.to_string()));
        assert!(path.parent().unwrap().ends_with("Jobs"));
    }
}
