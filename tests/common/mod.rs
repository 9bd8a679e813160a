/*!
 * Shared test harness: a scripted in-memory copier launcher and source
 * tree builders, so orchestrator behavior is exercised without spawning
 * processes.
 */

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use robocurse::copier::launcher::{JobLauncher, LaunchRequest, RunningCopier};
use robocurse::copier::ProgressBuffer;
use robocurse::error::{Result, RobocurseError};
use robocurse::planner::Chunk;

/// A scripted fake copier process.
pub struct FakeJob {
    pid: u32,
    exit_code: u32,
    /// try_wait reports "still running" this many times before exiting
    polls_left: u32,
    terminated: bool,
    progress: Arc<ProgressBuffer>,
    log_path: PathBuf,
}

impl RunningCopier for FakeJob {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn try_wait(&mut self) -> Result<Option<u32>> {
        if self.terminated {
            return Ok(Some(16));
        }
        if self.polls_left == 0 {
            Ok(Some(self.exit_code))
        } else {
            self.polls_left -= 1;
            Ok(None)
        }
    }

    fn wait(&mut self, _timeout: Option<Duration>) -> Result<u32> {
        if self.terminated {
            Ok(16)
        } else {
            self.polls_left = 0;
            Ok(self.exit_code)
        }
    }

    fn terminate(&mut self) -> Result<()> {
        self.terminated = true;
        Ok(())
    }

    fn progress(&self) -> Arc<ProgressBuffer> {
        self.progress.clone()
    }

    fn log_path(&self) -> &Path {
        &self.log_path
    }
}

/// One recorded launch, for assertions.
#[derive(Clone)]
pub struct LaunchRecord {
    pub chunk_id: u64,
    pub source: PathBuf,
    pub ipg_ms: u32,
    pub dry_run: bool,
    pub log_path: PathBuf,
}

/// Launcher whose jobs exit with scripted codes.
///
/// Exit codes are keyed by the chunk's source path; each launch for the
/// same source consumes the next code in its list. Sources without a
/// script exit with `default_code`.
#[derive(Default)]
pub struct FakeLauncher {
    pub default_code: u32,
    scripts: Mutex<HashMap<PathBuf, Vec<u32>>>,
    pub launches: Mutex<Vec<LaunchRecord>>,
    next_pid: AtomicU32,
    /// Launch failures to inject before launches start succeeding
    pub launch_failures: AtomicU32,
    /// When nonzero, jobs linger for this many try_wait polls
    pub polls_before_exit: AtomicU32,
    /// When true, jobs never exit on their own (stop-path testing)
    pub hold_jobs: std::sync::atomic::AtomicBool,
    /// Content written to each job's log file before it "runs"
    pub log_template: Mutex<Option<String>>,
}

impl FakeLauncher {
    pub fn new(default_code: u32) -> Arc<Self> {
        Arc::new(Self {
            default_code,
            next_pid: AtomicU32::new(1000),
            ..Default::default()
        })
    }

    /// Queue successive exit codes for chunks rooted at `source`.
    pub fn script(&self, source: &Path, codes: &[u32]) {
        self.scripts
            .lock()
            .insert(source.to_path_buf(), codes.to_vec());
    }

    pub fn launch_count(&self) -> usize {
        self.launches.lock().len()
    }

    fn next_code(&self, source: &Path) -> u32 {
        let mut scripts = self.scripts.lock();
        match scripts.get_mut(source) {
            Some(codes) if !codes.is_empty() => codes.remove(0),
            _ => self.default_code,
        }
    }
}

/// Shim so tests keep an `Arc` handle while the orchestrator owns a box.
pub struct SharedLauncher(pub Arc<FakeLauncher>);

impl JobLauncher for SharedLauncher {
    fn launch(&self, chunk: &Chunk, request: &LaunchRequest) -> Result<Box<dyn RunningCopier>> {
        let inner = &self.0;

        let failures = inner.launch_failures.load(Ordering::SeqCst);
        if failures > 0 {
            inner.launch_failures.store(failures - 1, Ordering::SeqCst);
            return Err(RobocurseError::Launch("injected launch failure".to_string()));
        }

        inner.launches.lock().push(LaunchRecord {
            chunk_id: chunk.id,
            source: chunk.source.clone(),
            ipg_ms: request.ipg_ms,
            dry_run: request.dry_run,
            log_path: request.log_path.clone(),
        });

        if let Some(template) = inner.log_template.lock().as_ref() {
            if let Some(parent) = request.log_path.parent() {
                std::fs::create_dir_all(parent).ok();
            }
            std::fs::write(&request.log_path, template).ok();
        }

        let polls = if inner.hold_jobs.load(Ordering::SeqCst) {
            u32::MAX
        } else {
            inner.polls_before_exit.load(Ordering::SeqCst)
        };

        Ok(Box::new(FakeJob {
            pid: inner.next_pid.fetch_add(1, Ordering::SeqCst),
            exit_code: inner.next_code(&chunk.source),
            polls_left: polls,
            terminated: false,
            progress: Arc::new(ProgressBuffer::new()),
            log_path: request.log_path.clone(),
        }))
    }
}

/// A robocopy log whose summary reports the given copied files/bytes.
pub fn log_with_summary(files: u64, bytes: u64) -> String {
    format!(
        "\
------------------------------------------------------------------------------

               Total    Copied   Skipped  Mismatch    FAILED    Extras
    Dirs :         1         1         0         0         0         0
   Files :   {files}   {files}         0         0         0         0
   Bytes :   {bytes}   {bytes}         0         0         0         0
"
    )
}

/// Build a flat tree: loose files at the root plus sized subdirectories.
/// Returns the subdirectory paths in sorted order.
pub fn build_tree(root: &Path, loose: &[(&str, usize)], subdirs: &[(&str, usize)]) -> Vec<PathBuf> {
    for (name, size) in loose {
        std::fs::write(root.join(name), vec![b'x'; *size]).unwrap();
    }
    let mut paths = Vec::new();
    for (name, size) in subdirs {
        let dir = root.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("data.bin"), vec![b'x'; *size]).unwrap();
        paths.push(dir);
    }
    paths.sort();
    paths
}
