/*!
 * Copier process lifecycle
 *
 * Spawns the copier with stdout piped, binds the child to a parent-lifetime
 * process group so orphans die with the orchestrator, and streams stdout
 * into the job's progress buffer from a background reader thread.
 */

use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::copier::progress::ProgressBuffer;
use crate::error::{RobocurseError, Result};
use crate::planner::ChunkId;

/// Parent-lifetime process group, created once per run.
///
/// On Windows this is a job object with kill-on-close: when the last handle
/// drops (parent exit, including crashes), the kernel terminates every
/// assigned child. On Unix each child instead arms `PR_SET_PDEATHSIG` in
/// `pre_exec`, so the group itself carries no state.
pub struct ProcessGroup {
    #[cfg(windows)]
    job: windows_impl::JobObject,
}

impl ProcessGroup {
    pub fn create() -> Result<Self> {
        Ok(Self {
            #[cfg(windows)]
            job: windows_impl::JobObject::kill_on_close()?,
        })
    }

    fn bind(&self, child: &Child) -> Result<()> {
        #[cfg(windows)]
        {
            self.job.assign(child)?;
        }
        #[cfg(not(windows))]
        {
            let _ = child;
        }
        Ok(())
    }
}

/// A running copier process attached to one chunk
#[derive(Debug)]
pub struct CopierJob {
    child: Child,
    pid: u32,
    chunk_id: ChunkId,
    log_path: PathBuf,
    dry_run: bool,
    started_at: DateTime<Utc>,
    progress: Arc<ProgressBuffer>,
    reader: Option<JoinHandle<()>>,
}

impl CopierJob {
    /// Launch the copier for one chunk.
    ///
    /// stdin and stderr stay attached to the parent; stdout is piped to the
    /// async reader. The argument vector already carries quoting, so on
    /// Windows it is passed raw.
    pub fn spawn(
        copier: &Path,
        args: &[String],
        chunk_id: ChunkId,
        log_path: PathBuf,
        dry_run: bool,
        group: &ProcessGroup,
    ) -> Result<CopierJob> {
        let mut command = Command::new(copier);
        command
            .stdin(Stdio::inherit())
            .stderr(Stdio::inherit())
            .stdout(Stdio::piped());

        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            for arg in args {
                command.raw_arg(arg);
            }
        }
        #[cfg(not(windows))]
        {
            command.args(args);
        }

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // New process group, and die with the parent even if the
            // orchestrator is killed outright.
            unsafe {
                command.pre_exec(|| {
                    libc::setpgid(0, 0);
                    #[cfg(target_os = "linux")]
                    libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL);
                    Ok(())
                });
            }
        }

        let mut child = command
            .spawn()
            .map_err(|e| RobocurseError::Launch(format!("{}: {}", copier.display(), e)))?;

        if let Err(e) = group.bind(&child) {
            warn!(error = %e, "failed to bind copier to process group; killing child");
            let _ = child.kill();
            let _ = child.wait();
            return Err(e);
        }

        let pid = child.id();
        let progress = Arc::new(ProgressBuffer::new());

        let reader = child.stdout.take().map(|stdout| {
            let progress = progress.clone();
            thread::spawn(move || {
                let reader = BufReader::new(stdout);
                for line in reader.lines() {
                    match line {
                        Ok(line) => progress.ingest_line(&line),
                        Err(_) => break,
                    }
                }
            })
        });

        debug!(pid, chunk_id, "copier launched");

        Ok(CopierJob {
            child,
            pid,
            chunk_id,
            log_path,
            dry_run,
            started_at: Utc::now(),
            progress,
            reader,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn chunk_id(&self) -> ChunkId {
        self.chunk_id
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn dry_run(&self) -> bool {
        self.dry_run
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn progress(&self) -> Arc<ProgressBuffer> {
        self.progress.clone()
    }

    /// Non-blocking exit probe.
    pub fn try_wait(&mut self) -> Result<Option<u32>> {
        match self.child.try_wait()? {
            Some(status) => Ok(Some(exit_code_of(status))),
            None => Ok(None),
        }
    }

    /// Wait for exit, optionally bounded. On timeout the child is killed
    /// and the call fails with `Timeout`. The reader is always drained and
    /// joined before returning, so late stdout lines are not lost.
    pub fn wait(&mut self, timeout: Option<Duration>) -> Result<u32> {
        let deadline = timeout.map(|t| Instant::now() + t);

        let status = loop {
            if let Some(status) = self.child.try_wait()? {
                break status;
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    let _ = self.child.kill();
                    let _ = self.child.wait();
                    self.drain_reader();
                    return Err(RobocurseError::Timeout {
                        seconds: timeout.map(|t| t.as_secs()).unwrap_or(0),
                    });
                }
            }
            thread::sleep(Duration::from_millis(50));
        };

        self.drain_reader();
        Ok(exit_code_of(status))
    }

    /// Forcibly terminate the child (stop-all path).
    pub fn terminate(&mut self) -> Result<()> {
        if self.child.try_wait()?.is_none() {
            self.child.kill()?;
        }
        Ok(())
    }

    /// Let the async reader's queue stabilize, then join it.
    ///
    /// After process exit the pipe may still hold buffered lines; we wait
    /// for three identical line counts sampled 20 ms apart (bounded at
    /// ~1 s) before tearing the reader down.
    fn drain_reader(&mut self) {
        let started = Instant::now();
        let mut last_count = self.progress.line_count();
        let mut stable = 0;

        while stable < 3 && started.elapsed() < Duration::from_secs(1) {
            thread::sleep(Duration::from_millis(20));
            let count = self.progress.line_count();
            if count == last_count {
                stable += 1;
            } else {
                stable = 0;
                last_count = count;
            }
        }

        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }
}

impl Drop for CopierJob {
    fn drop(&mut self) {
        // The child handle must always be released; a still-running child
        // is killed rather than leaked past its chunk's lifetime.
        if let Ok(None) = self.child.try_wait() {
            let _ = self.child.kill();
        }
        let _ = self.child.wait();
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }
}

fn exit_code_of(status: std::process::ExitStatus) -> u32 {
    match status.code() {
        Some(code) => code as u32,
        // Killed by a signal: report as fatal.
        None => 16,
    }
}

#[cfg(windows)]
mod windows_impl {
    use std::process::Child;

    use windows::core::PCWSTR;
    use windows::Win32::Foundation::{CloseHandle, HANDLE};
    use windows::Win32::System::JobObjects::{
        AssignProcessToJobObject, CreateJobObjectW, JobObjectExtendedLimitInformation,
        SetInformationJobObject, JOBOBJECT_EXTENDED_LIMIT_INFORMATION,
        JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE,
    };

    use crate::error::{RobocurseError, Result};

    pub struct JobObject {
        handle: HANDLE,
    }

    // The raw handle is only used from the orchestrator thread and the
    // kernel object itself is thread-safe.
    unsafe impl Send for JobObject {}
    unsafe impl Sync for JobObject {}

    impl JobObject {
        pub fn kill_on_close() -> Result<Self> {
            unsafe {
                let handle = CreateJobObjectW(None, PCWSTR::null())
                    .map_err(|e| RobocurseError::Launch(format!("job object: {}", e)))?;

                let mut info = JOBOBJECT_EXTENDED_LIMIT_INFORMATION::default();
                info.BasicLimitInformation.LimitFlags = JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE;
                SetInformationJobObject(
                    handle,
                    JobObjectExtendedLimitInformation,
                    &info as *const _ as *const _,
                    std::mem::size_of::<JOBOBJECT_EXTENDED_LIMIT_INFORMATION>() as u32,
                )
                .map_err(|e| RobocurseError::Launch(format!("job object limits: {}", e)))?;

                Ok(Self { handle })
            }
        }

        pub fn assign(&self, child: &Child) -> Result<()> {
            use std::os::windows::io::AsRawHandle;
            unsafe {
                AssignProcessToJobObject(self.handle, HANDLE(child.as_raw_handle() as _))
                    .map_err(|e| RobocurseError::Launch(format!("job assignment: {}", e)))
            }
        }
    }

    impl Drop for JobObject {
        fn drop(&mut self) {
            unsafe {
                let _ = CloseHandle(self.handle);
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn spawn_shell(script: &str) -> CopierJob {
        let group = ProcessGroup::create().unwrap();
        CopierJob::spawn(
            Path::new("/bin/sh"),
            &["-c".to_string(), script.to_string()],
            0,
            PathBuf::from("/tmp/robocurse-test.log"),
            false,
            &group,
        )
        .unwrap()
    }

    #[test]
    fn test_wait_captures_stdout_and_exit_code() {
        let mut job = spawn_shell(
            "printf '    New File       1000 a.bin\\n  50%%\\n'; exit 1",
        );
        let code = job.wait(None).unwrap();
        assert_eq!(code, 1);
        assert_eq!(job.progress().bytes_copied(), 500);
        assert_eq!(job.progress().line_count(), 2);
    }

    #[test]
    fn test_try_wait_reports_running_then_exited() {
        let mut job = spawn_shell("sleep 0.2; exit 3");
        assert!(job.try_wait().unwrap().is_none());
        let code = job.wait(None).unwrap();
        assert_eq!(code, 3);
    }

    #[test]
    fn test_wait_timeout_kills_child() {
        let mut job = spawn_shell("sleep 30");
        let err = job.wait(Some(Duration::from_millis(200))).unwrap_err();
        assert!(matches!(err, RobocurseError::Timeout { .. }));
        // Child is gone: a second bounded wait returns immediately.
        assert!(job.try_wait().unwrap().is_some());
    }

    #[test]
    fn test_terminate_running_child() {
        let mut job = spawn_shell("sleep 30");
        job.terminate().unwrap();
        let code = job.wait(Some(Duration::from_secs(2))).unwrap();
        // Killed by signal maps to the fatal code.
        assert_eq!(code, 16);
    }

    #[test]
    fn test_spawn_missing_binary_is_launch_error() {
        let group = ProcessGroup::create().unwrap();
        let err = CopierJob::spawn(
            Path::new("/nonexistent/robocopy"),
            &[],
            0,
            PathBuf::from("/tmp/x.log"),
            false,
            &group,
        )
        .unwrap_err();
        assert!(matches!(err, RobocurseError::Launch(_)));
    }
}
