/*!
 * Launcher seam between the orchestrator and real copier processes
 *
 * The orchestrator only talks to these traits, so its tick loop is tested
 * against scripted in-memory jobs while production runs robocopy.
 */

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::config::CopyOptions;
use crate::copier::args::{build_args, ArgContext};
use crate::copier::job::{CopierJob, ProcessGroup};
use crate::copier::locate::locate_copier;
use crate::copier::progress::ProgressBuffer;
use crate::error::Result;
use crate::planner::Chunk;

/// Everything a launch needs beyond the chunk itself
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub options: CopyOptions,
    pub threads_per_job: u32,
    pub ipg_ms: u32,
    pub dry_run: bool,
    pub log_path: PathBuf,
}

/// Handle to a dispatched copier, owned by the active-job map
pub trait RunningCopier: Send + Sync {
    fn pid(&self) -> u32;
    /// Non-blocking: the exit code once the process has exited.
    fn try_wait(&mut self) -> Result<Option<u32>>;
    /// Blocking wait, optionally bounded; kills the process on timeout.
    fn wait(&mut self, timeout: Option<Duration>) -> Result<u32>;
    /// Forcible termination (stop-all).
    fn terminate(&mut self) -> Result<()>;
    fn progress(&self) -> Arc<ProgressBuffer>;
    fn log_path(&self) -> &Path;
}

pub trait JobLauncher: Send + Sync {
    fn launch(&self, chunk: &Chunk, request: &LaunchRequest) -> Result<Box<dyn RunningCopier>>;
}

/// Production launcher: resolves robocopy once and spawns real processes
/// bound to the run's process group.
pub struct RobocopyLauncher {
    copier_path: PathBuf,
    group: ProcessGroup,
}

impl RobocopyLauncher {
    pub fn new(override_path: Option<&Path>) -> Result<Self> {
        Ok(Self {
            copier_path: locate_copier(override_path)?,
            group: ProcessGroup::create()?,
        })
    }

    pub fn copier_path(&self) -> &Path {
        &self.copier_path
    }
}

impl JobLauncher for RobocopyLauncher {
    fn launch(&self, chunk: &Chunk, request: &LaunchRequest) -> Result<Box<dyn RunningCopier>> {
        let ctx = ArgContext {
            threads_per_job: request.threads_per_job,
            ipg_ms: request.ipg_ms,
            dry_run: request.dry_run,
            log_path: request.log_path.clone(),
        };
        let args = build_args(chunk, &request.options, &ctx)?;

        let job = CopierJob::spawn(
            &self.copier_path,
            &args,
            chunk.id,
            request.log_path.clone(),
            request.dry_run,
            &self.group,
        )?;
        Ok(Box::new(job))
    }
}

impl RunningCopier for CopierJob {
    fn pid(&self) -> u32 {
        CopierJob::pid(self)
    }

    fn try_wait(&mut self) -> Result<Option<u32>> {
        CopierJob::try_wait(self)
    }

    fn wait(&mut self, timeout: Option<Duration>) -> Result<u32> {
        CopierJob::wait(self, timeout)
    }

    fn terminate(&mut self) -> Result<()> {
        CopierJob::terminate(self)
    }

    fn progress(&self) -> Arc<ProgressBuffer> {
        CopierJob::progress(self)
    }

    fn log_path(&self) -> &Path {
        CopierJob::log_path(self)
    }
}
