/*!
 * Robocurse - Scheduled parallel directory replication
 *
 * Orchestrates many robocopy processes over a partitioned source tree:
 * - Size/file-count/depth-bounded chunk planning (flat or smart)
 * - Bounded parallel dispatch with dynamic bandwidth sharing
 * - Retry with exponential backoff and crash resume via checkpoints
 * - VSS snapshots (local and remote-over-UNC) exposed through junctions
 * - Drive-letter mounting for UNC paths in non-interactive sessions
 * - Health file and failed-files reporting for external monitors
 */

pub mod checkpoint;
pub mod config;
pub mod copier;
pub mod error;
pub mod health;
pub mod logging;
pub mod mount;
pub mod orchestrator;
pub mod persist;
pub mod planner;
pub mod report;
pub mod safety;
pub mod scanner;
pub mod schedule;
pub mod state;
pub mod vss;

// Re-export the types most embedders touch
pub use checkpoint::{Checkpoint, CheckpointStore};
pub use config::{
    ChunkLimits, Config, CopyOptions, Credential, GlobalSettings, MismatchSeverity, Profile,
    ScanMode,
};
pub use copier::{
    build_args, compute_ipg, interpret_exit_code, parse_log, ExitAnalysis, JobLauncher,
    LaunchRequest, LogStats, ProgressBuffer, RobocopyLauncher, RunningCopier, Severity,
};
pub use error::{RobocurseError, Result};
pub use health::{read_health, HealthStatus, HealthWriter};
pub use mount::{MountCoordinator, MountRecord, UncPath};
pub use orchestrator::{Callbacks, Orchestrator, RunEvent, RunOptions, TICK_INTERVAL};
pub use planner::{Chunk, ChunkId, ChunkIdGen, ChunkPlanner, ChunkStatus};
pub use scanner::{DirProfile, DirStats, DirectoryProfiler};
pub use state::{Phase, ProfileResult, ProgressSnapshot, SharedState};
pub use vss::{SnapshotRecord, VssCoordinator};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
