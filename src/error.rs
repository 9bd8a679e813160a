/*!
 * Error types for Robocurse
 */

use std::fmt;
use std::io;
use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, RobocurseError>;

#[derive(Debug)]
pub enum RobocurseError {
    /// Input rejected by the safety validator
    UnsafeInput(String),

    /// The copier binary could not be located
    CopierNotFound,

    /// The security context lacks rights for shadow-copy operations
    InsufficientPrivileges(String),

    /// Transient shadow-copy failure (busy, locked, timeout, storage pressure)
    VssTransient(String),

    /// Permanent shadow-copy failure (unsupported volume, invalid path)
    VssPermanent(String),

    /// Drive-letter allocator could not be acquired within its deadline
    MountContention,

    /// A mount was created but could not be read back
    MountUnverifiable { letter: char, root: String },

    /// UNC path used in a non-interactive session without a credential
    UncRequiresCredential(PathBuf),

    /// Copier exit analysis says the chunk is worth retrying
    CopierRetryable { exit_code: u32, message: String },

    /// Copier failed terminally or retries were exhausted
    CopierTerminal { exit_code: u32, message: String },

    /// Failure launching the copier process
    Launch(String),

    /// A process did not exit within its deadline
    Timeout { seconds: u64 },

    /// Checkpoint file could not be read or written
    CheckpointIo(String),

    /// Health file could not be written
    HealthIo(String),

    /// Configuration rejected before the run started
    ConfigInvalid(String),

    /// Scheduled-task registration failure
    Schedule(String),

    /// Operation requires a platform facility that is unavailable here
    Unsupported(String),

    /// I/O error
    Io(io::Error),

    /// Generic error with message
    Other(String),
}

impl RobocurseError {
    /// Errors that abort the entire run before or during dispatch.
    pub fn aborts_run(&self) -> bool {
        matches!(
            self,
            RobocurseError::CopierNotFound
                | RobocurseError::ConfigInvalid(_)
                | RobocurseError::MountContention
        )
    }

    /// Transient errors worth retrying at the single retry site.
    pub fn is_transient(&self) -> bool {
        match self {
            RobocurseError::VssTransient(_) => true,
            RobocurseError::CopierRetryable { .. } => true,
            RobocurseError::Launch(_) => true,
            RobocurseError::Io(io_err) => Self::is_io_transient(io_err),
            _ => false,
        }
    }

    fn is_io_transient(io_err: &io::Error) -> bool {
        use io::ErrorKind::*;
        matches!(
            io_err.kind(),
            ConnectionRefused
                | ConnectionReset
                | ConnectionAborted
                | NotConnected
                | BrokenPipe
                | TimedOut
                | Interrupted
                | WouldBlock
        )
    }

    /// Warnings that are recorded but never stop the run.
    pub fn is_advisory(&self) -> bool {
        matches!(
            self,
            RobocurseError::CheckpointIo(_) | RobocurseError::HealthIo(_)
        )
    }

    /// Process exit code for the CLI surface.
    pub fn exit_code(&self) -> i32 {
        match self {
            RobocurseError::ConfigInvalid(_) => 2,
            RobocurseError::CopierNotFound => 3,
            RobocurseError::Unsupported(_) => 4,
            _ => 1,
        }
    }
}

impl fmt::Display for RobocurseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RobocurseError::UnsafeInput(what) => {
                write!(f, "Unsafe input rejected: {}", what)
            }
            RobocurseError::CopierNotFound => {
                write!(
                    f,
                    "Copier binary not found (override, system directory, and PATH all missed)"
                )
            }
            RobocurseError::InsufficientPrivileges(msg) => {
                write!(f, "Insufficient privileges for shadow copies: {}", msg)
            }
            RobocurseError::VssTransient(msg) => {
                write!(f, "Transient shadow-copy failure: {}", msg)
            }
            RobocurseError::VssPermanent(msg) => {
                write!(f, "Shadow-copy failure: {}", msg)
            }
            RobocurseError::MountContention => {
                write!(f, "Timed out waiting for the drive-letter allocation mutex")
            }
            RobocurseError::MountUnverifiable { letter, root } => {
                write!(f, "Mount {}: -> {} is not readable; removed", letter, root)
            }
            RobocurseError::UncRequiresCredential(path) => {
                write!(
                    f,
                    "UNC path {} requires an explicit credential in a non-interactive session",
                    path.display()
                )
            }
            RobocurseError::CopierRetryable { exit_code, message } => {
                write!(f, "Copier exited {} (retryable): {}", exit_code, message)
            }
            RobocurseError::CopierTerminal { exit_code, message } => {
                write!(f, "Copier exited {}: {}", exit_code, message)
            }
            RobocurseError::Launch(msg) => {
                write!(f, "Failed to launch copier: {}", msg)
            }
            RobocurseError::Timeout { seconds } => {
                write!(f, "Process did not exit within {} s; killed", seconds)
            }
            RobocurseError::CheckpointIo(msg) => {
                write!(f, "Checkpoint I/O error: {}", msg)
            }
            RobocurseError::HealthIo(msg) => {
                write!(f, "Health file I/O error: {}", msg)
            }
            RobocurseError::ConfigInvalid(msg) => {
                write!(f, "Invalid configuration: {}", msg)
            }
            RobocurseError::Schedule(msg) => {
                write!(f, "Scheduler operation failed: {}", msg)
            }
            RobocurseError::Unsupported(msg) => {
                write!(f, "Unsupported on this platform: {}", msg)
            }
            RobocurseError::Io(err) => {
                write!(f, "I/O error: {}", err)
            }
            RobocurseError::Other(msg) => {
                write!(f, "{}", msg)
            }
        }
    }
}

impl std::error::Error for RobocurseError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RobocurseError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for RobocurseError {
    fn from(err: io::Error) -> Self {
        RobocurseError::Io(err)
    }
}

impl From<serde_json::Error> for RobocurseError {
    fn from(err: serde_json::Error) -> Self {
        RobocurseError::ConfigInvalid(format!("JSON error: {}", err))
    }
}
