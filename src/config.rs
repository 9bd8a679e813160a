/*!
 * Configuration structures and defaults for Robocurse
 *
 * The configuration file is a read-only JSON input carrying a list of
 * replication profiles plus global engine settings. Unknown keys are a
 * configuration error so stale or misspelled fields never silently
 * change behavior.
 */

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{RobocurseError, Result};

/// How a profile's source tree is partitioned into chunks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanMode {
    /// One chunk per top-level child, merging small siblings
    Flat,
    /// Recursive descent until a subtree fits the chunk bounds
    Smart,
}

impl Default for ScanMode {
    fn default() -> Self {
        Self::Smart
    }
}

/// How a mismatch exit bit (robocopy bit 2) is treated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MismatchSeverity {
    /// Log and continue (default)
    Warning,
    /// Treat the chunk as failed and retry it
    Error,
    /// Ignore entirely
    Ignore,
}

impl Default for MismatchSeverity {
    fn default() -> Self {
        Self::Warning
    }
}

/// Explicit credential for UNC sources/destinations and remote snapshots
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

/// Upper bounds for a single chunk of copy work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ChunkLimits {
    /// Maximum estimated bytes per chunk
    pub max_bytes: u64,
    /// Maximum file count per chunk
    pub max_files: u64,
    /// Maximum planner descent depth below the source root
    pub max_depth: u32,
}

impl Default for ChunkLimits {
    fn default() -> Self {
        Self {
            max_bytes: 2 * 1024 * 1024 * 1024,
            max_files: 50_000,
            max_depth: 4,
        }
    }
}

/// Recognized copier option bundle for a profile
///
/// Every field the engine honors is enumerated here; free-form switches go
/// through `switches` and are whitelist-validated before launch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CopyOptions {
    /// Extra copier switches (sanitized, managed switches stripped)
    pub switches: Vec<String>,
    /// `/XF` exclude file patterns
    pub exclude_files: Vec<String>,
    /// `/XD` exclude directory patterns
    pub exclude_dirs: Vec<String>,
    /// Copy-including-empty instead of mirror-with-delete
    pub no_mirror: bool,
    /// Emit `/XJD /XJF` to skip junctions
    pub skip_junctions: bool,
    /// Per-file copier retries (`/R:<n>`)
    pub retry_count: u32,
    /// Seconds between per-file copier retries (`/W:<n>`)
    pub retry_wait_secs: u32,
    /// Fixed inter-packet gap override in milliseconds (0 = dynamic)
    pub inter_packet_gap_ms: u32,
    /// Mismatch handling for this option bundle
    pub mismatch_severity: MismatchSeverity,
}

impl Default for CopyOptions {
    fn default() -> Self {
        Self {
            switches: Vec::new(),
            exclude_files: Vec::new(),
            exclude_dirs: Vec::new(),
            no_mirror: false,
            skip_junctions: true,
            retry_count: 2,
            retry_wait_secs: 5,
            inter_packet_gap_ms: 0,
            mismatch_severity: MismatchSeverity::Warning,
        }
    }
}

/// One source→destination replication definition
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Profile {
    pub name: String,
    pub source: PathBuf,
    pub destination: PathBuf,

    #[serde(default)]
    pub scan_mode: ScanMode,

    #[serde(default)]
    pub chunk_limits: ChunkLimits,

    #[serde(default)]
    pub options: CopyOptions,

    /// Copy from a point-in-time shadow of the source
    #[serde(default)]
    pub use_vss: bool,

    /// Per-profile override of the global mismatch severity
    #[serde(default)]
    pub mismatch_severity: Option<MismatchSeverity>,

    /// Credential for UNC paths and remote snapshot sessions
    #[serde(default)]
    pub credential: Option<Credential>,
}

impl Profile {
    /// Effective mismatch severity: profile override, then option bundle.
    pub fn effective_mismatch_severity(&self, global: MismatchSeverity) -> MismatchSeverity {
        self.mismatch_severity.unwrap_or(if self.options.mismatch_severity
            == MismatchSeverity::default()
        {
            global
        } else {
            self.options.mismatch_severity
        })
    }

    /// Whether source or destination is a `\\server\share` path.
    pub fn touches_network(&self) -> bool {
        is_unc_path(&self.source) || is_unc_path(&self.destination)
    }
}

/// Returns true for `\\server\share\...` paths.
pub fn is_unc_path(path: &Path) -> bool {
    let text = path.to_string_lossy();
    text.starts_with(r"\\") && !text.starts_with(r"\\?\")
}

/// Global engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct GlobalSettings {
    /// Simultaneous copier processes (1..=128)
    pub max_concurrent_jobs: u32,
    /// Copier threads per process, `/MT:<n>` (1..=128)
    pub threads_per_job: u32,
    /// Aggregate bandwidth ceiling in Mbps; 0 disables throttling (0..=10000)
    pub bandwidth_limit_mbps: u32,
    /// Default mismatch handling when profiles don't override it
    pub default_mismatch_severity: MismatchSeverity,
    /// Chunk-level retry cap before a chunk fails terminally
    pub max_chunk_retries: u32,
    /// Retry backoff base in seconds
    pub retry_backoff_base_secs: u64,
    /// Retry backoff multiplier
    pub retry_backoff_multiplier: u64,
    /// Retry backoff ceiling in seconds
    pub retry_backoff_max_secs: u64,
    /// Save a checkpoint every N completed chunks
    pub checkpoint_every_chunks: u64,
    /// Minimum seconds between health-file rewrites
    pub health_interval_secs: u64,
    /// Explicit copier binary override
    pub copier_path: Option<PathBuf>,
    /// State directory override (checkpoints, tracking files, job logs)
    pub state_dir: Option<PathBuf>,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 8,
            threads_per_job: 16,
            bandwidth_limit_mbps: 0,
            default_mismatch_severity: MismatchSeverity::Warning,
            max_chunk_retries: 3,
            retry_backoff_base_secs: 5,
            retry_backoff_multiplier: 2,
            retry_backoff_max_secs: 120,
            checkpoint_every_chunks: 10,
            health_interval_secs: 10,
            copier_path: None,
            state_dir: None,
        }
    }
}

/// Top-level configuration file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub profiles: Vec<Profile>,

    #[serde(default)]
    pub settings: GlobalSettings,
}

impl Config {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            RobocurseError::ConfigInvalid(format!(
                "failed to read {}: {}",
                path.display(),
                e
            ))
        })?;

        let config: Config = serde_json::from_str(&content)
            .map_err(|e| RobocurseError::ConfigInvalid(format!("failed to parse: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Range and sanity checks, run before any work starts.
    pub fn validate(&self) -> Result<()> {
        let s = &self.settings;

        if self.profiles.is_empty() {
            return Err(RobocurseError::ConfigInvalid(
                "no profiles defined".to_string(),
            ));
        }
        if !(1..=128).contains(&s.max_concurrent_jobs) {
            return Err(RobocurseError::ConfigInvalid(format!(
                "max_concurrent_jobs must be 1..=128, got {}",
                s.max_concurrent_jobs
            )));
        }
        if !(1..=128).contains(&s.threads_per_job) {
            return Err(RobocurseError::ConfigInvalid(format!(
                "threads_per_job must be 1..=128, got {}",
                s.threads_per_job
            )));
        }
        if s.bandwidth_limit_mbps > 10_000 {
            return Err(RobocurseError::ConfigInvalid(format!(
                "bandwidth_limit_mbps must be 0..=10000, got {}",
                s.bandwidth_limit_mbps
            )));
        }
        if s.checkpoint_every_chunks == 0 {
            return Err(RobocurseError::ConfigInvalid(
                "checkpoint_every_chunks must be at least 1".to_string(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for profile in &self.profiles {
            if profile.name.trim().is_empty() {
                return Err(RobocurseError::ConfigInvalid(
                    "profile with empty name".to_string(),
                ));
            }
            if !seen.insert(profile.name.to_lowercase()) {
                return Err(RobocurseError::ConfigInvalid(format!(
                    "duplicate profile name: {}",
                    profile.name
                )));
            }
            if profile.chunk_limits.max_bytes == 0 || profile.chunk_limits.max_files == 0 {
                return Err(RobocurseError::ConfigInvalid(format!(
                    "profile {}: chunk limits must be nonzero",
                    profile.name
                )));
            }
        }

        Ok(())
    }

    /// Directory holding checkpoints, tracking files, and per-chunk logs.
    pub fn state_dir(&self) -> PathBuf {
        if let Some(ref dir) = self.settings.state_dir {
            return dir.clone();
        }
        default_state_dir()
    }
}

/// Platform data directory fallback for persisted engine state.
pub fn default_state_dir() -> PathBuf {
    let base = std::env::var_os("LOCALAPPDATA")
        .or_else(|| std::env::var_os("XDG_DATA_HOME"))
        .map(PathBuf::from)
        .or_else(|| {
            std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".local/share"))
        })
        .unwrap_or_else(|| PathBuf::from("."));
    base.join("robocurse")
}
