/*!
 * Health / liveness surface
 *
 * An atomically rewritten JSON file external monitors can poll. Writes are
 * throttled to the configured interval; readers supply a staleness
 * threshold and derive unhealthiness from an old timestamp.
 */

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{RobocurseError, Result};
use crate::persist;

pub const HEALTH_FILE: &str = "robocurse-health.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub timestamp: DateTime<Utc>,
    pub phase: String,
    pub profile_name: Option<String>,
    pub profile_index: usize,
    pub chunks_completed: u64,
    pub chunks_total: u64,
    pub chunks_pending: u64,
    pub chunks_failed: u64,
    pub active_jobs: usize,
    pub bytes_completed: u64,
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta_seconds: Option<u64>,
    pub healthy: bool,
    pub message: String,
}

/// Throttled writer bound to one run
pub struct HealthWriter {
    path: PathBuf,
    interval: Duration,
    last_write: Option<Instant>,
}

impl HealthWriter {
    pub fn new(state_dir: &Path, interval: Duration) -> Self {
        Self {
            path: state_dir.join(HEALTH_FILE),
            interval,
            last_write: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write if the interval has elapsed since the last write.
    pub fn maybe_write(&mut self, status: &HealthStatus) -> Result<bool> {
        let due = match self.last_write {
            Some(last) => last.elapsed() >= self.interval,
            None => true,
        };
        if !due {
            return Ok(false);
        }
        self.flush(status)?;
        Ok(true)
    }

    /// Unconditional write (terminal phases).
    pub fn flush(&mut self, status: &HealthStatus) -> Result<()> {
        persist::write_json_atomic(&self.path, status)
            .map_err(|e| RobocurseError::HealthIo(e.to_string()))?;
        self.last_write = Some(Instant::now());
        Ok(())
    }
}

/// Read a health file for external probing.
///
/// A timestamp older than `staleness` marks the status unhealthy even if
/// the writer left `healthy: true` behind.
pub fn read_health(path: &Path, staleness: Duration) -> Result<Option<HealthStatus>> {
    let Some(mut status) = persist::read_json::<HealthStatus>(path)? else {
        return Ok(None);
    };

    let age = Utc::now().signed_duration_since(status.timestamp);
    if age.num_seconds() >= 0 && age.num_seconds() as u64 > staleness.as_secs() {
        status.healthy = false;
        status.message = format!("stale: last update {} s ago", age.num_seconds());
    }

    Ok(Some(status))
}
