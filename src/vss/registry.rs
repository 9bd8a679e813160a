/*!
 * On-disk snapshot registry
 *
 * Every snapshot this tool creates is tracked from creation until its
 * successful deletion. The registry survives crashes, which is what makes
 * startup orphan recovery possible. Writes replace the file atomically.
 */

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::Result;
use crate::persist;

pub const VSS_REGISTRY_FILE: &str = "vss-active.json";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotRecord {
    pub shadow_id: String,
    /// `D:` for local volumes, `server:D:` for remote ones
    pub source_volume: String,
    /// Device path the snapshot is readable through
    pub shadow_path: String,
    pub created_at: DateTime<Utc>,
    pub is_remote: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub share_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub share_local_path: Option<String>,
    /// Junction exposing this snapshot, recorded for crash cleanup
    #[serde(skip_serializing_if = "Option::is_none")]
    pub junction_path: Option<String>,
}

/// Registry file bound to one state directory
#[derive(Debug, Clone)]
pub struct SnapshotRegistry {
    path: PathBuf,
}

impl SnapshotRegistry {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            path: state_dir.join(VSS_REGISTRY_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Vec<SnapshotRecord> {
        match persist::read_json::<Vec<SnapshotRecord>>(&self.path) {
            Ok(Some(records)) => records,
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!(error = %e, "snapshot registry unreadable; treating as empty");
                Vec::new()
            }
        }
    }

    pub fn add(&self, record: SnapshotRecord) -> Result<()> {
        let mut records = self.load();
        records.retain(|existing| existing.shadow_id != record.shadow_id);
        records.push(record);
        persist::write_json_atomic(&self.path, &records)
    }

    pub fn remove(&self, shadow_id: &str) -> Result<()> {
        let mut records = self.load();
        records.retain(|record| record.shadow_id != shadow_id);
        persist::write_json_atomic(&self.path, &records)
    }

    /// Tracked records for one volume key, oldest first.
    pub fn for_volume(&self, source_volume: &str) -> Vec<SnapshotRecord> {
        let mut records: Vec<SnapshotRecord> = self
            .load()
            .into_iter()
            .filter(|record| record.source_volume.eq_ignore_ascii_case(source_volume))
            .collect();
        records.sort_by_key(|record| record.created_at);
        records
    }
}
