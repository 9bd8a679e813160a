/*!
 * Crash-resume checkpoints
 *
 * Periodically written during a run and consulted at the next start: any
 * chunk whose source path appears in the checkpoint is skipped instead of
 * re-copied. Comparison is case-insensitive to match Windows paths.
 */

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{RobocurseError, Result};
use crate::persist;
use crate::planner::Chunk;

pub const CHECKPOINT_FILE: &str = "robocurse-checkpoint.json";
const CHECKPOINT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    pub session_id: String,
    pub saved_at: DateTime<Utc>,
    pub profile_index: usize,
    pub profile_name: String,
    /// Source paths of chunks completed so far, original casing preserved
    pub completed_sources: Vec<String>,
    pub completed_count: u64,
    pub bytes_complete: u64,
    pub started_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(session_id: String, started_at: DateTime<Utc>) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            session_id,
            saved_at: Utc::now(),
            profile_index: 0,
            profile_name: String::new(),
            completed_sources: Vec::new(),
            completed_count: 0,
            bytes_complete: 0,
            started_at,
        }
    }

    /// Case-insensitive membership test for a chunk's source path.
    pub fn is_completed(&self, chunk: &Chunk) -> bool {
        let source = chunk.source.to_string_lossy().to_lowercase();
        self.completed_sources
            .iter()
            .any(|done| done.to_lowercase() == source)
    }
}

/// Checkpoint file bound to one state directory
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            path: state_dir.join(CHECKPOINT_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist atomically. Failures are advisory: the run continues.
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        persist::write_json_atomic(&self.path, checkpoint)
            .map_err(|e| RobocurseError::CheckpointIo(e.to_string()))
    }

    /// Load the checkpoint if one exists and is readable. A corrupt file
    /// is logged and treated as absent rather than blocking the run.
    pub fn load(&self) -> Option<Checkpoint> {
        match persist::read_json::<Checkpoint>(&self.path) {
            Ok(Some(checkpoint)) if checkpoint.version == CHECKPOINT_VERSION => Some(checkpoint),
            Ok(Some(checkpoint)) => {
                warn!(
                    version = checkpoint.version,
                    "ignoring checkpoint with unknown version"
                );
                None
            }
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "ignoring unreadable checkpoint");
                None
            }
        }
    }

    /// Delete on clean completion.
    pub fn remove(&self) -> Result<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)
                .map_err(|e| RobocurseError::CheckpointIo(e.to_string()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::ChunkStatus;
    use tempfile::tempdir;

    fn chunk_for(source: &str) -> Chunk {
        Chunk {
            id: 0,
            source: PathBuf::from(source),
            destination: PathBuf::from("dst"),
            estimated_bytes: 0,
            estimated_files: 0,
            extra_args: Vec::new(),
            retry_count: 0,
            retry_after: None,
            status: ChunkStatus::Pending,
        }
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());

        let mut checkpoint = Checkpoint::new("session-1".to_string(), Utc::now());
        checkpoint.profile_index = 2;
        checkpoint.profile_name = "projects".to_string();
        checkpoint.completed_sources = vec![r"D:\Data\alpha".to_string()];
        checkpoint.completed_count = 1;
        checkpoint.bytes_complete = 600;

        store.save(&checkpoint).unwrap();
        let loaded = store.load().unwrap();

        assert_eq!(loaded.session_id, "session-1");
        assert_eq!(loaded.profile_index, 2);
        assert_eq!(loaded.completed_sources.len(), 1);
        assert_eq!(loaded.bytes_complete, 600);
    }

    #[test]
    fn test_load_missing_returns_none() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        assert!(store.load().is_none());
    }

    #[test]
    fn test_corrupt_checkpoint_treated_as_absent() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        std::fs::write(store.path(), b"{ not json").unwrap();
        assert!(store.load().is_none());
    }

    #[test]
    fn test_remove_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        store.remove().unwrap();

        store
            .save(&Checkpoint::new("s".to_string(), Utc::now()))
            .unwrap();
        store.remove().unwrap();
        assert!(store.load().is_none());
        store.remove().unwrap();
    }

    #[test]
    fn test_completed_match_is_case_insensitive() {
        let mut checkpoint = Checkpoint::new("s".to_string(), Utc::now());
        checkpoint.completed_sources = vec![r"D:\Data\Alpha".to_string()];

        assert!(checkpoint.is_completed(&chunk_for(r"d:\data\ALPHA")));
        assert!(checkpoint.is_completed(&chunk_for(r"D:\Data\Alpha")));
        assert!(!checkpoint.is_completed(&chunk_for(r"D:\Data\Beta")));
    }
}
