/*!
 * VSS snapshot coordination
 *
 * Creates point-in-time shadows of source volumes (local or on a remote
 * server reached over UNC), exposes them to the copier through directory
 * junctions, and guarantees cleanup: junction first, then snapshot, with a
 * crash-surviving registry driving orphan recovery at startup.
 */

pub mod backend;
pub mod registry;

use std::path::{Component, Path, PathBuf, Prefix};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tempfile::TempDir;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Credential;
use crate::error::{RobocurseError, Result};
use crate::mount::UncPath;

pub use backend::{platform_backend, ShadowBackend, ShadowInfo, REMOTE_CALL_TIMEOUT};
pub use registry::{SnapshotRecord, SnapshotRegistry, VSS_REGISTRY_FILE};

/// Warn when the volume's shadow storage headroom falls below this.
const LOW_HEADROOM_BYTES: u64 = 1024 * 1024 * 1024;

/// How a snapshot is exposed to the copier
#[derive(Debug)]
enum JunctionKind {
    Local {
        path: PathBuf,
        /// Keeps the junction's parent directory alive until teardown
        _parent: TempDir,
    },
    Remote {
        server: String,
        /// Junction path as seen on the server's filesystem
        junction_local: String,
        credential: Option<Credential>,
    },
}

/// A live snapshot with its junction, returned to the orchestrator
#[derive(Debug)]
pub struct ActiveSnapshot {
    pub record: SnapshotRecord,
    /// Path the copier reads instead of the live source
    pub read_path: PathBuf,
    junction: JunctionKind,
}

impl ActiveSnapshot {
    pub fn shadow_id(&self) -> &str {
        &self.record.shadow_id
    }
}

pub struct VssCoordinator {
    backend: Box<dyn ShadowBackend>,
    registry: SnapshotRegistry,
    retry_attempts: u32,
    retry_delay: Duration,
    cancel: Arc<AtomicBool>,
}

impl VssCoordinator {
    pub fn new(backend: Box<dyn ShadowBackend>, state_dir: &Path) -> Self {
        Self {
            backend,
            registry: SnapshotRegistry::new(state_dir),
            retry_attempts: 3,
            retry_delay: Duration::from_secs(5),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Share a cancellation flag so a stop request interrupts retry waits.
    pub fn with_cancel_flag(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    #[cfg(test)]
    pub(crate) fn with_retry_policy(mut self, attempts: u32, delay: Duration) -> Self {
        self.retry_attempts = attempts;
        self.retry_delay = delay;
        self
    }

    pub fn registry(&self) -> &SnapshotRegistry {
        &self.registry
    }

    /// Snapshot a local drive-letter source and expose it via a junction.
    pub fn create_local(&self, source: &Path) -> Result<ActiveSnapshot> {
        let volume = volume_of(source)?;
        self.backend.check_privileges()?;

        if let Some(headroom) = self.backend.storage_headroom(&volume)? {
            if headroom < LOW_HEADROOM_BYTES {
                warn!(volume = %volume, headroom, "shadow storage is tight");
            }
        }

        let shadow = self.create_with_retry(|| self.backend.create_shadow(&volume))?;

        // The junction lives in a scratch directory; the copier reads the
        // source-relative subtree through it.
        let parent = tempfile::Builder::new()
            .prefix("robocurse-vss-")
            .tempdir()
            .map_err(|e| RobocurseError::VssPermanent(format!("junction scratch dir: {}", e)))?;
        let junction = parent.path().join("snapshot");
        self.backend
            .create_junction(&junction, &shadow.shadow_path)?;

        let relative = subpath_within_volume(source);
        let read_path = match relative {
            Some(rel) => junction.join(rel),
            None => junction.clone(),
        };

        let record = SnapshotRecord {
            shadow_id: shadow.shadow_id.clone(),
            source_volume: volume,
            shadow_path: shadow.shadow_path,
            created_at: Utc::now(),
            is_remote: false,
            server_name: None,
            share_name: None,
            share_local_path: None,
            junction_path: Some(junction.to_string_lossy().into_owned()),
        };
        self.registry.add(record.clone())?;
        info!(shadow_id = %record.shadow_id, source = %source.display(), "local snapshot ready");

        Ok(ActiveSnapshot {
            record,
            read_path,
            junction: JunctionKind::Local {
                path: junction,
                _parent: parent,
            },
        })
    }

    /// Snapshot the volume backing a UNC share on a remote server. The
    /// junction is created inside the share so clients reach the snapshot
    /// through the existing share path.
    pub fn create_remote(
        &self,
        unc: &Path,
        credential: Option<&Credential>,
    ) -> Result<ActiveSnapshot> {
        let parsed = UncPath::parse(unc)?;

        let share_local =
            self.backend
                .resolve_share(&parsed.server, &parsed.share, credential)?;
        let volume = volume_of(Path::new(&share_local))?;

        let shadow = self.create_with_retry(|| {
            self.backend
                .create_remote_shadow(&parsed.server, &volume, credential)
        })?;

        let junction_name = format!(".robocurse-vss-{}", short_hex());
        let junction_local = join_windows(&share_local, &junction_name);
        // Target is the share's subtree inside the shadow device.
        let share_in_shadow = match subpath_within_volume(Path::new(&share_local)) {
            Some(rel) => join_windows(&shadow.shadow_path, &rel.to_string_lossy()),
            None => shadow.shadow_path.clone(),
        };

        self.backend.remote_exec(
            &parsed.server,
            &format!("mklink /J \"{}\" \"{}\"", junction_local, share_in_shadow),
            credential,
            REMOTE_CALL_TIMEOUT,
        )?;

        let mut read_path = PathBuf::from(format!(
            r"\\{}\{}\{}",
            parsed.server, parsed.share, junction_name
        ));
        if let Some(rel) = &parsed.relative {
            read_path = read_path.join(rel);
        }

        let record = SnapshotRecord {
            shadow_id: shadow.shadow_id.clone(),
            source_volume: format!("{}:{}", parsed.server, volume),
            shadow_path: shadow.shadow_path,
            created_at: Utc::now(),
            is_remote: true,
            server_name: Some(parsed.server.clone()),
            share_name: Some(parsed.share.clone()),
            share_local_path: Some(share_local),
            junction_path: Some(junction_local.clone()),
        };
        self.registry.add(record.clone())?;
        info!(shadow_id = %record.shadow_id, server = %parsed.server, "remote snapshot ready");

        Ok(ActiveSnapshot {
            record,
            read_path,
            junction: JunctionKind::Remote {
                server: parsed.server,
                junction_local,
                credential: credential.cloned(),
            },
        })
    }

    /// Tear a snapshot down: junction first, then the shadow itself.
    /// Deleting in the other order leaks the junction.
    pub fn teardown(&self, snapshot: ActiveSnapshot) -> Result<()> {
        match &snapshot.junction {
            JunctionKind::Local { path, _parent: _ } => {
                if let Err(e) = self.backend.remove_junction(path) {
                    warn!(junction = %path.display(), error = %e, "junction removal failed");
                }
            }
            JunctionKind::Remote {
                server,
                junction_local,
                credential,
            } => {
                let command = format!("rmdir \"{}\"", junction_local);
                if let Err(e) = self.backend.remote_exec(
                    server,
                    &command,
                    credential.as_ref(),
                    REMOTE_CALL_TIMEOUT,
                ) {
                    warn!(junction = %junction_local, error = %e, "remote junction removal failed");
                }
            }
        }

        let delete_result = if snapshot.record.is_remote {
            let server = snapshot.record.server_name.as_deref().unwrap_or_default();
            let credential = match &snapshot.junction {
                JunctionKind::Remote { credential, .. } => credential.as_ref(),
                JunctionKind::Local { .. } => None,
            };
            self.backend
                .delete_remote_shadow(server, &snapshot.record.shadow_id, credential)
        } else {
            self.backend.delete_shadow(&snapshot.record.shadow_id)
        };

        match delete_result {
            Ok(()) => {
                self.registry.remove(&snapshot.record.shadow_id)?;
                debug!(shadow_id = %snapshot.record.shadow_id, "snapshot deleted");
                Ok(())
            }
            Err(e) => {
                // The registry entry stays, so the next startup retries.
                warn!(shadow_id = %snapshot.record.shadow_id, error = %e, "snapshot deletion failed");
                Err(e)
            }
        }
    }

    /// Delete all but the newest `keep` snapshots this tool created on the
    /// given volume key. Snapshots created by anything else never count.
    pub fn apply_retention(&self, source_volume: &str, keep: usize) -> (usize, Vec<String>) {
        let tracked = self.registry.for_volume(source_volume);
        let listed = match self.backend.list_shadows(source_volume) {
            Ok(ids) => ids,
            Err(e) => {
                return (0, vec![format!("listing {}: {}", source_volume, e)]);
            }
        };

        let candidates: Vec<&SnapshotRecord> = tracked
            .iter()
            .filter(|record| listed.iter().any(|id| id == &record.shadow_id))
            .collect();

        let mut deleted = 0;
        let mut errors = Vec::new();
        let excess = candidates.len().saturating_sub(keep);
        for record in candidates.into_iter().take(excess) {
            let result = if record.is_remote {
                self.backend.delete_remote_shadow(
                    record.server_name.as_deref().unwrap_or_default(),
                    &record.shadow_id,
                    None,
                )
            } else {
                self.backend.delete_shadow(&record.shadow_id)
            };
            match result {
                Ok(()) => {
                    if let Err(e) = self.registry.remove(&record.shadow_id) {
                        errors.push(format!("untracking {}: {}", record.shadow_id, e));
                    }
                    deleted += 1;
                }
                Err(e) => {
                    // Failed entries stay tracked for the next invocation.
                    errors.push(format!("deleting {}: {}", record.shadow_id, e));
                }
            }
        }

        (deleted, errors)
    }

    /// Delete snapshots left behind by a crashed prior run. Successful
    /// deletions leave the registry; failures stay for the next attempt.
    pub fn recover_orphans(&self) -> usize {
        let mut recovered = 0;
        for record in self.registry.load() {
            info!(shadow_id = %record.shadow_id, "recovering orphaned snapshot");

            if let Some(junction) = &record.junction_path {
                let removal = if record.is_remote {
                    self.backend.remote_exec(
                        record.server_name.as_deref().unwrap_or_default(),
                        &format!("rmdir \"{}\"", junction),
                        None,
                        REMOTE_CALL_TIMEOUT,
                    )
                    .map(|_| ())
                } else {
                    self.backend.remove_junction(Path::new(junction))
                };
                if let Err(e) = removal {
                    warn!(junction = %junction, error = %e, "orphan junction removal failed");
                }
            }

            let deletion = if record.is_remote {
                self.backend.delete_remote_shadow(
                    record.server_name.as_deref().unwrap_or_default(),
                    &record.shadow_id,
                    None,
                )
            } else {
                self.backend.delete_shadow(&record.shadow_id)
            };

            match deletion {
                Ok(()) => {
                    let _ = self.registry.remove(&record.shadow_id);
                    recovered += 1;
                }
                Err(e) => {
                    warn!(shadow_id = %record.shadow_id, error = %e, "orphan deletion failed; kept for retry");
                }
            }
        }
        recovered
    }

    fn create_with_retry<F>(&self, mut create: F) -> Result<ShadowInfo>
    where
        F: FnMut() -> Result<ShadowInfo>,
    {
        let mut attempt = 1;
        loop {
            match create() {
                Ok(shadow) => return Ok(shadow),
                Err(e) if e.is_transient() && attempt < self.retry_attempts => {
                    warn!(attempt, error = %e, "snapshot creation failed; retrying");
                    if self.cancel.load(Ordering::Acquire) {
                        return Err(e);
                    }
                    std::thread::sleep(self.retry_delay);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Extract the `D:` volume designator from a drive-letter path.
pub fn volume_of(path: &Path) -> Result<String> {
    if let Some(Component::Prefix(prefix)) = path.components().next() {
        if let Prefix::Disk(letter) | Prefix::VerbatimDisk(letter) = prefix.kind() {
            return Ok(format!("{}:", (letter as char).to_ascii_uppercase()));
        }
    }
    // On non-Windows hosts drive-letter paths are plain strings; parse the
    // designator textually so coordinator logic stays testable anywhere.
    let text = path.to_string_lossy();
    let bytes = text.as_bytes();
    if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
        return Ok(format!("{}:", (bytes[0] as char).to_ascii_uppercase()));
    }
    Err(RobocurseError::VssPermanent(format!(
        "{} is not a local drive-letter path",
        path.display()
    )))
}

/// The portion of a drive-letter path below the volume root.
fn subpath_within_volume(path: &Path) -> Option<PathBuf> {
    let text = path.to_string_lossy();
    let rest = text.get(2..)?.trim_start_matches(['\\', '/']);
    if rest.is_empty() {
        None
    } else {
        Some(PathBuf::from(rest))
    }
}

fn join_windows(base: &str, leaf: &str) -> String {
    format!("{}\\{}", base.trim_end_matches('\\'), leaf)
}

fn short_hex() -> String {
    Uuid::new_v4().simple().to_string()[..16].to_string()
}
