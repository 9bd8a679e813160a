/*!
 * Network mount coordination
 *
 * Maps UNC paths to drive letters for non-interactive sessions where
 * implicit authentication does not propagate to child processes. Letter
 * allocation is serialized across co-resident runs by a cross-process
 * lock, mounts are created with persist semantics so the copier can see
 * them, and every mapping is tracked on disk for crash cleanup.
 */

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::Credential;
use crate::error::{RobocurseError, Result};
use crate::persist;

pub const MOUNT_TRACKING_FILE: &str = "robocurse-mappings-active.json";

/// How long a caller may wait on the drive-letter allocator.
pub const ALLOCATOR_TIMEOUT: Duration = Duration::from_secs(30);

/// A parsed `\\server\share\relative` path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UncPath {
    pub server: String,
    pub share: String,
    pub relative: Option<PathBuf>,
}

impl UncPath {
    pub fn parse(path: &Path) -> Result<UncPath> {
        let text = path.to_string_lossy().replace('/', "\\");
        let stripped = text
            .strip_prefix("\\\\")
            .ok_or_else(|| RobocurseError::Other(format!("not a UNC path: {}", text)))?;

        let mut parts = stripped.splitn(3, '\\');
        let server = parts.next().unwrap_or_default();
        let share = parts.next().unwrap_or_default();
        if server.is_empty() || share.is_empty() {
            return Err(RobocurseError::Other(format!(
                "UNC path missing server or share: {}",
                text
            )));
        }
        let relative = parts
            .next()
            .filter(|rest| !rest.is_empty())
            .map(PathBuf::from);

        Ok(UncPath {
            server: server.to_string(),
            share: share.to_string(),
            relative,
        })
    }

    /// `\\server\share`, the mountable root.
    pub fn root(&self) -> String {
        format!(r"\\{}\{}", self.server, self.share)
    }
}

/// One live drive-letter mapping
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MountRecord {
    pub letter: char,
    pub unc_root: String,
    /// The path the profile asked for
    pub original_path: String,
    /// The same path rewritten through the drive letter
    pub mapped_path: String,
    pub created_at: DateTime<Utc>,
}

/// Result of mounting a profile's source and destination
#[derive(Debug, Clone, Default)]
pub struct MountSet {
    pub records: Vec<MountRecord>,
    pub effective_source: Option<PathBuf>,
    pub effective_destination: Option<PathBuf>,
}

/// Platform operations behind the coordinator
pub trait MountBackend: Send + Sync {
    /// Letters currently mapped or otherwise in use.
    fn used_letters(&self) -> Result<Vec<char>>;

    /// Letters appearing in the remembered SMB mapping list, including
    /// disconnected ones that would silently reconnect.
    fn remembered_letters(&self) -> Result<Vec<char>>;

    /// Map with persist semantics so external processes see the drive.
    fn map(&self, letter: char, unc_root: &str, credential: Option<&Credential>) -> Result<()>;

    /// Remove a mapping, preferring the forget-remembered form.
    fn unmap(&self, letter: char) -> Result<()>;

    /// The UNC root a letter currently points at, if any.
    fn current_target(&self, letter: char) -> Result<Option<String>>;

    /// Enumerate one entry from the drive root to prove the mount works.
    fn probe(&self, root: &Path) -> Result<()>;
}

/// Cross-process allocation lock seam. Production uses a named mutex; the
/// in-memory form covers tests and single-process embedding.
pub trait AllocatorLock: Send + Sync {
    fn acquire(&self, timeout: Duration) -> Result<Box<dyn AllocatorGuard + '_>>;
}

pub trait AllocatorGuard: std::fmt::Debug {}

/// Single-process lock over a parking_lot mutex
#[derive(Default)]
pub struct LocalAllocatorLock {
    inner: Mutex<()>,
}

impl LocalAllocatorLock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AllocatorLock for LocalAllocatorLock {
    fn acquire(&self, timeout: Duration) -> Result<Box<dyn AllocatorGuard + '_>> {
        match self.inner.try_lock_for(timeout) {
            Some(guard) => Ok(Box::new(LocalGuard(guard))),
            None => Err(RobocurseError::MountContention),
        }
    }
}

#[derive(Debug)]
struct LocalGuard<'a>(#[allow(dead_code)] parking_lot::MutexGuard<'a, ()>);

impl AllocatorGuard for LocalGuard<'_> {}

#[cfg(windows)]
pub use windows_lock::NamedAllocatorLock;

/// Construct the platform allocation lock.
pub fn platform_lock() -> Box<dyn AllocatorLock> {
    #[cfg(windows)]
    {
        Box::new(NamedAllocatorLock::new("Global\\RobocurseDriveAllocator"))
    }
    #[cfg(not(windows))]
    {
        Box::new(LocalAllocatorLock::new())
    }
}

pub struct MountCoordinator {
    backend: Box<dyn MountBackend>,
    lock: Box<dyn AllocatorLock>,
    tracking_path: PathBuf,
    /// Letters this process is currently allocating
    reserved: Mutex<HashSet<char>>,
}

impl MountCoordinator {
    pub fn new(
        backend: Box<dyn MountBackend>,
        lock: Box<dyn AllocatorLock>,
        state_dir: &Path,
    ) -> Self {
        Self {
            backend,
            lock,
            tracking_path: state_dir.join(MOUNT_TRACKING_FILE),
            reserved: Mutex::new(HashSet::new()),
        }
    }

    pub fn tracking_path(&self) -> &Path {
        &self.tracking_path
    }

    fn load_tracking(&self) -> Vec<MountRecord> {
        match persist::read_json::<Vec<MountRecord>>(&self.tracking_path) {
            Ok(Some(records)) => records,
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!(error = %e, "mount tracking file unreadable; treating as empty");
                Vec::new()
            }
        }
    }

    fn save_tracking(&self, records: &[MountRecord]) -> Result<()> {
        persist::write_json_atomic(&self.tracking_path, &records.to_vec())
    }

    /// Mount whatever is UNC among a profile's source and destination.
    /// When both share a `\\server\share` root, one mapping serves both.
    pub fn mount_profile_paths(
        &self,
        source: &Path,
        destination: &Path,
        credential: Option<&Credential>,
    ) -> Result<MountSet> {
        let mut set = MountSet::default();

        let source_unc = UncPath::parse(source).ok();
        let dest_unc = UncPath::parse(destination).ok();

        if let Some(ref src) = source_unc {
            let record = self.mount_one(src, source, credential)?;
            set.effective_source = Some(PathBuf::from(&record.mapped_path));
            set.records.push(record);
        }

        if let Some(ref dst) = dest_unc {
            let shared = set
                .records
                .iter()
                .find(|record| record.unc_root.eq_ignore_ascii_case(&dst.root()))
                .cloned();
            match shared {
                Some(existing) => {
                    // Same share root: recompute the destination by suffix.
                    let mapped = map_through_letter(existing.letter, dst);
                    set.effective_destination = Some(mapped);
                }
                None => {
                    let record = self.mount_one(dst, destination, credential)?;
                    set.effective_destination = Some(PathBuf::from(&record.mapped_path));
                    set.records.push(record);
                }
            }
        }

        Ok(set)
    }

    /// Mount one UNC root on a fresh drive letter.
    pub fn mount_one(
        &self,
        unc: &UncPath,
        original: &Path,
        credential: Option<&Credential>,
    ) -> Result<MountRecord> {
        let root = unc.root();

        let letter = {
            let _guard = self.lock.acquire(ALLOCATOR_TIMEOUT)?;

            self.drop_stale_mappings(&root);

            let letter = self.select_letter()?;
            self.reserved.lock().insert(letter);

            let mapped = self.backend.map(letter, &root, credential);
            self.reserved.lock().remove(&letter);
            mapped.inspect_err(|_| {
                let _ = self.backend.unmap(letter);
            })?;

            // Tracking is written while the allocator is still held so
            // concurrent runs serialize their updates.
            let mut records = self.load_tracking();
            records.push(MountRecord {
                letter,
                unc_root: root.clone(),
                original_path: original.to_string_lossy().into_owned(),
                mapped_path: map_through_letter(letter, unc).to_string_lossy().into_owned(),
                created_at: Utc::now(),
            });
            self.save_tracking(&records)?;

            letter
        };

        // Verify outside the lock: a lazy mount that never authenticated
        // shows up here, not at map time.
        let drive_root = PathBuf::from(format!(r"{}:\", letter));
        if let Err(e) = self.backend.probe(&drive_root) {
            warn!(letter = %letter, root = %root, error = %e, "mount verification failed; removing");
            let _ = self.backend.unmap(letter);
            self.untrack_letter(letter);
            return Err(RobocurseError::MountUnverifiable {
                letter,
                root,
            });
        }

        info!(letter = %letter, root = %root, "network mount ready");
        Ok(self
            .load_tracking()
            .into_iter()
            .rev()
            .find(|record| record.letter == letter)
            .unwrap_or(MountRecord {
                letter,
                unc_root: root.clone(),
                original_path: original.to_string_lossy().into_owned(),
                mapped_path: map_through_letter(letter, unc).to_string_lossy().into_owned(),
                created_at: Utc::now(),
            }))
    }

    /// Remove the given mappings and their tracking entries.
    pub fn dismount(&self, records: &[MountRecord]) {
        for record in records {
            if let Err(e) = self.backend.unmap(record.letter) {
                warn!(letter = %record.letter, error = %e, "dismount failed");
                continue;
            }
            self.untrack_letter(record.letter);
            debug!(letter = %record.letter, root = %record.unc_root, "dismounted");
        }
    }

    /// Remove mappings left behind by a crashed prior run.
    pub fn recover_orphans(&self) -> usize {
        let records = self.load_tracking();
        if records.is_empty() {
            return 0;
        }

        let mut kept = Vec::new();
        let mut recovered = 0;
        for record in records {
            let still_ours = match self.backend.current_target(record.letter) {
                Ok(Some(target)) => target.eq_ignore_ascii_case(&record.unc_root),
                Ok(None) => false,
                Err(_) => false,
            };
            if !still_ours {
                // The letter was reused or never survived; just untrack it.
                recovered += 1;
                continue;
            }
            match self.backend.unmap(record.letter) {
                Ok(()) => {
                    info!(letter = %record.letter, root = %record.unc_root, "recovered orphaned mount");
                    recovered += 1;
                }
                Err(e) => {
                    warn!(letter = %record.letter, error = %e, "orphan dismount failed; kept for retry");
                    kept.push(record);
                }
            }
        }

        if let Err(e) = self.save_tracking(&kept) {
            warn!(error = %e, "failed to rewrite mount tracking file");
        }
        recovered
    }

    /// Remove any existing mapping that already points at this root.
    fn drop_stale_mappings(&self, root: &str) {
        for letter in LETTER_POOL {
            if let Ok(Some(target)) = self.backend.current_target(letter) {
                if target.eq_ignore_ascii_case(root) {
                    debug!(letter = %letter, root = %root, "removing stale mapping");
                    let _ = self.backend.unmap(letter);
                    self.untrack_letter(letter);
                }
            }
        }
    }

    /// First free letter scanning Z down to D.
    fn select_letter(&self) -> Result<char> {
        let used: HashSet<char> = self.backend.used_letters()?.into_iter().collect();
        let remembered: HashSet<char> = self.backend.remembered_letters()?.into_iter().collect();
        let reserved = self.reserved.lock();

        LETTER_POOL
            .into_iter()
            .find(|letter| {
                !used.contains(letter) && !remembered.contains(letter) && !reserved.contains(letter)
            })
            .ok_or_else(|| RobocurseError::Other("no drive letters available".to_string()))
    }

    fn untrack_letter(&self, letter: char) {
        let mut records = self.load_tracking();
        records.retain(|record| record.letter != letter);
        if let Err(e) = self.save_tracking(&records) {
            warn!(error = %e, "failed to rewrite mount tracking file");
        }
    }

    #[cfg(test)]
    pub(crate) fn reserved_letters(&self) -> usize {
        self.reserved.lock().len()
    }
}

/// Z..D scan order; A-C stay for floppies and the system drive.
const LETTER_POOL: [char; 23] = [
    'Z', 'Y', 'X', 'W', 'V', 'U', 'T', 'S', 'R', 'Q', 'P', 'O', 'N', 'M', 'L', 'K', 'J', 'I',
    'H', 'G', 'F', 'E', 'D',
];

/// Rewrite a UNC path through a mapped drive letter.
fn map_through_letter(letter: char, unc: &UncPath) -> PathBuf {
    match &unc.relative {
        Some(rel) => PathBuf::from(format!(r"{}:\{}", letter, rel.to_string_lossy())),
        None => PathBuf::from(format!(r"{}:\", letter)),
    }
}

#[cfg(windows)]
mod windows_lock {
    use std::time::Duration;

    use windows::core::HSTRING;
    use windows::Win32::Foundation::{CloseHandle, HANDLE, WAIT_ABANDONED, WAIT_OBJECT_0};
    use windows::Win32::System::Threading::{
        CreateMutexW, ReleaseMutex, WaitForSingleObject,
    };

    use super::{AllocatorGuard, AllocatorLock};
    use crate::error::{RobocurseError, Result};

    /// Named mutex shared by every robocurse process on the machine.
    pub struct NamedAllocatorLock {
        name: String,
    }

    impl NamedAllocatorLock {
        pub fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
            }
        }
    }

    #[derive(Debug)]
    struct NamedGuard {
        handle: HANDLE,
    }

    impl AllocatorGuard for NamedGuard {}

    impl Drop for NamedGuard {
        fn drop(&mut self) {
            unsafe {
                let _ = ReleaseMutex(self.handle);
                let _ = CloseHandle(self.handle);
            }
        }
    }

    impl AllocatorLock for NamedAllocatorLock {
        fn acquire(&self, timeout: Duration) -> Result<Box<dyn AllocatorGuard + '_>> {
            unsafe {
                let handle = CreateMutexW(None, false, &HSTRING::from(self.name.as_str()))
                    .map_err(|e| RobocurseError::Other(format!("allocator mutex: {}", e)))?;

                match WaitForSingleObject(handle, timeout.as_millis() as u32) {
                    // An abandoned mutex still grants ownership.
                    event if event == WAIT_OBJECT_0 || event == WAIT_ABANDONED => {
                        Ok(Box::new(NamedGuard { handle }))
                    }
                    _ => {
                        let _ = CloseHandle(handle);
                        Err(RobocurseError::MountContention)
                    }
                }
            }
        }
    }
}

pub mod memory {
    //! In-memory mount backend for tests

    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    use parking_lot::Mutex;

    use super::MountBackend;
    use crate::config::Credential;
    use crate::error::{Result, RobocurseError};

    #[derive(Default)]
    pub struct MemoryMountBackend {
        pub mappings: Mutex<HashMap<char, String>>,
        pub remembered: Mutex<Vec<char>>,
        pub externally_used: Mutex<Vec<char>>,
        /// When true, probes fail (mount looks dead to the verifier)
        pub unverifiable: AtomicBool,
        /// Next N map calls fail
        pub map_failures: AtomicU32,
        /// Credentials seen by map calls
        pub credentials_seen: Mutex<Vec<Option<String>>>,
    }

    impl MemoryMountBackend {
        pub fn new() -> Self {
            Self::default()
        }
    }

    impl MountBackend for MemoryMountBackend {
        fn used_letters(&self) -> Result<Vec<char>> {
            let mut letters: Vec<char> = self.mappings.lock().keys().copied().collect();
            letters.extend(self.externally_used.lock().iter().copied());
            Ok(letters)
        }

        fn remembered_letters(&self) -> Result<Vec<char>> {
            Ok(self.remembered.lock().clone())
        }

        fn map(&self, letter: char, unc_root: &str, credential: Option<&Credential>) -> Result<()> {
            let failures = self.map_failures.load(Ordering::SeqCst);
            if failures > 0 {
                self.map_failures.store(failures - 1, Ordering::SeqCst);
                return Err(RobocurseError::Other("map failed".to_string()));
            }
            self.credentials_seen
                .lock()
                .push(credential.map(|c| c.username.clone()));
            self.mappings.lock().insert(letter, unc_root.to_string());
            Ok(())
        }

        fn unmap(&self, letter: char) -> Result<()> {
            self.mappings.lock().remove(&letter);
            Ok(())
        }

        fn current_target(&self, letter: char) -> Result<Option<String>> {
            Ok(self.mappings.lock().get(&letter).cloned())
        }

        fn probe(&self, _root: &Path) -> Result<()> {
            if self.unverifiable.load(Ordering::SeqCst) {
                Err(RobocurseError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotConnected,
                    "drive not responding",
                )))
            } else {
                Ok(())
            }
        }
    }
}

#[cfg(windows)]
pub mod windows_backend {
    //! Production mount backend driving `net use`

    use std::path::Path;
    use std::process::Command;

    use super::MountBackend;
    use crate::config::Credential;
    use crate::error::{Result, RobocurseError};

    pub struct NetUseBackend;

    impl NetUseBackend {
        pub fn new() -> Self {
            Self
        }

        fn net_use(args: &[&str]) -> Result<String> {
            let output = Command::new("net.exe")
                .arg("use")
                .args(args)
                .output()
                .map_err(|e| RobocurseError::Other(format!("net use: {}", e)))?;
            let stdout = String::from_utf8_lossy(&output.stdout).to_string();
            if output.status.success() {
                Ok(stdout)
            } else {
                let stderr = String::from_utf8_lossy(&output.stderr).to_string();
                Err(RobocurseError::Other(format!(
                    "net use failed: {} {}",
                    stdout.trim(),
                    stderr.trim()
                )))
            }
        }
    }

    impl MountBackend for NetUseBackend {
        fn used_letters(&self) -> Result<Vec<char>> {
            let mut letters = Vec::new();
            for letter in super::LETTER_POOL {
                if Path::new(&format!(r"{}:\", letter)).exists() {
                    letters.push(letter);
                }
            }
            Ok(letters)
        }

        fn remembered_letters(&self) -> Result<Vec<char>> {
            let output = Self::net_use(&[])?;
            let mut letters = Vec::new();
            for line in output.lines() {
                for letter in super::LETTER_POOL {
                    if line.contains(&format!("{}:", letter)) && line.contains("\\\\") {
                        letters.push(letter);
                    }
                }
            }
            Ok(letters)
        }

        fn map(&self, letter: char, unc_root: &str, credential: Option<&Credential>) -> Result<()> {
            let drive = format!("{}:", letter);
            let mut args = vec![drive.as_str(), unc_root];
            let (user_arg, password);
            if let Some(cred) = credential {
                user_arg = format!("/user:{}", cred.username);
                password = cred.password.clone();
                args.push(password.as_str());
                args.push(user_arg.as_str());
            }
            // Persist so the mapping is visible to spawned copier processes.
            args.push("/persistent:yes");
            Self::net_use(&args).map(|_| ())
        }

        fn unmap(&self, letter: char) -> Result<()> {
            let drive = format!("{}:", letter);
            Self::net_use(&[drive.as_str(), "/delete", "/y"]).map(|_| ())
        }

        fn current_target(&self, letter: char) -> Result<Option<String>> {
            let output = match Self::net_use(&[&format!("{}:", letter)]) {
                Ok(output) => output,
                Err(_) => return Ok(None),
            };
            Ok(output
                .lines()
                .find_map(|line| line.split_whitespace().find(|token| token.starts_with("\\\\")))
                .map(|root| root.to_string()))
        }

        fn probe(&self, root: &Path) -> Result<()> {
            let mut entries = std::fs::read_dir(root)?;
            // Reading one entry proves authentication actually happened.
            let _ = entries.next().transpose()?;
            Ok(())
        }
    }
}
