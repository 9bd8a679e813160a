/*!
 * Directory scanner / profiler
 *
 * Produces per-directory size and file counts for the chunk planner. The
 * planner re-visits subtrees while it searches for split points, so profiles
 * are held in a bounded LRU cache keyed by directory path. The cache is
 * cleared at run reset.
 */

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;
use walkdir::WalkDir;

use crate::error::Result;

/// Size and file-count totals for a directory scope
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirStats {
    pub bytes: u64,
    pub files: u64,
}

impl DirStats {
    pub fn add(&mut self, other: DirStats) {
        self.bytes += other.bytes;
        self.files += other.files;
    }
}

/// Profile of one directory: recursive totals, loose files, and children
#[derive(Debug, Clone)]
pub struct DirProfile {
    pub path: PathBuf,
    /// Recursive totals for the whole subtree
    pub total: DirStats,
    /// Files sitting directly in this directory
    pub loose: DirStats,
    /// Immediate child directories
    pub subdirs: Vec<PathBuf>,
}

/// Bounded cache with least-recently-used eviction.
///
/// Hits re-push the key onto the order queue; stale queue entries are
/// skipped during eviction, keeping both operations O(1) amortized.
struct LruCache {
    capacity: usize,
    entries: HashMap<PathBuf, (u64, Arc<DirProfile>)>,
    order: VecDeque<(u64, PathBuf)>,
    stamp: u64,
}

impl LruCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            order: VecDeque::new(),
            stamp: 0,
        }
    }

    fn get(&mut self, key: &Path) -> Option<Arc<DirProfile>> {
        self.stamp += 1;
        let stamp = self.stamp;
        if let Some((entry_stamp, profile)) = self.entries.get_mut(key) {
            *entry_stamp = stamp;
            let profile = profile.clone();
            self.order.push_back((stamp, key.to_path_buf()));
            Some(profile)
        } else {
            None
        }
    }

    fn insert(&mut self, key: PathBuf, value: Arc<DirProfile>) {
        self.stamp += 1;
        let stamp = self.stamp;
        self.entries.insert(key.clone(), (stamp, value));
        self.order.push_back((stamp, key));
        self.evict();
    }

    fn evict(&mut self) {
        while self.entries.len() > self.capacity {
            match self.order.pop_front() {
                Some((stamp, key)) => {
                    // Only evict when this queue entry is the key's newest use.
                    if self
                        .entries
                        .get(&key)
                        .is_some_and(|(entry_stamp, _)| *entry_stamp == stamp)
                    {
                        self.entries.remove(&key);
                    }
                }
                None => break,
            }
        }
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Profiles directories with caching across planner passes
pub struct DirectoryProfiler {
    cache: Mutex<LruCache>,
}

impl DirectoryProfiler {
    pub fn new() -> Self {
        Self::with_capacity(4096)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Drop all cached profiles (run reset).
    pub fn reset(&self) {
        self.cache.lock().clear();
    }

    /// Profile a directory tree.
    ///
    /// Fails only when the root itself is unreadable. Failures on individual
    /// entries below the root are logged and the walk continues, so one bad
    /// ACL doesn't sink the whole profile.
    pub fn profile(&self, path: &Path) -> Result<Arc<DirProfile>> {
        if let Some(cached) = self.cache.lock().get(path) {
            return Ok(cached);
        }

        // Confirm the root is readable before walking so the caller gets a
        // real error instead of an empty profile.
        std::fs::read_dir(path)?;

        let mut loose = DirStats::default();
        let mut subdirs = Vec::new();

        for entry in WalkDir::new(path).min_depth(1).max_depth(1) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(dir = %path.display(), error = %e, "skipping unreadable entry");
                    continue;
                }
            };
            let file_type = entry.file_type();
            if file_type.is_dir() {
                subdirs.push(entry.into_path());
            } else if file_type.is_file() {
                match entry.metadata() {
                    Ok(meta) => {
                        loose.bytes += meta.len();
                        loose.files += 1;
                    }
                    Err(e) => {
                        warn!(file = %entry.path().display(), error = %e, "skipping unreadable file");
                    }
                }
            }
            // Symlinks and other reparse points are skipped; the copier is
            // told to skip junctions too.
        }

        subdirs.sort();

        let mut total = loose;
        for subdir in &subdirs {
            match self.profile(subdir) {
                Ok(child) => total.add(child.total),
                Err(e) => {
                    warn!(dir = %subdir.display(), error = %e, "skipping unreadable subtree");
                }
            }
        }

        let profile = Arc::new(DirProfile {
            path: path.to_path_buf(),
            total,
            loose,
            subdirs,
        });
        self.cache.lock().insert(path.to_path_buf(), profile.clone());
        Ok(profile)
    }

    #[cfg(test)]
    pub(crate) fn cached_count(&self) -> usize {
        self.cache.lock().len()
    }
}

impl Default for DirectoryProfiler {
    fn default() -> Self {
        Self::new()
    }
}
