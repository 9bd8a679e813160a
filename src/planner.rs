/*!
 * Chunk planner
 *
 * Splits a scanned source tree into bounded work units. Each chunk maps to
 * exactly one copier invocation: one source directory, one destination
 * directory, and a restricted set of extra switches (`/LEV:1` for
 * loose-files chunks). Chunk ids are assigned in emission order from a
 * run-wide monotonic counter, so a given scan always plans the same way.
 */

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{ChunkLimits, Profile, ScanMode};
use crate::error::{RobocurseError, Result};
use crate::scanner::{DirProfile, DirStats, DirectoryProfiler};

pub type ChunkId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChunkStatus {
    Pending,
    Running,
    Complete,
    CompleteWithWarnings,
    Failed,
    Skipped,
}

/// One bounded unit of copy work
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: ChunkId,
    pub source: PathBuf,
    pub destination: PathBuf,
    pub estimated_bytes: u64,
    pub estimated_files: u64,
    /// Restricted extra copier switches (whitelist-validated at launch)
    pub extra_args: Vec<String>,
    pub retry_count: u32,
    /// Earliest wall-clock time this chunk may start
    pub retry_after: Option<DateTime<Utc>>,
    pub status: ChunkStatus,
}

impl Chunk {
    fn new(
        id: ChunkId,
        source: PathBuf,
        destination: PathBuf,
        stats: DirStats,
        extra_args: Vec<String>,
    ) -> Self {
        Self {
            id,
            source,
            destination,
            estimated_bytes: stats.bytes,
            estimated_files: stats.files,
            extra_args,
            retry_count: 0,
            retry_after: None,
            status: ChunkStatus::Pending,
        }
    }

    /// True once the chunk can run (no pending backoff deadline).
    pub fn ready_at(&self, now: DateTime<Utc>) -> bool {
        match self.retry_after {
            Some(after) => now >= after,
            None => true,
        }
    }
}

/// Monotonic chunk-id source, shared across all profiles of a run
#[derive(Debug, Default)]
pub struct ChunkIdGen {
    next: AtomicU64,
}

impl ChunkIdGen {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> ChunkId {
        self.next.fetch_add(1, Ordering::SeqCst)
    }
}

/// Plans chunks for one profile from scanner output
pub struct ChunkPlanner<'a> {
    profiler: &'a DirectoryProfiler,
    ids: &'a ChunkIdGen,
}

impl<'a> ChunkPlanner<'a> {
    pub fn new(profiler: &'a DirectoryProfiler, ids: &'a ChunkIdGen) -> Self {
        Self { profiler, ids }
    }

    /// Plan the whole profile. Emission order is deterministic for a given
    /// scan result.
    pub fn plan(&self, profile: &Profile) -> Result<Vec<Chunk>> {
        let limits = profile.chunk_limits;
        let mut chunks = Vec::new();

        match profile.scan_mode {
            ScanMode::Flat => self.plan_flat(
                &profile.source,
                &profile.source,
                &profile.destination,
                limits,
                &mut chunks,
            )?,
            ScanMode::Smart => self.plan_smart(
                &profile.source,
                &profile.source,
                &profile.destination,
                limits,
                0,
                &mut chunks,
            )?,
        }

        if chunks.is_empty() {
            return Err(RobocurseError::Other(format!(
                "planner produced no chunks for {}",
                profile.source.display()
            )));
        }

        Ok(chunks)
    }

    /// Flat mode: the root's loose files as one `/LEV:1` chunk plus one
    /// chunk per top-level child. When the whole tree fits the bounds the
    /// children collapse into a single root chunk (the expressible form of
    /// sibling merging; see DESIGN.md). An oversize child is handed to the
    /// smart splitter.
    fn plan_flat(
        &self,
        dir: &Path,
        source_root: &Path,
        dest_root: &Path,
        limits: ChunkLimits,
        out: &mut Vec<Chunk>,
    ) -> Result<()> {
        let profile = self.profiler.profile(dir)?;

        if fits(profile.total, limits) {
            out.push(self.whole_tree_chunk(&profile, source_root, dest_root));
            return Ok(());
        }

        out.push(self.loose_files_chunk(&profile, source_root, dest_root));

        for child in &profile.subdirs {
            let child_profile = self.profiler.profile(child)?;
            if fits(child_profile.total, limits) {
                out.push(self.whole_tree_chunk(&child_profile, source_root, dest_root));
            } else {
                self.plan_smart(child, source_root, dest_root, limits, 1, out)?;
            }
        }

        Ok(())
    }

    /// Smart mode: descend until a subtree fits (or depth is exhausted); a
    /// too-large subtree contributes its loose files as a `/LEV:1` chunk
    /// and recurses into each child.
    fn plan_smart(
        &self,
        dir: &Path,
        source_root: &Path,
        dest_root: &Path,
        limits: ChunkLimits,
        depth: u32,
        out: &mut Vec<Chunk>,
    ) -> Result<()> {
        let profile = self.profiler.profile(dir)?;

        let at_depth_limit = depth >= limits.max_depth;
        if fits(profile.total, limits) || at_depth_limit || profile.subdirs.is_empty() {
            out.push(self.whole_tree_chunk(&profile, source_root, dest_root));
            return Ok(());
        }

        out.push(self.loose_files_chunk(&profile, source_root, dest_root));

        for child in &profile.subdirs {
            self.plan_smart(child, source_root, dest_root, limits, depth + 1, out)?;
        }

        Ok(())
    }

    fn whole_tree_chunk(
        &self,
        profile: &DirProfile,
        source_root: &Path,
        dest_root: &Path,
    ) -> Chunk {
        Chunk::new(
            self.ids.next(),
            profile.path.clone(),
            map_destination(&profile.path, source_root, dest_root),
            profile.total,
            Vec::new(),
        )
    }

    fn loose_files_chunk(
        &self,
        profile: &DirProfile,
        source_root: &Path,
        dest_root: &Path,
    ) -> Chunk {
        Chunk::new(
            self.ids.next(),
            profile.path.clone(),
            map_destination(&profile.path, source_root, dest_root),
            profile.loose,
            vec!["/LEV:1".to_string()],
        )
    }
}

fn fits(stats: DirStats, limits: ChunkLimits) -> bool {
    stats.bytes <= limits.max_bytes && stats.files <= limits.max_files
}

/// Re-root a source sub-path onto the destination root.
pub fn map_destination(source_path: &Path, source_root: &Path, dest_root: &Path) -> PathBuf {
    match source_path.strip_prefix(source_root) {
        Ok(rel) if rel.as_os_str().is_empty() => dest_root.to_path_buf(),
        Ok(rel) => dest_root.join(rel),
        Err(_) => dest_root.join(source_path.file_name().unwrap_or_default()),
    }
}
